//! Resilient client-side network layer.
//!
//! Tracks a pool of remote endpoints, derives each endpoint's health from
//! call outcomes, picks endpoints for calls while avoiding bad ones, retries
//! failed calls with bounded exponential backoff under a deadline, and swaps
//! the whole endpoint set at runtime without dropping in-flight work.

pub mod client;
pub mod config;
pub mod health;
pub mod network;
pub mod observability;
pub mod resilience;
pub mod streaming;
pub mod transport;

pub use client::{Client, ClientBuilder, ClientError};
pub use config::schema::NetworkConfig;
pub use network::{Endpoint, ExecuteError, NetworkEntry, NetworkError, NetworkResult, NodePool, PoolSettings};
pub use resilience::{CallContext, RetryExecutor, RetryPolicy, Selection};
pub use transport::{Code, Connection, Transport, TransportError};
