//! Transport boundary.
//!
//! # Data Flow
//! ```text
//! Node::get_connection()
//!     → Transport::connect(endpoint)   (lazily, once per node)
//!     → Arc<Connection> cached on the node
//!
//! RetryExecutor attempt
//!     → in_flight.rs (track the call so close() can drain it)
//!     → caller's work unit runs against the connection
//!     → TransportError { code, message } on failure
//! ```
//!
//! # Design Decisions
//! - The core never looks inside requests or responses
//! - Status codes mirror the usual RPC status set so outcome
//!   classification stays transport-agnostic
//! - Connections are only shut down or aborted, never mutated

pub mod in_flight;
pub mod tcp;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::network::endpoint::Endpoint;

/// Status code attached to a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Internal,
    Unavailable,
    Unimplemented,
}

impl Code {
    /// Stable lowercase name, used for logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Cancelled => "cancelled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::NotFound => "not_found",
            Code::PermissionDenied => "permission_denied",
            Code::ResourceExhausted => "resource_exhausted",
            Code::FailedPrecondition => "failed_precondition",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::Unimplemented => "unimplemented",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    pub code: Code,
    pub message: String,
}

impl TransportError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }
}

/// A live connection to one endpoint.
///
/// Shared behind an `Arc` by every call running against the node.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Graceful shutdown. Resolves once the underlying resource is released.
    async fn shutdown(&self);

    /// Immediate cancellation of anything still outstanding on the connection.
    fn abort(&self);
}

/// Factory for connections. Implemented by the RPC layer sitting on top of the pool.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a connection and wait until it is usable.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Connection, TransportError>;
}
