//! Node pool subsystem.
//!
//! # Data Flow
//! ```text
//! Caller picks a selection mode
//!     → pool.rs (readmission sweep, eviction, then select):
//!         - random.rs (uniform pick from the healthy set)
//!         - distinct-key fan-out with fallback to nodes in backoff
//!     → node.rs (lazy connection, in-flight tracking)
//!     → outcome fed back through pool.rs (increase/decrease backoff)
//!
//! Reconfiguration:
//!     desired entries → reconcile.rs → one atomic topology update
//! ```
//!
//! # Design Decisions
//! - One async mutex guards all topology indices; per-node health has its own guard
//! - Randomness is injected, so tests pick nodes deterministically
//! - Nodes are matched on (key, endpoint), since one key may have many endpoints

pub mod endpoint;
pub mod node;
pub mod pool;
pub mod random;
pub mod reconcile;
pub mod types;

pub use endpoint::Endpoint;
pub use node::{CloseOutcome, Node, NodeSnapshot};
pub use pool::{NodePool, PoolSettings, PoolSnapshot};
pub use random::RandomSelector;
pub use reconcile::ReconcileReport;
pub use types::{ExecuteError, NetworkEntry, NetworkError, NetworkResult, NodeKey};
