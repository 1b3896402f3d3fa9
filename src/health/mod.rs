//! Node health subsystem.
//!
//! # Data Flow
//! ```text
//! Attempt outcome classified by the executor
//!     → passive.rs (success / retryable / fatal feedback)
//!     → state.rs (per-node exponential backoff window)
//!     → pool drops the node from the healthy set
//!
//! Next selection
//!     → readmission.rs (is a sweep due?)
//!     → nodes past their readmit time rejoin the healthy set
//! ```
//!
//! # Design Decisions
//! - Health is derived only from observed calls, there are no active probes
//! - Backoff is reversible; eviction (bad-call threshold) is not
//! - Health state is per-node, not per-pool

pub mod passive;
pub mod readmission;
pub mod state;
