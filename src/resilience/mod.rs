//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Caller work unit + Selection
//!     → executor.rs (PickNode → Call → Delay state machine)
//!     → timeouts.rs (overall deadline, per-call cap)
//!     → On failure: retries.rs (classify retryable vs fatal)
//!     → backoff.rs (delay before the next attempt)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every operation has an absolute deadline
//! - Only transient transport conditions are retried
//! - Call backoff paces one operation; node backoff (health) governs eligibility
//! - Exactly one terminal outcome per operation

pub mod backoff;
pub mod executor;
pub mod retries;
pub mod timeouts;

pub use executor::{CallContext, RetryExecutor, Selection};
pub use retries::RetryPolicy;
