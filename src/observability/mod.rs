//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! pool, executor, subscriptions
//!     → tracing events ("execute" span carries operation_id)
//!     → metrics.rs (attempt outcomes, node backoff, node counts)
//!
//! Binary only:
//!     → logging.rs installs the fmt subscriber
//!     → metrics::init_metrics serves the Prometheus scrape endpoint
//! ```
//!
//! The library never installs a subscriber or recorder on its own.

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
