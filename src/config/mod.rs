//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, all errors at once)
//!     → NetworkConfig (validated, immutable)
//!     → Client::apply_config (settings, security, reconcile)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → update channel → Client::spawn_config_updates
//!     → atomic swap of Arc<NetworkConfig>
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - An invalid reload is logged and dropped; the running config stays

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    NetworkConfig, NodeConfig, NodeHealthConfig, ObservabilityConfig, RetryConfig,
    SubscriptionConfig, TimeoutConfig, TransportConfig,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
