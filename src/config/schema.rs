//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a network
//! client. All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::network::endpoint::Endpoint;
use crate::network::pool::PoolSettings;
use crate::network::types::{NetworkEntry, NetworkResult};
use crate::resilience::retries::RetryPolicy;

/// Root configuration for the network client.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct NetworkConfig {
    /// (key, address) pairs making up the network.
    pub nodes: Vec<NodeConfig>,

    /// Per-node backoff, readmission and eviction.
    pub node_health: NodeHealthConfig,

    /// Retry configuration for unary calls.
    pub retries: RetryConfig,

    /// Retry configuration for subscriptions.
    pub subscriptions: SubscriptionConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    pub transport: TransportConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// One endpoint of the network.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Logical key, e.g. "0.0.3". Several nodes may share one key.
    pub key: String,

    /// Address as "host:port".
    pub address: String,
}

/// Node health configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeHealthConfig {
    /// Backoff after a node's first failure, in milliseconds.
    pub min_backoff_ms: u64,

    /// Upper bound of a node's backoff, in milliseconds.
    pub max_backoff_ms: u64,

    /// Minimum time between readmission sweeps, in milliseconds.
    pub min_readmit_ms: u64,

    /// Maximum time between readmission sweeps, in milliseconds.
    pub max_readmit_ms: u64,

    /// Bad calls before a node is evicted (0 = never).
    pub max_node_attempts: u64,
}

impl Default for NodeHealthConfig {
    fn default() -> Self {
        Self {
            min_backoff_ms: 8_000,
            max_backoff_ms: 3_600_000,
            min_readmit_ms: 8_000,
            max_readmit_ms: 3_600_000,
            max_node_attempts: 0,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts per operation.
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds.
    pub min_backoff_ms: u64,

    /// Maximum delay between retries in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_backoff_ms: 250,
            max_backoff_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub max_attempts: u32,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Overall deadline of one operation, retries included, in seconds.
    pub request_secs: u64,

    /// Deadline of a single attempt in seconds.
    pub call_secs: u64,

    /// Budget for closing nodes on removal or shutdown in seconds.
    pub close_secs: u64,

    /// Connection establishment timeout in seconds.
    pub connect_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 120,
            call_secs: 10,
            close_secs: 30,
            connect_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    /// Use the TLS port of every node.
    pub transport_security: bool,

    /// Cap on fan-out size. Unset means a third of the keys.
    pub max_nodes_per_request: Option<usize>,
}

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

impl NetworkConfig {
    /// Desired network entries. Fails on the first unparsable address.
    pub fn entries(&self) -> NetworkResult<Vec<NetworkEntry<String>>> {
        self.nodes
            .iter()
            .map(|n| Ok(NetworkEntry::new(n.key.clone(), Endpoint::parse(&n.address)?)))
            .collect()
    }

    pub fn pool_settings(&self) -> PoolSettings {
        let health = &self.node_health;
        PoolSettings {
            min_node_backoff: Duration::from_millis(health.min_backoff_ms),
            max_node_backoff: Duration::from_millis(health.max_backoff_ms),
            min_readmit: Duration::from_millis(health.min_readmit_ms),
            max_readmit: Duration::from_millis(health.max_readmit_ms),
            max_node_attempts: health.max_node_attempts,
            close_timeout: Duration::from_secs(self.timeouts.close_secs),
            transport_security: self.transport.transport_security,
            max_nodes_per_request: self.transport.max_nodes_per_request,
        }
    }

    pub fn retry_policy(&self) -> NetworkResult<RetryPolicy> {
        let policy = RetryPolicy::new(
            self.retries.max_attempts,
            Duration::from_millis(self.retries.min_backoff_ms),
            Duration::from_millis(self.retries.max_backoff_ms),
        )?
        .with_request_timeout(Duration::from_secs(self.timeouts.request_secs))
        .with_call_timeout(Some(Duration::from_secs(self.timeouts.call_secs)));
        policy.validate()?;
        Ok(policy)
    }

    pub fn subscription_policy(&self) -> NetworkResult<RetryPolicy> {
        let policy = RetryPolicy::new(
            self.subscriptions.max_attempts,
            Duration::from_millis(self.subscriptions.min_backoff_ms),
            Duration::from_millis(self.subscriptions.max_backoff_ms),
        )?
        .with_request_timeout(Duration::MAX)
        .with_call_timeout(None);
        policy.validate_for_subscription()?;
        Ok(policy)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.connect_secs)
    }
}
