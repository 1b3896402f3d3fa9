//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check node entries (parsable addresses, non-empty keys, no duplicates)
//! - Validate value ranges (min <= max, attempts and timeouts > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: NetworkConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;

use crate::config::schema::NetworkConfig;
use crate::network::endpoint::Endpoint;
use crate::resilience::retries::MIN_SUBSCRIPTION_MAX_BACKOFF;

/// One semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field, e.g. `nodes[2].address`.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub fn validate_config(config: &NetworkConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    for (i, node) in config.nodes.iter().enumerate() {
        if node.key.trim().is_empty() {
            errors.push(ValidationError::new(format!("nodes[{}].key", i), "must not be empty"));
        }
        match Endpoint::parse(&node.address) {
            Ok(endpoint) => {
                if !seen.insert((node.key.clone(), endpoint)) {
                    errors.push(ValidationError::new(
                        format!("nodes[{}]", i),
                        format!("duplicate entry {} @ {}", node.key, node.address),
                    ));
                }
            }
            Err(e) => errors.push(ValidationError::new(format!("nodes[{}].address", i), e.to_string())),
        }
    }

    let health = &config.node_health;
    check_range(&mut errors, "node_health.*_backoff_ms", health.min_backoff_ms, health.max_backoff_ms);
    check_range(&mut errors, "node_health.*_readmit_ms", health.min_readmit_ms, health.max_readmit_ms);

    if config.retries.max_attempts == 0 {
        errors.push(ValidationError::new("retries.max_attempts", "must be greater than 0"));
    }
    check_range(
        &mut errors,
        "retries.*_backoff_ms",
        config.retries.min_backoff_ms,
        config.retries.max_backoff_ms,
    );

    let subs = &config.subscriptions;
    if subs.max_attempts == 0 {
        errors.push(ValidationError::new("subscriptions.max_attempts", "must be greater than 0"));
    }
    check_range(&mut errors, "subscriptions.*_backoff_ms", subs.min_backoff_ms, subs.max_backoff_ms);
    if (subs.max_backoff_ms as u128) < MIN_SUBSCRIPTION_MAX_BACKOFF.as_millis() {
        errors.push(ValidationError::new(
            "subscriptions.max_backoff_ms",
            format!("must be at least {}", MIN_SUBSCRIPTION_MAX_BACKOFF.as_millis()),
        ));
    }

    let timeouts = &config.timeouts;
    for (field, value) in [
        ("timeouts.request_secs", timeouts.request_secs),
        ("timeouts.call_secs", timeouts.call_secs),
        ("timeouts.close_secs", timeouts.close_secs),
        ("timeouts.connect_secs", timeouts.connect_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    if config.transport.max_nodes_per_request == Some(0) {
        errors.push(ValidationError::new("transport.max_nodes_per_request", "must be greater than 0"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<std::net::SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "must be a socket address",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_range(errors: &mut Vec<ValidationError>, field: &str, min: u64, max: u64) {
    if min > max {
        errors.push(ValidationError::new(
            field,
            format!("minimum {} exceeds maximum {}", min, max),
        ));
    }
}
