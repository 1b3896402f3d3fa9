//! Metrics collection and exposition.
//!
//! # Metrics
//! - `network_attempts_total` (counter): call attempts by endpoint, outcome
//! - `network_node_backoff_ms` (gauge): current backoff per endpoint
//! - `network_nodes` (gauge): node count by state (all, healthy)
//! - `network_evictions_total` (counter): nodes evicted for too many bad calls
//! - `network_reconcile_changes_total` (counter): nodes added/removed by reconfiguration
//! - `network_subscription_reconnects_total` (counter): streams reopened after a failure
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so library users pay nothing
//! - Labels are endpoints and outcome names, never request content

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

/// Record the outcome of one call attempt.
pub fn record_attempt(endpoint: &str, outcome: &'static str) {
    metrics::counter!(
        "network_attempts_total",
        "endpoint" => endpoint.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_node_backoff(endpoint: &str, backoff: Duration) {
    metrics::gauge!("network_node_backoff_ms", "endpoint" => endpoint.to_string())
        .set(backoff.as_millis() as f64);
}

/// Record pool size after a topology or health-membership change.
pub fn record_nodes(total: usize, healthy: usize) {
    metrics::gauge!("network_nodes", "state" => "all").set(total as f64);
    metrics::gauge!("network_nodes", "state" => "healthy").set(healthy as f64);
}

pub fn record_eviction(count: usize) {
    metrics::counter!("network_evictions_total").increment(count as u64);
}

pub fn record_reconcile(added: usize, removed: usize) {
    metrics::counter!("network_reconcile_changes_total", "change" => "added")
        .increment(added as u64);
    metrics::counter!("network_reconcile_changes_total", "change" => "removed")
        .increment(removed as u64);
}

pub fn record_subscription_reconnect() {
    metrics::counter!("network_subscription_reconnects_total").increment(1);
}

/// Install the Prometheus recorder and serve it on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Prometheus exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install Prometheus exporter"),
    }
}
