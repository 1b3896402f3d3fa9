//! Passive health checking.
//!
//! # Responsibilities
//! - Turn the classified outcome of a call into node health feedback
//! - Record per-endpoint attempt metrics
//!
//! # Design Decisions
//! - Only retryable failures count against a node
//! - Fatal failures are the caller's problem, not the node's
//! - Feedback applies whether or not the operation is retried afterwards

use std::sync::Arc;

use crate::network::node::Node;
use crate::network::pool::NodePool;
use crate::network::types::NodeKey;
use crate::observability::metrics;
use crate::transport::Transport;

/// Classified outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    Success,
    RetryableFailure,
    FatalFailure,
}

impl Feedback {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feedback::Success => "success",
            Feedback::RetryableFailure => "retryable",
            Feedback::FatalFailure => "fatal",
        }
    }
}

/// Apply `feedback` for an attempt made against `node`.
pub async fn record<K: NodeKey, T: Transport>(
    pool: &NodePool<K, T>,
    node: &Arc<Node<K, T>>,
    feedback: Feedback,
) {
    metrics::record_attempt(&node.endpoint().to_string(), feedback.as_str());
    match feedback {
        Feedback::Success => pool.decrease_backoff(node),
        Feedback::RetryableFailure => {
            pool.increase_backoff(node).await;
            tracing::debug!(
                node = %node.label(),
                backoff_ms = node.current_backoff().as_millis() as u64,
                bad_calls = node.bad_call_count(),
                "Node backed off"
            );
        }
        Feedback::FatalFailure => {}
    }
}
