//! Shared network types and error definitions.

use std::fmt;
use std::hash::Hash;
use thiserror::Error;

use crate::network::endpoint::Endpoint;
use crate::transport::TransportError;

/// Logical identity of a server member. One key may map to several endpoints.
pub trait NodeKey: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> NodeKey for T where T: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

/// One (logical key, endpoint) pair of the desired network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkEntry<K> {
    pub key: K,
    pub endpoint: Endpoint,
}

impl<K> NetworkEntry<K> {
    pub fn new(key: K, endpoint: Endpoint) -> Self {
        Self { key, endpoint }
    }
}

/// Errors raised by the pool and the retry machinery.
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    /// Retryable transport failure (unreachable, exhausted, stream reset).
    #[error("transient transport error: {0}")]
    Transient(TransportError),

    /// Any other transport failure. Never retried.
    #[error("transport error: {0}")]
    Fatal(TransportError),

    /// Retryable failures kept happening until the attempt budget ran out.
    #[error("max attempts exceeded, last error: {0}")]
    MaxAttemptsExceeded(TransportError),

    /// Selection found zero eligible nodes.
    #[error("no healthy node available")]
    NoHealthyNode,

    /// Overall deadline exceeded.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid endpoint '{address}': {reason}")]
    InvalidEndpoint { address: String, reason: String },

    #[error("no node for key {0}")]
    UnknownKey(String),

    #[error("invalid retry policy: {0}")]
    InvalidPolicy(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("network is closed")]
    Closed,
}

impl NetworkError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetworkError::Timeout(_))
    }
}

/// Result type for pool operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// The single terminal error of an execute-with-retry operation.
#[derive(Debug, Clone, Error)]
#[error("{kind} (attempts: {attempts}, last node: {})", .last_node.as_deref().unwrap_or("none"))]
pub struct ExecuteError {
    #[source]
    pub kind: NetworkError,
    pub attempts: u32,
    pub last_node: Option<String>,
}

impl ExecuteError {
    pub fn new(kind: NetworkError, attempts: u32, last_node: Option<String>) -> Self {
        Self {
            kind,
            attempts,
            last_node,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ExecuteError::new(
            NetworkError::MaxAttemptsExceeded(TransportError::unavailable("down")),
            3,
            Some("0.0.4@h2:50211".to_string()),
        );
        let text = err.to_string();
        assert!(text.contains("attempts: 3"));
        assert!(text.contains("0.0.4@h2:50211"));

        let err = ExecuteError::new(NetworkError::NoHealthyNode, 1, None);
        assert!(err.to_string().contains("last node: none"));
    }
}
