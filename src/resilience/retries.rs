//! Retry policy and outcome classification.
//!
//! # Responsibilities
//! - Hold the attempt budget, call backoff bounds and deadlines of an operation
//! - Decide whether a transport error is worth another attempt
//!
//! # Design Decisions
//! - Unavailable and resource-exhausted are always retryable
//! - Internal errors are retryable only when the peer reset the stream
//! - Streams additionally retry not-found, since the server may not have the data yet
//! - Call backoff is independent of node backoff

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

use crate::network::types::{NetworkError, NetworkResult};
use crate::transport::{Code, TransportError};

/// Floor for the maximum backoff of a subscription.
pub const MIN_SUBSCRIPTION_MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Attempt budget and pacing of one logical operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    min_backoff: Duration,
    max_backoff: Duration,
    request_timeout: Duration,
    call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
            request_timeout: Duration::from_secs(120),
            call_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, min_backoff: Duration, max_backoff: Duration) -> NetworkResult<Self> {
        let policy = Self {
            max_attempts,
            min_backoff,
            max_backoff,
            ..Self::default()
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Defaults for server-streaming subscriptions.
    pub fn subscription_default() -> Self {
        Self {
            max_attempts: 10,
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            request_timeout: Duration::MAX,
            call_timeout: None,
        }
    }

    pub fn validate(&self) -> NetworkResult<()> {
        if self.max_attempts == 0 {
            return Err(NetworkError::InvalidPolicy("max attempts must be greater than zero".into()));
        }
        if self.min_backoff > self.max_backoff {
            return Err(NetworkError::InvalidPolicy(format!(
                "min backoff {:?} exceeds max backoff {:?}",
                self.min_backoff, self.max_backoff
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(NetworkError::InvalidPolicy("request timeout must be non-zero".into()));
        }
        Ok(())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn min_backoff(&self) -> Duration {
        self.min_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout
    }

    pub fn set_max_attempts(&mut self, max_attempts: u32) -> NetworkResult<()> {
        if max_attempts == 0 {
            return Err(NetworkError::InvalidPolicy("max attempts must be greater than zero".into()));
        }
        self.max_attempts = max_attempts;
        Ok(())
    }

    pub fn set_min_backoff(&mut self, min_backoff: Duration) -> NetworkResult<()> {
        if min_backoff > self.max_backoff {
            return Err(NetworkError::InvalidPolicy(format!(
                "min backoff {:?} exceeds max backoff {:?}",
                min_backoff, self.max_backoff
            )));
        }
        self.min_backoff = min_backoff;
        Ok(())
    }

    pub fn set_max_backoff(&mut self, max_backoff: Duration) -> NetworkResult<()> {
        if max_backoff < self.min_backoff {
            return Err(NetworkError::InvalidPolicy(format!(
                "max backoff {:?} is below min backoff {:?}",
                max_backoff, self.min_backoff
            )));
        }
        self.max_backoff = max_backoff;
        Ok(())
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Per-attempt deadline. `None` bounds attempts by the request deadline only.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Subscription policies also need a max backoff of at least 500ms.
    pub fn validate_for_subscription(&self) -> NetworkResult<()> {
        self.validate()?;
        if self.max_backoff < MIN_SUBSCRIPTION_MAX_BACKOFF {
            return Err(NetworkError::InvalidPolicy(format!(
                "subscription max backoff must be at least {:?}",
                MIN_SUBSCRIPTION_MAX_BACKOFF
            )));
        }
        Ok(())
    }
}

fn rst_stream_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?is).*\brst[^0-9a-zA-Z]stream\b.*").ok())
        .as_ref()
}

/// Whether `message` says the peer reset the stream.
pub fn is_stream_reset(message: &str) -> bool {
    rst_stream_pattern().is_some_and(|re| re.is_match(message))
}

/// Classification for unary calls.
pub fn is_retryable(error: &TransportError) -> bool {
    match error.code {
        Code::Unavailable | Code::ResourceExhausted => true,
        Code::Internal => is_stream_reset(&error.message),
        _ => false,
    }
}

/// Classification for server streams.
pub fn is_retryable_for_stream(error: &TransportError) -> bool {
    error.code == Code::NotFound || is_retryable(error)
}

/// Wrap a unary call failure as `Transient` or `Fatal`.
pub fn classify(error: TransportError) -> NetworkError {
    if is_retryable(&error) {
        NetworkError::Transient(error)
    } else {
        NetworkError::Fatal(error)
    }
}

/// Wrap a stream failure as `Transient` or `Fatal`.
pub fn classify_for_stream(error: TransportError) -> NetworkError {
    if is_retryable_for_stream(&error) {
        NetworkError::Transient(error)
    } else {
        NetworkError::Fatal(error)
    }
}
