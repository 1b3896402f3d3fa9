//! Absolute deadlines.
//!
//! Every externally visible operation derives one of these up front and
//! checks it before each attempt and while waiting.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Instant);

impl Deadline {
    /// Deadline `timeout` from now. Saturates for very large timeouts.
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        Self(now.checked_add(timeout).unwrap_or_else(|| far_future(now)))
    }

    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }

    /// The earlier of this deadline and `now + timeout`.
    pub fn cap(&self, timeout: Duration) -> Instant {
        Instant::now()
            .checked_add(timeout)
            .map_or(self.0, |t| t.min(self.0))
    }
}

/// Roughly thirty years out, comfortably within `Instant` range.
fn far_future(now: Instant) -> Instant {
    now + Duration::from_secs(86400 * 365 * 30)
}
