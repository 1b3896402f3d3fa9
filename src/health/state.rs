//! Per-node backoff state.
//!
//! # State Transitions
//! ```text
//! increase(now): readmit_time = now + current; current = min(current * 2, max)
//! decrease():    current = max(current / 2, min)
//! healthy(now):  readmit_time <= now
//! ```
//!
//! # Design Decisions
//! - `readmit_time` is computed from the backoff in effect before doubling
//! - Halving on success means trust comes back gradually, not all at once
//! - Time is always passed in, so tests drive it with tokio's paused clock

use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff window of one node.
#[derive(Debug, Clone)]
pub struct HealthState {
    current_backoff: Duration,
    min_backoff: Duration,
    max_backoff: Duration,
    readmit_time: Instant,
}

impl HealthState {
    /// A fresh node starts healthy at the minimum backoff.
    pub fn new(min_backoff: Duration, max_backoff: Duration, now: Instant) -> Self {
        let max_backoff = max_backoff.max(min_backoff);
        Self {
            current_backoff: min_backoff,
            min_backoff,
            max_backoff,
            readmit_time: now,
        }
    }

    pub fn is_healthy(&self, now: Instant) -> bool {
        self.readmit_time <= now
    }

    /// Record a retryable failure.
    pub fn increase(&mut self, now: Instant) {
        self.readmit_time = now + self.current_backoff;
        self.current_backoff = self
            .current_backoff
            .saturating_mul(2)
            .min(self.max_backoff);
    }

    /// Record a success.
    pub fn decrease(&mut self) {
        self.current_backoff = (self.current_backoff / 2).max(self.min_backoff);
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }

    pub fn min_backoff(&self) -> Duration {
        self.min_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn readmit_time(&self) -> Instant {
        self.readmit_time
    }

    /// Time left until readmission, zero when already healthy.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.readmit_time.saturating_duration_since(now)
    }

    /// Change the lower bound. A node sitting at the old minimum follows it.
    pub fn set_min_backoff(&mut self, min_backoff: Duration) {
        if self.current_backoff == self.min_backoff {
            self.current_backoff = min_backoff;
        }
        self.min_backoff = min_backoff;
        self.max_backoff = self.max_backoff.max(min_backoff);
        self.clamp();
    }

    pub fn set_max_backoff(&mut self, max_backoff: Duration) {
        self.max_backoff = max_backoff.max(self.min_backoff);
        self.clamp();
    }

    pub fn set_readmit_time(&mut self, readmit_time: Instant) {
        self.readmit_time = readmit_time;
    }

    fn clamp(&mut self) {
        self.current_backoff = self
            .current_backoff
            .clamp(self.min_backoff, self.max_backoff);
    }
}
