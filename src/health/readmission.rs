//! Readmission schedule.
//!
//! The pool only sweeps its unhealthy nodes once `now` passes
//! `earliest`, so steady-state selection never scans the whole node set.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct ReadmitSchedule {
    earliest: Instant,
    min_readmit: Duration,
    max_readmit: Duration,
}

impl ReadmitSchedule {
    pub fn new(min_readmit: Duration, max_readmit: Duration, now: Instant) -> Self {
        Self {
            earliest: now,
            min_readmit,
            max_readmit: max_readmit.max(min_readmit),
        }
    }

    /// Whether a sweep should run.
    pub fn is_due(&self, now: Instant) -> bool {
        now > self.earliest
    }

    pub fn earliest(&self) -> Instant {
        self.earliest
    }

    /// Recompute after a sweep from the readmit times of nodes still backing off,
    /// clamped to `[now + min_readmit, now + max_readmit]`.
    pub fn reschedule<I>(&mut self, now: Instant, pending: I)
    where
        I: IntoIterator<Item = Instant>,
    {
        let upper = now + self.max_readmit;
        let lower = now + self.min_readmit;

        let next = pending
            .into_iter()
            .filter(|t| *t > now)
            .fold(upper, |acc, t| acc.min(t));

        self.earliest = next.max(lower);
    }

    /// A node just backed off until `readmit_time`. Pull the next sweep forward if needed.
    pub fn note_readmit(&mut self, readmit_time: Instant) {
        if readmit_time < self.earliest {
            self.earliest = readmit_time;
        }
    }

    /// Force a sweep on the next selection.
    pub fn reset(&mut self, now: Instant) {
        self.earliest = now;
    }

    pub fn set_bounds(&mut self, min_readmit: Duration, max_readmit: Duration) {
        self.min_readmit = min_readmit;
        self.max_readmit = max_readmit.max(min_readmit);
    }

    pub fn bounds(&self) -> (Duration, Duration) {
        (self.min_readmit, self.max_readmit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(v: u64) -> Duration {
        Duration::from_secs(v)
    }

    #[test]
    fn test_due_is_strict() {
        let now = Instant::now();
        let schedule = ReadmitSchedule::new(secs(8), secs(3600), now);
        assert!(!schedule.is_due(now));
        assert!(schedule.is_due(now + Duration::from_millis(1)));
    }

    #[test]
    fn test_reschedule_takes_minimum_pending() {
        let now = Instant::now();
        let mut schedule = ReadmitSchedule::new(secs(8), secs(3600), now);
        schedule.reschedule(now, vec![now + secs(60), now + secs(20), now + secs(90)]);
        assert_eq!(schedule.earliest(), now + secs(20));
    }

    #[test]
    fn test_reschedule_clamps() {
        let now = Instant::now();
        let mut schedule = ReadmitSchedule::new(secs(8), secs(3600), now);

        schedule.reschedule(now, vec![now + secs(1)]);
        assert_eq!(schedule.earliest(), now + secs(8));

        schedule.reschedule(now, Vec::new());
        assert_eq!(schedule.earliest(), now + secs(3600));

        schedule.reschedule(now, vec![now + secs(7200)]);
        assert_eq!(schedule.earliest(), now + secs(3600));
    }

    #[test]
    fn test_note_readmit_only_moves_earlier() {
        let now = Instant::now();
        let mut schedule = ReadmitSchedule::new(secs(8), secs(3600), now);
        schedule.reschedule(now, Vec::new());

        schedule.note_readmit(now + secs(4000));
        assert_eq!(schedule.earliest(), now + secs(3600));

        schedule.note_readmit(now + secs(10));
        assert_eq!(schedule.earliest(), now + secs(10));
    }
}
