//! Exponential call backoff.

use std::time::Duration;

/// Delay before the retry that follows failed attempt number `attempt` (1-based).
///
/// `base * 2^(attempt - 1)`, capped at `max`. Attempt 0 has no delay.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponential_base = 2u32.saturating_pow(attempt - 1);
    base.saturating_mul(exponential_base).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff(0, ms(250), ms(8000)), Duration::ZERO);
        assert_eq!(calculate_backoff(1, ms(250), ms(8000)), ms(250));
        assert_eq!(calculate_backoff(2, ms(250), ms(8000)), ms(500));
        assert_eq!(calculate_backoff(3, ms(250), ms(8000)), ms(1000));
        assert_eq!(calculate_backoff(6, ms(250), ms(8000)), ms(8000));
        assert_eq!(calculate_backoff(40, ms(250), ms(8000)), ms(8000));
    }
}
