//! Exponential backoff with jitter for registry retries.
use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay before retry `attempt` (1-based) without jitter:
    /// `min(base * 2^(attempt-1), max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// [`delay`](Self::delay) plus up to 10% random jitter.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let jitter_range = delay.as_millis() as u64 / 10;
        let jitter = if jitter_range > 0 {
            rand::rng().random_range(0..jitter_range)
        } else {
            0
        };
        delay + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_capped() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(3));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(2));
        assert_eq!(backoff.delay(4), Duration::from_secs(3));
        assert_eq!(backoff.delay(40), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2));
        for attempt in 1..8 {
            let base = backoff.delay(attempt);
            let jittered = backoff.delay_with_jitter(attempt);
            assert!(jittered >= base);
            assert!(jittered <= base + base / 10);
        }
    }
}
