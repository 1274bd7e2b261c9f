use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential retry delay policy carried on every job record.
///
/// The delay before redelivery after the n-th failed attempt is
/// `initial_delay_ms * multiplier^(n - 1)`, capped at `max_delay_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub initial_delay_ms: u64,
    pub multiplier: u32,
    pub max_delay_ms: u64,
}

impl Backoff {
    pub fn new(initial_delay_ms: u64, multiplier: u32) -> Self {
        Self {
            initial_delay_ms,
            multiplier,
            ..Self::default()
        }
    }

    /// Delay to apply after the given attempt number (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = (self.multiplier as u64).saturating_pow(exp);
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2,
            // one hour; retries this far out almost always mean the
            // dependency is down, not slow
            max_delay_ms: 3_600_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_attempt() {
        let b = Backoff::default();
        assert_eq!(b.delay(1), Duration::from_millis(1_000));
        assert_eq!(b.delay(2), Duration::from_millis(2_000));
        assert_eq!(b.delay(3), Duration::from_millis(4_000));
    }

    #[test]
    fn caps_at_max_delay() {
        let b = Backoff {
            initial_delay_ms: 1_000,
            multiplier: 10,
            max_delay_ms: 5_000,
        };
        assert_eq!(b.delay(4), Duration::from_millis(5_000));
    }

    #[test]
    fn attempt_zero_treated_as_first() {
        let b = Backoff::default();
        assert_eq!(b.delay(0), b.delay(1));
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let b = Backoff::default();
        assert_eq!(b.delay(u32::MAX), Duration::from_millis(3_600_000));
    }
}
