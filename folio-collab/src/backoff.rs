//! Exponential backoff with a ceiling, shared by reconnects and save retries.

use std::time::Duration;

/// Doubling delay schedule: `initial * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    pub fn from_millis(initial_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(initial_ms), Duration::from_millis(max_ms))
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    pub fn ceiling(&self) -> Duration {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_ceiling() {
        let backoff = Backoff::from_millis(100, 1_000);
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_millis(1_000));
        assert_eq!(backoff.delay(30), Duration::from_millis(1_000));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let backoff = Backoff::from_millis(250, 30_000);
        assert_eq!(backoff.delay(u32::MAX), backoff.ceiling());
    }

    #[test]
    fn test_ceiling_never_below_initial() {
        let backoff = Backoff::from_millis(500, 100);
        assert_eq!(backoff.delay(0), Duration::from_millis(500));
        assert_eq!(backoff.ceiling(), Duration::from_millis(500));
    }
}
