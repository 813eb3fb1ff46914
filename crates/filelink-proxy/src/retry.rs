use std::time::Duration;

/// Default maximum attempts per remote fetch, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(4);
const DEFAULT_MULTIPLIER: u32 = 2;

/// Bounded exponential backoff for `RemoteUnavailable` failures.
///
/// The schedule is fixed (no jitter): with defaults the waits before
/// attempts 2, 3 and 4 are 250ms, 500ms and 1s.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// How long to wait after `failed_attempts` consecutive failures, or
    /// `None` when the attempt budget is spent.
    pub fn delay_for(&self, failed_attempts: u32) -> Option<Duration> {
        if failed_attempts == 0 || failed_attempts >= self.max_attempts {
            return None;
        }
        let factor = self.multiplier.saturating_pow(failed_attempts - 1);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}
