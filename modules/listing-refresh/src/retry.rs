use std::time::Duration;

use rand::Rng;

use listing_common::Config;

/// Exponential backoff for transient failures.
///
/// `max_attempts` counts every attempt, the first delivery included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(2),
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.retry_max_attempts,
            base: config.retry_base,
            cap: config.retry_cap,
        }
    }

    /// Whether a failed `attempt` may be followed by another one.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt that follows `attempt`, without jitter:
    /// `base * 2^(attempt - 1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// [`backoff`](Self::backoff) plus up to 10% random jitter, still capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        let max_jitter = (delay.as_millis() / 10) as u64;
        let jitter = if max_jitter > 0 {
            rand::rng().random_range(0..=max_jitter)
        } else {
            0
        };
        (delay + Duration::from_millis(jitter)).min(self.cap)
    }
}
