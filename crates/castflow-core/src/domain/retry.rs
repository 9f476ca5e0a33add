//! Retry policy: backoff delays and the elapsed-time budget.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for failed job attempts.
///
/// A job may keep retrying for `max_retry_time` measured from its first start.
/// A retry is only scheduled if, after waiting, at least `safety_buffer` of the
/// budget would remain for the attempt itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total time budget from the first attempt.
    pub max_retry_time: Duration,

    /// Delay before the first transient retry.
    pub base_delay: Duration,

    /// Upper bound for exponential backoff.
    pub max_delay: Duration,

    /// Budget that must remain after the delay.
    pub safety_buffer: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_time: Duration::from_secs(60 * 60),
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(5 * 60),
            safety_buffer: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff for a transient failure.
    ///
    /// delay = min(base_delay * 2^(attempt - 1), max_delay)
    ///
    /// With the default policy (10s base, 5min cap):
    /// - attempt 1: 10s
    /// - attempt 2: 20s
    /// - attempt 3: 40s
    /// - attempt 6: 300s (capped)
    pub fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Budget left at `elapsed` since the first attempt started.
    pub fn time_left(&self, elapsed: Duration) -> Duration {
        self.max_retry_time.saturating_sub(elapsed)
    }

    /// Would waiting `delay` still leave room for the attempt?
    pub fn fits_budget(&self, elapsed: Duration, delay: Duration) -> bool {
        self.time_left(elapsed) >= delay.saturating_add(self.safety_buffer)
    }
}
