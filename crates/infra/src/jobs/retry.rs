//! Retry policy: capped exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// What to do with a job whose handler just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue with the new attempt count after `delay`.
    Retry { attempts: u32, delay: Duration },
    /// Retries exhausted; fail terminally with `attempts = max_attempts`.
    Exhausted { attempts: u32 },
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// `min(max_delay, base_delay * 2^(attempt-1))` for 1-indexed `attempt`.
    ///
    /// Saturates instead of overflowing for large attempt counts.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    /// Decide retry vs terminal failure for a job that has already had
    /// `attempts` retries scheduled.
    ///
    /// The failure that would bring the count to `max_attempts` is terminal.
    pub fn decide(&self, attempts: u32, max_attempts: u32) -> RetryDecision {
        let next = attempts.saturating_add(1);
        if next >= max_attempts {
            RetryDecision::Exhausted {
                attempts: max_attempts,
            }
        } else {
            RetryDecision::Retry {
                attempts: next,
                delay: self.delay_for_attempt(next),
            }
        }
    }
}
