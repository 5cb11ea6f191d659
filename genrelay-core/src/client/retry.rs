use std::time::Duration;

use crate::error::GenRelayError;

/// Bounded exponential backoff for client calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `base * 2^retry`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base.saturating_mul(1u32 << retry.min(16))
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|n| self.delay_for(n))
    }

    pub fn should_retry(&self, err: &GenRelayError, retries_done: u32) -> bool {
        retries_done < self.max_retries && err.is_retryable()
    }
}
