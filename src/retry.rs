//! Retry scheduling with exponential backoff and jitter.
//!
//! Delay before attempt `n + 1` is `retry_delay * 2^(n-1)` plus a uniform
//! jitter in `[0, retry_delay)`, clamped to the engine-wide maximum.

use std::time::Duration;

use rand::Rng;

pub const DEFAULT_MAX_BACKOFF_SECONDS: u64 = 3600;

/// What to do after a retryable attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryScheduler {
    max_backoff: Duration,
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BACKOFF_SECONDS)
    }
}

impl RetryScheduler {
    pub fn new(max_backoff_seconds: u64) -> Self {
        Self {
            max_backoff: Duration::from_secs(max_backoff_seconds),
        }
    }

    /// Whether `attempt` (1-based) may be followed by another one
    pub fn should_retry(&self, attempt: u32, max_retries: u32) -> bool {
        attempt < max_retries.saturating_add(1)
    }

    /// Deterministic part of the delay after failed attempt `attempt`
    pub fn base_delay(&self, attempt: u32, retry_delay_seconds: u64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let secs = retry_delay_seconds.saturating_mul(1u64 << exponent);
        Duration::from_secs(secs).min(self.max_backoff)
    }

    /// Base delay plus jitter, clamped to the maximum backoff
    pub fn next_delay(&self, attempt: u32, retry_delay_seconds: u64) -> Duration {
        let base = self.base_delay(attempt, retry_delay_seconds);
        let jitter_ms = retry_delay_seconds.saturating_mul(1000);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..jitter_ms))
        };
        (base + jitter).min(self.max_backoff)
    }

    pub fn decide(&self, attempt: u32, max_retries: u32, retry_delay_seconds: u64) -> RetryDecision {
        if self.should_retry(attempt, max_retries) {
            RetryDecision::Retry {
                delay: self.next_delay(attempt, retry_delay_seconds),
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}
