//! Client-side retry policy.
//!
//! Retries apply only to transient failures: `Unavailable`, deadline
//! timeouts, and `ResourceExhausted`. Everything else surfaces to the
//! caller on the first attempt.

use std::time::Duration;

use connectplugin_core::Error;

/// Exponential backoff retry settings.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `1` disables retries.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Backoff growth factor between retries.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry as i32);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }

    /// Whether `error` is worth another attempt.
    pub fn should_retry(&self, error: &Error, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts && error.is_retryable()
    }
}
