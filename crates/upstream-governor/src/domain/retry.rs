//! Retry decisions and exponential backoff with bounded jitter.
//!
//! ```text
//! delay(attempt) = min(initial_delay * backoff_base^attempt + U(0, jitter), max_delay)
//! ```

use crate::domain::config::RetryConfig;
use crate::domain::error::ExecutorError;
use rand::Rng;
use std::time::Duration;

/// Retry policy derived from [`RetryConfig`]
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Whether a request that has already been retried `retries` times
    /// should be attempted again after failing with `error`
    pub fn should_retry(&self, error: &ExecutorError, retries: u32) -> bool {
        error.is_retryable() && retries < self.config.max_retries
    }

    /// Delay before retry number `attempt` (0-based), jitter included
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = self.config.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.delay_with_jitter(attempt, Duration::from_millis(jitter))
    }

    /// Deterministic part of [`Self::delay_for`]
    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        let max_ms = self.config.max_delay.as_millis() as f64;
        let exponential = self.config.initial_delay.as_millis() as f64
            * self.config.backoff_base.powi(attempt.min(i32::MAX as u32) as i32);
        let total = exponential + jitter.as_millis() as f64;

        let capped = if total.is_finite() {
            total.min(max_ms)
        } else {
            max_ms
        };
        Duration::from_millis(capped as u64)
    }
}
