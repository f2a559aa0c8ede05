use rand::{rng, Rng};
use std::time::Duration;

use crate::errors::SourceError;

/// Retry policy for log source requests: bounded attempts, linear backoff and jitter.
#[derive(Debug, Clone)]
pub struct RetryManager {
    max_retries: usize,
    base_backoff_ms: u64,
    max_backoff_ms: u64,
}

impl RetryManager {
    /// Zero values select the defaults (5 retries, 200 ms base, 5 s cap).
    pub fn new(max_retries: usize, base_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries: if max_retries == 0 { 5 } else { max_retries },
            base_backoff_ms: if base_backoff_ms == 0 {
                200
            } else {
                base_backoff_ms
            },
            max_backoff_ms: if max_backoff_ms == 0 {
                5_000
            } else {
                max_backoff_ms
            },
        }
    }

    /// Get the maximum number of retries
    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Throttling and temporary unavailability are retried; everything else is final.
    pub fn is_retryable_error(&self, error: &SourceError) -> bool {
        error.is_retryable()
    }

    /// Calculate linear backoff with jitter
    pub fn calculate_backoff(&self, attempt: usize) -> Duration {
        // Linear backoff: base * (attempt + 1), capped at max
        let linear = self.base_backoff_ms.saturating_mul(attempt as u64 + 1);
        let backoff = linear.min(self.max_backoff_ms);
        let jitter = rng().random_range(backoff / 2..=backoff); // 50-100% jitter
        Duration::from_millis(jitter)
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        RetryManager::new(0, 0, 0)
    }
}
