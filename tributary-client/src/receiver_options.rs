use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry_manager::RetryManager;

/// Configuration options for log receivers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverOptions {
    // Maximum number of retry attempts for cursor acquisition
    pub max_retries: usize,
    // Base backoff in milliseconds for linear backoff
    pub base_backoff_ms: u64,
    // Maximum backoff cap in milliseconds
    pub max_backoff_ms: u64,
    // Wait after an empty batch while not far behind the head
    pub poll_interval_ms: u64,
    // How long sibling partition tasks get to finish after a failure
    pub shutdown_grace_ms: u64,
    // Progress is logged every n messages per partition; 0 disables progress logging
    pub log_every_n_messages: u64,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
            poll_interval_ms: 500,
            shutdown_grace_ms: 30_000,
            log_every_n_messages: 10_000,
        }
    }
}

impl ReceiverOptions {
    pub fn retry_manager(&self) -> RetryManager {
        RetryManager::new(self.max_retries, self.base_backoff_ms, self.max_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
