use thiserror::Error;
use tributary_core::errors::CoreError;

pub type Result<T> = std::result::Result<T, ReceiverError>;

/// Errors reported by a [`LogSource`](crate::LogSource).
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("position '{position}' of partition {partition_id} is no longer retained")]
    InvalidPosition {
        partition_id: String,
        position: String,
    },

    #[error("cursor of partition {partition_id} has expired")]
    ExpiredCursor { partition_id: String },

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("log source unavailable: {0}")]
    Unavailable(String),

    #[error("partition {partition_id} of channel {channel} is closed")]
    Closed { channel: String, partition_id: String },

    #[error("log source error: {0}")]
    Other(String),
}

impl SourceError {
    /// Transient errors that are worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Throttled(_) | SourceError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("log source error: {0}")]
    Source(#[from] SourceError),

    #[error("giving up on partition {partition_id} after {attempts} attempts: {source}")]
    RetriesExhausted {
        partition_id: String,
        attempts: usize,
        #[source]
        source: SourceError,
    },

    #[error("partition task failed: {0}")]
    TaskFailed(String),

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}
