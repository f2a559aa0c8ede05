use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Error type returned by message consumers and interceptors supplied by applications.
pub type ConsumerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid key pattern '{pattern}': {source}")]
    InvalidKeyPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("unable to decode payload: {0}")]
    PayloadDecode(#[from] serde_json::Error),

    #[error("state repository error: {0}")]
    State(#[from] StateError),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state repository '{name}' unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    #[error("iteration aborted: {0}")]
    Aborted(String),
}
