use thiserror::Error;
use tributary_client::errors::ReceiverError;
use tributary_core::errors::StateError;

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed snapshot: {0}")]
    Format(String),

    #[error("object store {operation} '{path}': {source}")]
    Storage {
        operation: &'static str,
        path: String,
        #[source]
        source: opendal::Error,
    },

    #[error("invalid storage configuration: {0}")]
    Config(String),

    #[error("state repository error: {0}")]
    State(#[from] StateError),

    #[error("consumption failed: {0}")]
    Receiver(#[from] ReceiverError),

    #[error("snapshot task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl SnapshotError {
    pub(crate) fn storage(operation: &'static str, path: impl Into<String>) -> impl FnOnce(opendal::Error) -> SnapshotError {
        let path = path.into();
        move |source| SnapshotError::Storage {
            operation,
            path,
            source,
        }
    }
}
