use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Transient network error: {0}")]
    Transient(String),

    #[error("Remote record not found: {0}")]
    NotFound(String),

    #[error("No known parent for local path: {0}")]
    UnknownParent(PathBuf),

    #[error("Local sync root was removed; refusing to continue")]
    RootRemoved,

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl SyncError {
    /// True for errors the remote client retries once before giving up.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    /// True for errors that must abort the engine rather than the current
    /// operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::RootRemoved)
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
