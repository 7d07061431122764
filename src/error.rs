//! Error types for the watcher and storage layers.

use thiserror::Error;

/// Errors raised while constructing or running a directory watcher.
#[derive(Error, Debug)]
pub enum WatchError {
    /// Watch path must be absolute.
    #[error("path must be absolute: {0}")]
    NotAbsolute(String),

    /// Watch path has no file name pattern.
    #[error("path has no file name pattern: {0}")]
    MissingPattern(String),

    /// File name pattern does not compile.
    #[error("invalid file name pattern {pattern}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Notify error.
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors raised by the storage engine.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A previous holder of the connection panicked.
    #[error("storage connection lock poisoned")]
    Poisoned,

    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// The writer has been stopped.
    #[error("storage is closed")]
    Closed,
}
