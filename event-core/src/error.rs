//! Error types for the event core

use thiserror::Error;

/// Result type for event core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Event core errors
#[derive(Error, Debug)]
pub enum Error {
    /// Event failed validation (malformed payload, empty entity id)
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Log storage error (append, partition scan)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Query index error (SQLite)
    #[error("Index error: {0}")]
    Index(String),

    /// Persisted state unreadable; recovery required
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lock acquisition or cross-process coordination error
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Index(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
