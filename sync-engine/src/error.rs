//! Error types for the sync engine

use thiserror::Error;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Sync engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Queue at capacity; the entry was rejected visibly
    #[error("Offline queue full ({capacity} entries); event {event_id} not queued")]
    QueueFull {
        /// Configured hard cap
        capacity: usize,
        /// The rejected event
        event_id: String,
    },

    /// Queue storage error (SQLite)
    #[error("Queue storage error: {0}")]
    QueueStorage(String),

    /// Transport failure (network, remote service)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Authentication/authorization failure (401-class)
    #[error("Auth error: {0}")]
    Auth(String),

    /// Operation exceeded its timeout
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error from the event core
    #[error(transparent)]
    Core(#[from] event_core::Error),

    /// Scheduler mailbox closed or worker gone
    #[error("Scheduler unavailable: {0}")]
    Scheduler(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::QueueStorage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
