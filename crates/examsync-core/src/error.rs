//! Error types for examsync-core

use thiserror::Error;

/// Result type alias using examsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in examsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Local persistence could not be opened; callers degrade to in-memory
    #[error("Local storage unavailable: {0}")]
    StorageUnavailable(String),

    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transient network failure; retried with backoff, never fatal per se
    #[error("Network error: {0}")]
    Network(String),

    /// A queued mutation exceeded the retry ceiling and was dead-lettered
    #[error("Retry ceiling exceeded for {collection} after {attempts} attempts")]
    RetryExhausted { collection: String, attempts: u32 },

    /// Finalize was called while the attempt is already terminal remotely.
    /// Callers treat this as success, not failure.
    #[error("Attempt {0} is already finalized")]
    FinalizeConflict(String),

    /// Finalize aborted because local records did not all reach the remote.
    /// Nothing is discarded; a later retry can finalize once they land.
    #[error("Attempt {session_id} still has {pending} unsynced records, finalize aborted")]
    FinalizeIncomplete { session_id: String, pending: usize },

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed payload rejected before it enters the store or queue
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error should be treated as a successful finalize.
    pub const fn is_finalize_conflict(&self) -> bool {
        matches!(self, Self::FinalizeConflict(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Self::Network(error.to_string())
    }
}
