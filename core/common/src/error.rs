//! Common error types for the Folio sync engine.

use thiserror::Error;

/// Top-level error type for sync engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local embedded store failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Transport-level failure talking to the remote authority.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote authority answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The remote table was truncated while a feed subscription was live.
    #[error("Feed conflict: {0}")]
    FeedConflict(String),

    /// Payload rejected before it reached the queue.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether the error is worth another attempt on the next flush or reconnect.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::Io(_) => true,
            Error::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
