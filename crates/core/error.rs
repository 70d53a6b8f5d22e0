//! Error types for the netsched job queue.

use thiserror::Error;

use crate::job::JobId;

/// The main error type for the netsched library.
///
/// Lifecycle races such as completing an already canceled job are not
/// errors; those come back as [`crate::Outcome::NoOp`].
#[derive(Error, Debug)]
pub enum NsError {
    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Socket or file I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job not found (never submitted, or already purged).
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Queue not found in the registry.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Caller host is not in the queue allow-list.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Malformed request such as an oversized payload.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Transient store conflict (deadlock, busy database). Retryable.
    #[error("Store conflict: {0}")]
    Conflict(String),

    /// A retryable operation kept conflicting past its attempt bound.
    #[error("Retry limit exceeded after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: String },

    /// The store returned data that cannot be trusted any more.
    #[error("Store corruption: {0}")]
    Corruption(String),

    /// Backend-specific error.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl NsError {
    /// Whether the operation may succeed if simply run again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NsError::Conflict(_))
    }

    /// Whether the server can no longer guarantee correctness and must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NsError::Corruption(_))
    }
}

/// Result type alias using NsError.
pub type Result<T> = std::result::Result<T, NsError>;
