//! Backend error types.

use thiserror::Error;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors that can occur while submitting, inspecting or killing applications.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The external command failed.
    #[error("{command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The application is unknown to the backend.
    #[error("application not found: {0}")]
    NotFound(String),

    /// Session parameters or backend settings cannot produce a submission.
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    /// The submission did not finish in time.
    #[error("submission timed out after {0}s")]
    Timeout(u64),

    /// The launch queue is no longer accepting work.
    #[error("launch queue closed")]
    QueueClosed,

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}
