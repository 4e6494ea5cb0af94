//! Lock error types.

use thiserror::Error;

/// Errors raised while acquiring or releasing leases.
///
/// Finding a lease held by another replica is not an error.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("invalid lease configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;
