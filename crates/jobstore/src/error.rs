//! Job store error types.

use thiserror::Error;

/// Job store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Result type for job store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
