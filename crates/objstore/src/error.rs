//! Object-store error types.

use thiserror::Error;
use volprov_core::RetryError;

/// Object-store operation errors.
#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    Auth(String),

    #[error("invalid object URL: {0}")]
    InvalidUrl(String),

    #[error("object too large for bounded read: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("download incomplete: got {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store transport error: {0}")]
    Transport(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        source: Box<ObjectError>,
    },
}

impl ObjectError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Io(_) | Self::SizeMismatch { .. }
        )
    }

    pub(crate) fn from_retry(err: RetryError<ObjectError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, source } => Self::RetriesExhausted {
                attempts,
                source: Box::new(source),
            },
            RetryError::Cancelled => Self::Cancelled,
        }
    }
}

/// Result type for object-store operations.
pub type ObjectResult<T> = std::result::Result<T, ObjectError>;
