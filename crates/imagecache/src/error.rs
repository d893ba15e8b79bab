//! Image cache error types.

use thiserror::Error;

/// Image cache operation errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid cache token: {0}")]
    InvalidToken(String),

    #[error("invalid checksum: {0}")]
    InvalidChecksum(String),

    #[error("path escapes cache root: {0}")]
    PathEscape(String),
}

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
