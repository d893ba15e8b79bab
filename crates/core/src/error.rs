//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid checksum: {0}")]
    InvalidChecksum(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid request: {}", .0.join("; "))]
    Validation(Vec<String>),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
