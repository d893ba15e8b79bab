//! Block-storage error types.

use thiserror::Error;
use volprov_core::RetryError;

/// Block-storage operation errors.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("volume {0} already exists")]
    AlreadyExists(String),

    #[error("volume {0} does not exist")]
    NotFound(String),

    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {output}")]
    CommandFailed {
        tool: String,
        status: String,
        output: String,
    },

    #[error("unexpected {tool} output: {detail}")]
    UnexpectedOutput { tool: String, detail: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        source: Box<BlockError>,
    },
}

impl BlockError {
    pub(crate) fn from_retry(err: RetryError<BlockError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, source } => Self::RetriesExhausted {
                attempts,
                source: Box::new(source),
            },
            RetryError::Cancelled => Self::Cancelled,
        }
    }
}

/// Result type for block-storage operations.
pub type BlockResult<T> = std::result::Result<T, BlockError>;
