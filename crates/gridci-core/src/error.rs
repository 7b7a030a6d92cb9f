//! Error types shared across the GridCI engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported bundle format version: {0}")]
    UnsupportedFormat(String),

    #[error("job is already being processed: {0}")]
    AlreadyProcessing(String),

    #[error("job has already been processed: {0}")]
    AlreadyProcessed(String),

    #[error("concurrent modification: {0}")]
    Conflict(String),

    #[error("sandbox execution failed: {0}")]
    ExecutionFailed(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is a recoverable concurrency conflict rather
    /// than a real failure. Callers treat these as "not this time".
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::AlreadyProcessing(_) | Error::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
