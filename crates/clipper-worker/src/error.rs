//! Worker error types.

use std::time::Duration;
use thiserror::Error;

use clipper_models::{ErrorCode, ValidationError};

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Media error: {0}")]
    Media(#[from] clipper_media::MediaError),

    #[error("Storage error: {0}")]
    Storage(#[from] clipper_storage::StorageError),

    #[error("Progress error: {0}")]
    Progress(#[from] clipper_progress::ProgressError),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Job exceeded its {}s time budget", .0.as_secs())]
    TimedOut(Duration),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Job-level code reported to observers.
    pub fn code(&self) -> ErrorCode {
        match self {
            WorkerError::Validation(_) => ErrorCode::Validation,
            WorkerError::Media(e) => e.code(),
            WorkerError::Storage(e) => e.code(),
            WorkerError::Progress(e) => e.code(),
            WorkerError::Cancelled | WorkerError::TimedOut(_) => ErrorCode::Cancelled,
            // Only the job workspace is touched directly by the worker
            WorkerError::ConfigError(_) | WorkerError::Io(_) => ErrorCode::Storage,
        }
    }

    /// Whether the job was stopped from outside rather than failing on its own.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, WorkerError::Cancelled | WorkerError::TimedOut(_))
    }
}
