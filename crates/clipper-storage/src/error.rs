//! Storage error types.

use thiserror::Error;

use clipper_models::ErrorCode;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid storage configuration: {0}")]
    ConfigError(String),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Invalid job id: {0}")]
    InvalidJobId(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn write_failed(msg: impl Into<String>) -> Self {
        Self::WriteFailed(msg.into())
    }

    /// Every storage failure surfaces as a storage error.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::Storage
    }
}
