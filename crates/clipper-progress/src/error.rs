//! Progress reporting errors.

use thiserror::Error;

use clipper_models::{ErrorCode, TransitionError};

pub type ProgressResult<T> = Result<T, ProgressError>;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl ProgressError {
    /// Progress persistence is part of the storage layer.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::Storage
    }
}
