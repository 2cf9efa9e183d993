//! Structured job logging utilities.
//!
//! Every line carries the job id and operation so a single clip can be
//! followed through acquisition, trimming and storage.

use tracing::{error, info, warn, Span};

use clipper_models::{ErrorCode, Stage};

/// Job logger for structured logging with consistent formatting.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    operation: String,
}

impl JobLogger {
    pub fn new(job_id: &str, operation: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job started: {}", message
        );
    }

    /// Log the completion of a pipeline stage.
    pub fn log_stage(&self, stage: Stage, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            stage = %stage,
            "Stage done: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job warning: {}", message
        );
    }

    /// Log a failure with its full detail. Observers only ever see `code`.
    pub fn log_failure(&self, code: ErrorCode, detail: &str) {
        error!(
            job_id = %self.job_id,
            operation = %self.operation,
            error_code = %code,
            "Job failed: {}", detail
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Span wrapping every log line emitted while the job runs.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            operation = %self.operation
        )
    }
}
