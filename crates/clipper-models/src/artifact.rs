//! Stored clip artifacts and per-job processing results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error_code::ErrorCode;

/// A clip persisted by the artifact store.
///
/// `sha256` is the lowercase hex digest of the exact bytes on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipArtifact {
    /// Path relative to the store root, e.g. `2024-05-01/title_job.mp4`
    pub relative_path: String,
    pub sha256: String,
    pub byte_size: u64,
    /// File name component of `relative_path`
    pub filename: String,
    pub created_at: DateTime<Utc>,
}

/// Public view of a finished clip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub download_url: String,
    pub size: u64,
    pub sha256: String,
    pub title: String,
    pub filename: String,
}

/// Outcome of processing one clip request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub job_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Wall-clock processing time in seconds
    pub processing_time: f64,
}

impl ProcessingResult {
    pub fn succeeded(job_id: impl Into<String>, artifact: ArtifactSummary, processing_time: f64) -> Self {
        Self {
            job_id: job_id.into(),
            success: true,
            artifact: Some(artifact),
            error_code: None,
            error_message: None,
            processing_time,
        }
    }

    /// Failed result carrying only the code and its user-safe message.
    pub fn failed(job_id: impl Into<String>, code: ErrorCode, processing_time: f64) -> Self {
        Self {
            job_id: job_id.into(),
            success: false,
            artifact: None,
            error_code: Some(code),
            error_message: Some(code.user_message().to_string()),
            processing_time,
        }
    }
}
