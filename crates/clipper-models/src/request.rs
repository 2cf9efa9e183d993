//! Clip requests and their validation.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use validator::{Validate, ValidationError as FieldError};

use crate::utils::is_valid_job_id;

/// Default maximum clip length in seconds.
pub const DEFAULT_MAX_DURATION_SECS: f64 = 180.0;

/// Default minimum clip length in seconds (exclusive lower bound is `start < end`).
pub const DEFAULT_MIN_DURATION_SECS: f64 = 0.0;

/// A request to extract `[start_ts, end_ts]` from a remote video.
///
/// Created by an external dispatcher and handed to the worker as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ClipRequest {
    /// Opaque job identifier, also used in the output filename
    #[validate(length(min = 1, max = 128), custom(function = "validate_job_id"))]
    pub job_id: String,

    /// Remote video URL
    #[validate(url)]
    pub source_url: String,

    /// Clip start in seconds
    pub start_ts: f64,

    /// Clip end in seconds
    pub end_ts: f64,

    /// Preferred origin format id (e.g. "137")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, max = 64))]
    pub format_hint: Option<String>,
}

impl ClipRequest {
    pub fn new(
        job_id: impl Into<String>,
        source_url: impl Into<String>,
        start_ts: f64,
        end_ts: f64,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            source_url: source_url.into(),
            start_ts,
            end_ts,
            format_hint: None,
        }
    }

    pub fn with_format_hint(mut self, hint: impl Into<String>) -> Self {
        self.format_hint = Some(hint.into());
        self
    }

    /// Requested clip length in seconds.
    pub fn duration(&self) -> f64 {
        self.end_ts - self.start_ts
    }
}

fn validate_job_id(job_id: &str) -> Result<(), FieldError> {
    if is_valid_job_id(job_id) {
        Ok(())
    } else {
        Err(FieldError::new("job_id_charset"))
    }
}

/// Bounds applied by [`validate`].
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub min_duration_secs: f64,
    pub max_duration_secs: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_duration_secs: DEFAULT_MIN_DURATION_SECS,
            max_duration_secs: DEFAULT_MAX_DURATION_SECS,
        }
    }
}

/// Reasons a clip request is rejected before any work starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("timestamps must be finite and non-negative (start={start}, end={end})")]
    InvalidTimestamp { start: f64, end: f64 },

    #[error("end ({end}s) must be after start ({start}s)")]
    EndNotAfterStart { start: f64, end: f64 },

    #[error("clip duration {duration:.3}s outside allowed range [{min}s, {max}s]")]
    DurationOutOfRange { duration: f64, min: f64, max: f64 },

    #[error("unsupported source URL: {0}")]
    UnsupportedUrl(String),

    #[error("invalid request field: {0}")]
    InvalidField(String),
}

/// A request that passed [`validate`]. Only obtainable through validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidRequest(ClipRequest);

impl ValidRequest {
    pub fn job_id(&self) -> &str {
        &self.0.job_id
    }

    pub fn source_url(&self) -> &str {
        &self.0.source_url
    }

    pub fn start(&self) -> f64 {
        self.0.start_ts
    }

    pub fn end(&self) -> f64 {
        self.0.end_ts
    }

    pub fn duration(&self) -> f64 {
        self.0.duration()
    }

    pub fn format_hint(&self) -> Option<&str> {
        self.0.format_hint.as_deref()
    }

    pub fn into_inner(self) -> ClipRequest {
        self.0
    }
}

/// Validate a clip request. Pure; performs no I/O.
pub fn validate(
    request: &ClipRequest,
    config: &ValidationConfig,
) -> Result<ValidRequest, ValidationError> {
    let (start, end) = (request.start_ts, request.end_ts);

    if !start.is_finite() || !end.is_finite() || start < 0.0 {
        return Err(ValidationError::InvalidTimestamp { start, end });
    }

    if end <= start {
        return Err(ValidationError::EndNotAfterStart { start, end });
    }

    let duration = end - start;
    if duration < config.min_duration_secs || duration > config.max_duration_secs {
        return Err(ValidationError::DurationOutOfRange {
            duration,
            min: config.min_duration_secs,
            max: config.max_duration_secs,
        });
    }

    request
        .validate()
        .map_err(|e| ValidationError::InvalidField(e.to_string()))?;

    check_source_url(&request.source_url)?;

    Ok(ValidRequest(request.clone()))
}

fn check_source_url(raw: &str) -> Result<(), ValidationError> {
    let parsed = Url::parse(raw.trim())
        .map_err(|e| ValidationError::UnsupportedUrl(format!("{}: {}", raw, e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ValidationError::UnsupportedUrl(format!(
                "scheme '{}' is not allowed",
                other
            )))
        }
    }

    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(ValidationError::UnsupportedUrl(format!("{} has no host", raw)));
    }

    Ok(())
}
