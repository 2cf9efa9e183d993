//! Error types for media operations.

use std::path::PathBuf;
use thiserror::Error;

use clipper_models::ErrorCode;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while acquiring, analyzing or trimming media.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("FFprobe not found in PATH")]
    FfprobeNotFound,

    #[error("yt-dlp not found in PATH")]
    YtDlpNotFound,

    #[error("FFmpeg command failed: {message}")]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("FFprobe command failed: {message}")]
    FfprobeFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("Download failed: {message}")]
    DownloadFailed { message: String },

    #[error("Format '{format}' not available: {message}")]
    FormatNotAvailable { format: String, message: String },

    #[error("Video analysis failed: {0}")]
    VideoAnalysis(String),

    #[error("Output has odd dimensions {width}x{height}, H.264 requires even width and height")]
    H264Dimension { width: u32, height: u32 },

    #[error("Trim failed: {0}")]
    Trim(String),

    #[error("Invalid client persona: {0}")]
    InvalidPersona(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{tool} timed out after {secs} seconds")]
    Timeout { tool: &'static str, secs: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl MediaError {
    /// Create an FFmpeg failure error.
    pub fn ffmpeg_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    pub fn ffprobe_failed(message: impl Into<String>, stderr: Option<String>) -> Self {
        Self::FfprobeFailed {
            message: message.into(),
            stderr,
        }
    }

    /// Create a download failure error.
    pub fn download_failed(message: impl Into<String>) -> Self {
        Self::DownloadFailed {
            message: message.into(),
        }
    }

    pub fn format_not_available(format: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FormatNotAvailable {
            format: format.into(),
            message: message.into(),
        }
    }

    pub fn video_analysis(message: impl Into<String>) -> Self {
        Self::VideoAnalysis(message.into())
    }

    pub fn trim(message: impl Into<String>) -> Self {
        Self::Trim(message.into())
    }

    pub fn invalid_persona(message: impl Into<String>) -> Self {
        Self::InvalidPersona(message.into())
    }

    /// Map to the job-level error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            MediaError::YtDlpNotFound
            | MediaError::DownloadFailed { .. }
            | MediaError::InvalidPersona(_) => ErrorCode::Download,
            MediaError::FormatNotAvailable { .. } => ErrorCode::FormatNotAvailable,
            MediaError::VideoAnalysis(_) | MediaError::FileNotFound(_) => ErrorCode::VideoAnalysis,
            MediaError::H264Dimension { .. } => ErrorCode::H264Dimension,
            MediaError::FfmpegNotFound
            | MediaError::FfprobeNotFound
            | MediaError::FfmpegFailed { .. }
            | MediaError::FfprobeFailed { .. }
            | MediaError::JsonParse(_) => ErrorCode::Ffmpeg,
            MediaError::Timeout { tool, .. } if *tool == crate::command::YT_DLP => ErrorCode::Download,
            MediaError::Timeout { .. } => ErrorCode::Ffmpeg,
            MediaError::Trim(_) | MediaError::Io(_) => ErrorCode::Trim,
            MediaError::Cancelled => ErrorCode::Cancelled,
        }
    }

    /// Whether the origin rejected the requested format.
    pub fn is_format_rejection(&self) -> bool {
        matches!(self, MediaError::FormatNotAvailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(MediaError::download_failed("x").code(), ErrorCode::Download);
        assert_eq!(
            MediaError::format_not_available("137", "x").code(),
            ErrorCode::FormatNotAvailable
        );
        assert_eq!(
            MediaError::H264Dimension { width: 1, height: 2 }.code(),
            ErrorCode::H264Dimension
        );
        assert_eq!(MediaError::ffmpeg_failed("x", None, Some(1)).code(), ErrorCode::Ffmpeg);
        assert_eq!(MediaError::trim("x").code(), ErrorCode::Trim);
        assert_eq!(MediaError::video_analysis("x").code(), ErrorCode::VideoAnalysis);
        assert_eq!(MediaError::Cancelled.code(), ErrorCode::Cancelled);
    }

    #[test]
    fn test_timeout_code_depends_on_tool() {
        let download = MediaError::Timeout {
            tool: crate::command::YT_DLP,
            secs: 5,
        };
        let encode = MediaError::Timeout {
            tool: crate::command::FFMPEG,
            secs: 5,
        };
        assert_eq!(download.code(), ErrorCode::Download);
        assert_eq!(encode.code(), ErrorCode::Ffmpeg);
    }
}
