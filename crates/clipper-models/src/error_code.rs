//! Closed error code taxonomy exposed to job observers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Short, user-visible error code attached to a failed job.
///
/// Raw error detail never leaves the worker logs; observers only see the code
/// and [`ErrorCode::user_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "ValidationError")]
    Validation,
    #[serde(rename = "FormatNotAvailableError")]
    FormatNotAvailable,
    #[serde(rename = "DownloadError")]
    Download,
    #[serde(rename = "VideoAnalysisError")]
    VideoAnalysis,
    #[serde(rename = "H264DimensionError")]
    H264Dimension,
    #[serde(rename = "FFmpegError")]
    Ffmpeg,
    #[serde(rename = "TrimError")]
    Trim,
    #[serde(rename = "StorageError")]
    Storage,
    /// Job was cancelled or exceeded its overall time budget.
    #[serde(rename = "Cancelled")]
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "ValidationError",
            ErrorCode::FormatNotAvailable => "FormatNotAvailableError",
            ErrorCode::Download => "DownloadError",
            ErrorCode::VideoAnalysis => "VideoAnalysisError",
            ErrorCode::H264Dimension => "H264DimensionError",
            ErrorCode::Ffmpeg => "FFmpegError",
            ErrorCode::Trim => "TrimError",
            ErrorCode::Storage => "StorageError",
            ErrorCode::Cancelled => "Cancelled",
        }
    }

    /// Short message safe to show to the requester.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "The clip request is invalid.",
            ErrorCode::FormatNotAvailable => "The requested format is not available for this video.",
            ErrorCode::Download => "The source video could not be downloaded.",
            ErrorCode::VideoAnalysis => "The source video could not be analyzed.",
            ErrorCode::H264Dimension => "The clip could not be encoded with valid dimensions.",
            ErrorCode::Ffmpeg => "The clip could not be encoded.",
            ErrorCode::Trim => "The clip could not be trimmed to the requested window.",
            ErrorCode::Storage => "The clip could not be stored.",
            ErrorCode::Cancelled => "Processing was cancelled.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_taxonomy_name() {
        let json = serde_json::to_string(&ErrorCode::Ffmpeg).unwrap();
        assert_eq!(json, "\"FFmpegError\"");

        let parsed: ErrorCode = serde_json::from_str("\"H264DimensionError\"").unwrap();
        assert_eq!(parsed, ErrorCode::H264Dimension);
    }

    #[test]
    fn test_display_matches_serde_name() {
        for code in [
            ErrorCode::Validation,
            ErrorCode::FormatNotAvailable,
            ErrorCode::Download,
            ErrorCode::VideoAnalysis,
            ErrorCode::H264Dimension,
            ErrorCode::Ffmpeg,
            ErrorCode::Trim,
            ErrorCode::Storage,
            ErrorCode::Cancelled,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json.trim_matches('"'), code.to_string());
        }
    }
}
