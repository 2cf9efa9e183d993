//! Source media, probe metadata and trim plans.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Source media downloaded into the job work directory.
///
/// Deleted by the orchestrator once trimming finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquiredMedia {
    /// Path of the downloaded file
    pub local_path: PathBuf,
    /// Format id or selector that was downloaded
    pub selected_format_id: String,
    /// Container extension (e.g. "mp4", "webm")
    pub container_ext: String,
    /// Client persona whose attempt succeeded
    pub persona: String,
    /// File size in bytes
    pub byte_size: u64,
}

/// Kind of an elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Other,
}

/// One elementary stream from a container probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub index: u32,
    pub kind: StreamKind,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    /// Frames per second (0.0 when unknown or not a video stream)
    pub frame_rate: f64,
    pub pix_fmt: Option<String>,
}

impl StreamInfo {
    pub fn is_video(&self) -> bool {
        self.kind == StreamKind::Video
    }

    pub fn has_dimensions(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn has_odd_dimensions(&self) -> bool {
        self.width % 2 != 0 || self.height % 2 != 0
    }
}

/// Container and stream metadata of a media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeMetadata {
    pub streams: Vec<StreamInfo>,
    /// Clockwise display rotation in degrees; `None` when the container has
    /// no rotation metadata at all.
    pub rotation: Option<f64>,
    /// Duration in seconds
    pub duration: f64,
    pub format_name: Option<String>,
}

impl ProbeMetadata {
    pub fn video_streams(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams.iter().filter(|s| s.is_video())
    }

    /// First video stream with dimensions, else the first video stream.
    ///
    /// Cover art and data tracks may come first with a 0x0 size.
    pub fn primary_video(&self) -> Option<&StreamInfo> {
        self.video_streams()
            .find(|s| s.has_dimensions())
            .or_else(|| self.video_streams().next())
    }

    pub fn has_audio(&self) -> bool {
        self.streams.iter().any(|s| s.kind == StreamKind::Audio)
    }

    /// Rotation normalized to `[0, 360)`, treating missing metadata as 0.
    pub fn normalized_rotation(&self) -> f64 {
        self.rotation.map(normalize_degrees).unwrap_or(0.0)
    }
}

/// Normalize an angle in degrees to `[0, 360)`.
pub fn normalize_degrees(degrees: f64) -> f64 {
    let r = degrees % 360.0;
    if r < 0.0 {
        r + 360.0
    } else {
        r
    }
}

/// How the clip is cut out of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimStrategy {
    /// Remux compressed data from the preceding keyframe (fast, keyframe-granular)
    StreamCopy,
    /// Decode and re-encode for a frame-accurate cut
    Reencode,
}

impl TrimStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrimStrategy::StreamCopy => "stream_copy",
            TrimStrategy::Reencode => "reencode",
        }
    }
}

impl fmt::Display for TrimStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable decision on how to cut one clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimPlan {
    pub source_path: PathBuf,
    pub start: f64,
    pub end: f64,
    pub strategy: TrimStrategy,
    /// Video filter chain for re-encoding (rotation and even-dimension rounding)
    pub video_filter: Option<String>,
    /// Nearest keyframe at or before `start`
    pub keyframe_time: Option<f64>,
    /// `start - keyframe_time`
    pub keyframe_offset: Option<f64>,
    /// Absolute index of the source video stream to cut
    pub video_stream: u32,
    /// Whether the source rotation metadata must be ignored on input
    pub disable_autorotate: bool,
    /// Whether the input display matrix is reset so the output is not rotated twice
    pub reset_display_rotation: bool,
    /// Whether the source carries an audio stream worth mapping
    pub include_audio: bool,
    /// Human readable reason for the strategy
    pub reason: String,
}

impl TrimPlan {
    /// Requested clip length in seconds.
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Point the encoder seeks to: the keyframe for stream copy, `start` otherwise.
    pub fn seek_time(&self) -> f64 {
        match (self.strategy, self.keyframe_time) {
            (TrimStrategy::StreamCopy, Some(kf)) => kf,
            _ => self.start,
        }
    }

    /// Length handed to the encoder, measured from [`TrimPlan::seek_time`].
    pub fn output_duration(&self) -> f64 {
        self.end - self.seek_time()
    }
}
