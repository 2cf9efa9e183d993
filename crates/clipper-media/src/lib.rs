#![deny(unreachable_patterns)]
//! yt-dlp, FFprobe and FFmpeg wrappers for the clip pipeline.
//!
//! This crate provides:
//! - Source acquisition with client persona fallback
//! - Title extraction and stream analysis
//! - Keyframe-aware trimming with rotation and even-dimension handling
//! - Type-safe FFmpeg command building and `-progress pipe:2` parsing

pub mod analyzer;
pub mod command;
pub mod download;
pub mod error;
pub mod filters;
pub mod persona;
pub mod probe;
pub mod progress;
pub mod trim;

pub use analyzer::{Analyzer, MediaAnalyzer};
pub use command::{cancelled, check_ffmpeg, check_ffprobe, check_ytdlp, FfmpegCommand, FfmpegRunner};
pub use download::{
    prepare_cookies, select_format, Acquirer, AcquirerConfig, Downloader, MediaAcquirer,
    SourceFormat, SourceMetadata, YtDlpDownloader,
};
pub use error::{MediaError, MediaResult};
pub use persona::{ClientPersona, PersonaSet, PersonaSpec};
pub use probe::probe_file;
pub use progress::{FfmpegProgress, ProgressCallback};
pub use trim::{ClipTrimmer, TrimConfig, TrimmedClip, Trimmer};
