//! Title extraction and source file analysis.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use clipper_models::{sanitize_title, ProbeMetadata, DEFAULT_TITLE};

use crate::download::Downloader;
use crate::error::{MediaError, MediaResult};
use crate::persona::PersonaSet;
use crate::probe::probe_file;

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Filesystem-safe title of the source; never fails.
    async fn extract_title(&self, url: &str) -> String;

    /// Probe a local file; fails unless it has a video stream with dimensions.
    async fn analyze_file(&self, path: &Path) -> MediaResult<ProbeMetadata>;
}

/// Reject metadata without a usable video stream.
pub fn check_video_metadata(metadata: &ProbeMetadata) -> MediaResult<()> {
    if metadata.video_streams().any(|s| s.has_dimensions()) {
        return Ok(());
    }
    let video = metadata
        .video_streams()
        .next()
        .ok_or_else(|| MediaError::video_analysis("No video stream found"))?;
    Err(MediaError::video_analysis(format!(
        "Video stream {} has invalid dimensions {}x{}",
        video.index, video.width, video.height
    )))
}

/// [`Analyzer`] backed by a [`Downloader`] for titles and FFprobe for files.
pub struct MediaAnalyzer<D> {
    downloader: D,
    personas: PersonaSet,
    probe_timeout: Duration,
}

impl<D: Downloader> MediaAnalyzer<D> {
    pub fn new(downloader: D, personas: PersonaSet, probe_timeout: Duration) -> Self {
        Self {
            downloader,
            personas,
            probe_timeout,
        }
    }
}

#[async_trait]
impl<D: Downloader> Analyzer for MediaAnalyzer<D> {
    async fn extract_title(&self, url: &str) -> String {
        for persona in &self.personas {
            match self.downloader.fetch_metadata(url, persona).await {
                Ok(metadata) => {
                    let raw = metadata.title.unwrap_or_default();
                    let title = sanitize_title(&raw);
                    debug!(persona = persona.name(), title = %title, "Extracted title");
                    return title;
                }
                Err(e) => {
                    debug!(persona = persona.name(), error = %e, "Title probe failed");
                }
            }
        }

        warn!(url = %url, "Could not extract title, using default");
        DEFAULT_TITLE.to_string()
    }

    async fn analyze_file(&self, path: &Path) -> MediaResult<ProbeMetadata> {
        let metadata = probe_file(path, self.probe_timeout).await.map_err(|e| match e {
            MediaError::VideoAnalysis(_) => e,
            other => MediaError::video_analysis(other.to_string()),
        })?;

        check_video_metadata(&metadata)?;

        debug!(
            path = %path.display(),
            streams = metadata.streams.len(),
            duration = metadata.duration,
            rotation = ?metadata.rotation,
            "Analyzed source"
        );
        Ok(metadata)
    }
}
