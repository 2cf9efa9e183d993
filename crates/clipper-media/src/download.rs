//! Source acquisition using yt-dlp.
//!
//! [`MediaAcquirer`] resolves a format selector from a metadata-only probe,
//! then walks the configured [`PersonaSet`] until one download succeeds.
//! The process-level work is behind the [`Downloader`] trait so the
//! fallback logic can be exercised without network access.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use clipper_models::AcquiredMedia;

use crate::command::{check_ytdlp, output_with_timeout, YT_DLP};
use crate::error::{MediaError, MediaResult};
use crate::persona::{ClientPersona, PersonaSet};

/// Stem of every file yt-dlp writes into the work directory.
pub const SOURCE_STEM: &str = "source";

/// Minimum size for a valid cookies file (bytes).
/// A real Netscape cookies file is at least ~50 bytes.
const MIN_COOKIES_FILE_SIZE: u64 = 50;

/// Bytes inspected when sniffing for an HTML error page.
const SNIFF_BYTES: usize = 1024;

/// One format offered by the origin.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceFormat {
    pub format_id: String,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl SourceFormat {
    fn has_video(&self) -> bool {
        self.vcodec.as_deref().map_or(false, |c| c != "none")
    }

    fn has_audio(&self) -> bool {
        self.acodec.as_deref().map_or(false, |c| c != "none")
    }

    /// Video without an audio track; needs to be merged with `bestaudio`.
    pub fn is_video_only(&self) -> bool {
        self.has_video() && !self.has_audio()
    }
}

/// Result of `yt-dlp -J --skip-download`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SourceMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub formats: Vec<SourceFormat>,
}

impl SourceMetadata {
    pub fn format(&self, format_id: &str) -> Option<&SourceFormat> {
        self.formats.iter().find(|f| f.format_id == format_id)
    }
}

/// Backend that talks to the origin on behalf of one persona.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Metadata-only probe.
    async fn fetch_metadata(&self, url: &str, persona: &ClientPersona) -> MediaResult<SourceMetadata>;

    /// Download `selector` into `work_dir`, returning the produced file.
    async fn download(
        &self,
        url: &str,
        selector: &str,
        persona: &ClientPersona,
        work_dir: &Path,
    ) -> MediaResult<PathBuf>;
}

/// Production [`Downloader`] spawning yt-dlp.
#[derive(Debug, Clone)]
pub struct YtDlpDownloader {
    cookies: Option<PathBuf>,
    metadata_timeout: Duration,
}

impl Default for YtDlpDownloader {
    fn default() -> Self {
        Self {
            cookies: None,
            metadata_timeout: Duration::from_secs(60),
        }
    }
}

impl YtDlpDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a writable cookies file, see [`prepare_cookies`].
    pub fn with_cookies(mut self, path: impl Into<PathBuf>) -> Self {
        self.cookies = Some(path.into());
        self
    }

    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    fn base_args(&self, persona: &ClientPersona) -> Vec<String> {
        let mut args = vec!["--no-playlist".to_string(), "--no-progress".to_string()];
        args.extend(persona.yt_dlp_args());
        if let Some(cookies) = &self.cookies {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().to_string());
        }
        args
    }
}

#[async_trait]
impl Downloader for YtDlpDownloader {
    async fn fetch_metadata(&self, url: &str, persona: &ClientPersona) -> MediaResult<SourceMetadata> {
        check_ytdlp()?;

        let mut args = self.base_args(persona);
        args.extend(["-J".to_string(), "--skip-download".to_string(), url.to_string()]);

        let mut cmd = Command::new(YT_DLP);
        cmd.args(&args);
        let timeout = self.metadata_timeout.min(persona.attempt_timeout());
        let output = output_with_timeout(&mut cmd, YT_DLP, timeout).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr, url, None, persona));
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }

    async fn download(
        &self,
        url: &str,
        selector: &str,
        persona: &ClientPersona,
        work_dir: &Path,
    ) -> MediaResult<PathBuf> {
        check_ytdlp()?;

        let template = work_dir.join(format!("{}.%(ext)s", SOURCE_STEM));
        let mut args = self.base_args(persona);
        args.extend([
            "-f".to_string(),
            selector.to_string(),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "-o".to_string(),
            template.to_string_lossy().to_string(),
            url.to_string(),
        ]);

        debug!(persona = persona.name(), selector = selector, "Running yt-dlp");

        let mut cmd = Command::new(YT_DLP);
        cmd.args(&args);
        let output = output_with_timeout(&mut cmd, YT_DLP, persona.attempt_timeout()).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr, url, Some(selector), persona));
        }

        let printed = String::from_utf8_lossy(&output.stdout)
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(PathBuf::from);

        match printed.filter(|p| p.is_file()) {
            Some(path) => Ok(path),
            None => find_source_file(work_dir)
                .await?
                .ok_or_else(|| MediaError::download_failed("Output file not created")),
        }
    }
}

/// Turn yt-dlp stderr into a typed error.
fn classify_failure(stderr: &str, url: &str, selector: Option<&str>, persona: &ClientPersona) -> MediaError {
    debug!("yt-dlp stderr: {}", stderr);

    let is_rate_limited = stderr.contains("429")
        || stderr.contains("Too Many Requests")
        || stderr.contains("rate limit")
        || stderr.contains("Sign in to confirm");
    if is_rate_limited {
        warn!(url = %url, persona = persona.name(), "Origin rate limit detected");
    }

    let error_msg = stderr
        .lines()
        .rev()
        .find(|l| l.contains("ERROR"))
        .or_else(|| stderr.lines().last())
        .unwrap_or("Unknown error")
        .trim()
        .to_string();

    if stderr.contains("Requested format is not available") {
        return MediaError::format_not_available(selector.unwrap_or("default"), error_msg);
    }

    MediaError::download_failed(format!("yt-dlp failed: {}", error_msg))
}

/// Largest finished `source.*` file in `work_dir`.
async fn find_source_file(work_dir: &Path) -> MediaResult<Option<PathBuf>> {
    let mut best: Option<(u64, PathBuf)> = None;
    let mut entries = tokio::fs::read_dir(work_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(SOURCE_STEM) || name.ends_with(".part") || name.ends_with(".ytdl") {
            continue;
        }
        let meta = entry.metadata().await?;
        if meta.is_file() && best.as_ref().map_or(true, |(size, _)| meta.len() > *size) {
            best = Some((meta.len(), entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}

/// Remove every `source*` file (finished, `.part` or `.ytdl`) from `work_dir`.
pub async fn cleanup_partials(work_dir: &Path) -> MediaResult<usize> {
    let mut removed = 0;
    let mut entries = match tokio::fs::read_dir(work_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with(SOURCE_STEM) {
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    if removed > 0 {
        debug!(work_dir = %work_dir.display(), removed, "Removed partial downloads");
    }
    Ok(removed)
}

/// [`cleanup_partials`] between acquisition attempts. A work dir that cannot
/// be cleared fails the acquisition, not a later stage.
async fn clear_attempt(work_dir: &Path) -> MediaResult<()> {
    cleanup_partials(work_dir).await.map(|_| ()).map_err(|e| {
        MediaError::download_failed(format!(
            "cannot clear work dir {}: {}",
            work_dir.display(),
            e
        ))
    })
}

/// Whether the leading bytes look like an HTML or XML document.
pub fn looks_like_markup(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(&head[..head.len().min(SNIFF_BYTES)]).to_ascii_lowercase();
    let text = text.trim_start_matches(|c: char| c.is_whitespace() || c == '\u{feff}');
    text.starts_with("<!doctype")
        || text.starts_with("<html")
        || text.starts_with("<?xml")
        || text.contains("<html")
}

/// Reject missing, tiny or HTML downloads. Returns the file size.
pub async fn validate_download(path: &Path, min_bytes: u64) -> MediaResult<u64> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(_) => return Err(MediaError::download_failed("Output file not created")),
    };
    if meta.len() < min_bytes {
        return Err(MediaError::download_failed(format!(
            "Downloaded file is too small ({} bytes, minimum {})",
            meta.len(),
            min_bytes
        )));
    }

    let mut head = Vec::with_capacity(SNIFF_BYTES);
    tokio::fs::File::open(path)
        .await?
        .take(SNIFF_BYTES as u64)
        .read_to_end(&mut head)
        .await?;
    if looks_like_markup(&head) {
        return Err(MediaError::download_failed(
            "Downloaded file is an HTML page, not media",
        ));
    }

    Ok(meta.len())
}

/// Validate a Netscape cookies file and copy it into `writable_dir`.
///
/// yt-dlp writes cookies back after use, so it must never be pointed at a
/// read-only mount. Returns `None` (logged) when the file is missing, too
/// small or not in Netscape format.
pub async fn prepare_cookies(source: &Path, writable_dir: &Path) -> Option<PathBuf> {
    let metadata = match tokio::fs::metadata(source).await {
        Ok(m) => m,
        Err(_) => {
            debug!("Cookies file not found at {}, skipping", source.display());
            return None;
        }
    };
    if metadata.len() < MIN_COOKIES_FILE_SIZE {
        debug!(
            "Cookies file {} is too small ({} bytes), skipping",
            source.display(),
            metadata.len()
        );
        return None;
    }

    match tokio::fs::read_to_string(source).await {
        Ok(content) if is_valid_netscape_cookies(&content) => {}
        Ok(_) => {
            warn!(
                "Cookies file {} is not in valid Netscape format, skipping",
                source.display()
            );
            return None;
        }
        Err(e) => {
            warn!("Failed to read cookies file: {}", e);
            return None;
        }
    }

    let target = writable_dir.join("cookies.txt");
    if let Err(e) = tokio::fs::create_dir_all(writable_dir).await {
        warn!("Failed to create cookies directory: {}", e);
        return None;
    }
    match tokio::fs::copy(source, &target).await {
        Ok(_) => {
            info!("Using cookies file {}", target.display());
            Some(target)
        }
        Err(e) => {
            warn!("Failed to copy cookies file: {}", e);
            None
        }
    }
}

/// Netscape cookies files either start with a known header or contain
/// tab-separated lines with at least six fields.
fn is_valid_netscape_cookies(content: &str) -> bool {
    if content.starts_with("# Netscape HTTP Cookie File") || content.starts_with("# HTTP Cookie File") {
        return true;
    }

    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .any(|l| l.split('\t').count() >= 6)
}

/// Fetches source media into a job work directory.
#[async_trait]
pub trait Acquirer: Send + Sync {
    async fn acquire(
        &self,
        url: &str,
        format_hint: Option<&str>,
        work_dir: &Path,
    ) -> MediaResult<AcquiredMedia>;
}

/// Acquirer settings.
#[derive(Debug, Clone)]
pub struct AcquirerConfig {
    /// Height cap of the generic selector
    pub height_cap: u32,
    /// Downloads smaller than this are rejected
    pub min_download_bytes: u64,
}

impl Default for AcquirerConfig {
    fn default() -> Self {
        Self {
            height_cap: 1080,
            min_download_bytes: 10 * 1024,
        }
    }
}

impl AcquirerConfig {
    /// `bestvideo[height<=CAP]+bestaudio/best[height<=CAP]/best`
    pub fn generic_selector(&self) -> String {
        format!(
            "bestvideo[height<={cap}]+bestaudio/best[height<={cap}]/best",
            cap = self.height_cap
        )
    }
}

/// Pick the yt-dlp `-f` selector for a request.
///
/// A hint offered by the origin is used as is, merged with `bestaudio` when
/// it carries no audio. Anything else gets the generic selector.
pub fn select_format(
    metadata: Option<&SourceMetadata>,
    format_hint: Option<&str>,
    config: &AcquirerConfig,
) -> String {
    let generic = config.generic_selector();
    let Some(hint) = format_hint else {
        return generic;
    };
    let Some(metadata) = metadata else {
        warn!(format_hint = hint, "Source metadata unavailable, using generic format selector");
        return generic;
    };

    match metadata.format(hint) {
        Some(format) if format.is_video_only() => format!("{hint}+bestaudio/{hint}"),
        Some(_) => hint.to_string(),
        None => {
            warn!(
                format_hint = hint,
                offered = metadata.formats.len(),
                "Requested format not offered, using generic format selector"
            );
            generic
        }
    }
}

/// [`Acquirer`] with persona fallback.
pub struct MediaAcquirer<D> {
    downloader: D,
    personas: PersonaSet,
    config: AcquirerConfig,
}

impl<D: Downloader> MediaAcquirer<D> {
    pub fn new(downloader: D, personas: PersonaSet, config: AcquirerConfig) -> Self {
        Self {
            downloader,
            personas,
            config,
        }
    }

    pub fn personas(&self) -> &PersonaSet {
        &self.personas
    }

    /// First metadata probe that succeeds, in persona order.
    async fn probe_metadata(&self, url: &str) -> Option<SourceMetadata> {
        for persona in &self.personas {
            match self.downloader.fetch_metadata(url, persona).await {
                Ok(metadata) => return Some(metadata),
                Err(e) => {
                    warn!(persona = persona.name(), error = %e, "Metadata probe failed");
                }
            }
        }
        None
    }
}

#[async_trait]
impl<D: Downloader> Acquirer for MediaAcquirer<D> {
    async fn acquire(
        &self,
        url: &str,
        format_hint: Option<&str>,
        work_dir: &Path,
    ) -> MediaResult<AcquiredMedia> {
        let metadata = match format_hint {
            Some(_) => self.probe_metadata(url).await,
            None => None,
        };
        let selector = select_format(metadata.as_ref(), format_hint, &self.config);

        let mut last_error: Option<MediaError> = None;
        let mut all_format_rejections = true;

        for persona in &self.personas {
            clear_attempt(work_dir).await?;

            let attempt = async {
                let path = self.downloader.download(url, &selector, persona, work_dir).await?;
                let size = validate_download(&path, self.config.min_download_bytes).await?;
                Ok::<_, MediaError>((path, size))
            }
            .await;

            match attempt {
                Ok((path, byte_size)) => {
                    metrics::counter!(
                        "clipper_acquire_attempts_total",
                        "persona" => persona.name().to_string(),
                        "outcome" => "success"
                    )
                    .increment(1);

                    let container_ext = path
                        .extension()
                        .map(|e| e.to_string_lossy().to_string())
                        .unwrap_or_default();
                    info!(
                        persona = persona.name(),
                        selector = %selector,
                        size_mb = byte_size as f64 / (1024.0 * 1024.0),
                        "Downloaded source"
                    );
                    return Ok(AcquiredMedia {
                        local_path: path,
                        selected_format_id: selector,
                        container_ext,
                        persona: persona.name().to_string(),
                        byte_size,
                    });
                }
                Err(e) => {
                    metrics::counter!(
                        "clipper_acquire_attempts_total",
                        "persona" => persona.name().to_string(),
                        "outcome" => "failure"
                    )
                    .increment(1);
                    warn!(persona = persona.name(), error = %e, "Download attempt failed");

                    all_format_rejections &= e.is_format_rejection();
                    last_error = Some(e);
                    clear_attempt(work_dir).await?;
                }
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no download attempt made".to_string());
        if all_format_rejections {
            Err(MediaError::format_not_available(selector, message))
        } else {
            Err(MediaError::download_failed(format!(
                "all {} personas failed; last error: {}",
                self.personas.len(),
                message
            )))
        }
    }
}
