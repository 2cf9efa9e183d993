//! Clip processing orchestration.
//!
//! A [`ProcessingOrchestrator`] runs one request at a time through
//! validation, title extraction, acquisition, analysis, trimming and
//! storage. Each component error ends the job with its [`ErrorCode`]; the
//! per-job workspace is removed on every path, cancellation included.
//!
//! [`ErrorCode`]: clipper_models::ErrorCode

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::watch;
use tracing::{info, warn, Instrument};

use clipper_media::{
    cancelled, prepare_cookies, Acquirer, Analyzer, ClipTrimmer, MediaAcquirer, MediaAnalyzer,
    PersonaSet, ProgressCallback, TrimmedClip, Trimmer, YtDlpDownloader,
};
use clipper_models::{
    validate, ArtifactSummary, ClipArtifact, ClipRequest, ProcessingResult, Stage, ValidRequest,
    ValidationConfig,
};
use clipper_progress::{JobTracker, ProgressReporter};
use clipper_storage::ArtifactStore;

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;

// Progress checkpoints (percent)
const VALIDATED: u8 = 5;
const TITLE_EXTRACTED: u8 = 5;
const ACQUIRED: u8 = 30;
const ANALYZED: u8 = 35;
const TRIM_START: u8 = 35;
const TRIM_END: u8 = 70;
const VERIFIED: u8 = 80;
const SAVED: u8 = 90;
const URL_READY: u8 = 98;

/// Name of the trimmed clip inside the job workspace.
const CLIP_FILE_NAME: &str = "clip.mp4";

/// Pipeline components, shared across jobs.
#[derive(Clone)]
pub struct Components {
    pub acquirer: Arc<dyn Acquirer>,
    pub analyzer: Arc<dyn Analyzer>,
    pub trimmer: Arc<dyn Trimmer>,
    pub store: Arc<ArtifactStore>,
    pub reporter: Arc<dyn ProgressReporter>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub validation: ValidationConfig,
    /// Parent of the per-job workspaces
    pub work_dir: PathBuf,
    /// Budget for everything before storage
    pub job_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            validation: config.validation(),
            work_dir: config.work_dir.clone(),
            job_timeout: config.job_timeout,
        }
    }
}

/// Runs clip requests end to end.
#[derive(Clone)]
pub struct ProcessingOrchestrator {
    components: Components,
    settings: OrchestratorSettings,
}

impl ProcessingOrchestrator {
    pub fn new(components: Components, settings: OrchestratorSettings) -> Self {
        Self {
            components,
            settings,
        }
    }

    /// Wire the yt-dlp/FFmpeg backed components described by `config`.
    pub async fn from_config(
        config: &WorkerConfig,
        reporter: Arc<dyn ProgressReporter>,
    ) -> WorkerResult<Self> {
        let personas = match &config.persona_file {
            Some(path) => PersonaSet::load(path).await?,
            None => PersonaSet::default(),
        };
        info!(
            personas = personas.len(),
            first = personas.first().name(),
            "Loaded client personas"
        );

        tokio::fs::create_dir_all(&config.work_dir).await?;

        let mut downloader = YtDlpDownloader::new().with_metadata_timeout(config.metadata_timeout);
        if let Some(source) = &config.cookies_file {
            // yt-dlp rewrites its cookie jar, so it gets a private copy
            match prepare_cookies(source, &config.work_dir).await {
                Some(path) => downloader = downloader.with_cookies(path),
                None => warn!(path = %source.display(), "Ignoring unusable cookies file"),
            }
        }

        let components = Components {
            acquirer: Arc::new(MediaAcquirer::new(
                downloader.clone(),
                personas.clone(),
                config.acquirer(),
            )),
            analyzer: Arc::new(MediaAnalyzer::new(downloader, personas, config.probe_timeout)),
            trimmer: Arc::new(ClipTrimmer::new(config.trim())),
            store: Arc::new(ArtifactStore::new(config.store(), config.delivery())),
            reporter,
        };

        Ok(Self::new(components, OrchestratorSettings::from_config(config)))
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.components.store
    }

    /// Process one request to completion.
    pub async fn process(&self, request: &ClipRequest) -> ProcessingResult {
        self.process_with_cancel(request, None).await
    }

    /// Process one request, giving up with `Cancelled` once `cancel_rx` reads `true`.
    pub async fn process_with_cancel(
        &self,
        request: &ClipRequest,
        cancel_rx: Option<watch::Receiver<bool>>,
    ) -> ProcessingResult {
        let logger = JobLogger::new(&request.job_id, "clip");
        let span = logger.create_span();
        self.run_job(request, cancel_rx, logger).instrument(span).await
    }

    async fn run_job(
        &self,
        request: &ClipRequest,
        cancel_rx: Option<watch::Receiver<bool>>,
        logger: JobLogger,
    ) -> ProcessingResult {
        let started = Instant::now();
        let mut tracker = JobTracker::new(request.job_id.as_str(), self.components.reporter.clone());
        let mut workspace = None;

        logger.log_start(&format!(
            "{} [{:.3}s, {:.3}s]",
            request.source_url, request.start_ts, request.end_ts
        ));

        let outcome = self
            .execute(request, &mut tracker, &mut workspace, cancel_rx, &logger)
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        let result = match outcome {
            Ok((artifact, summary)) => {
                tracker.complete(artifact).await;
                logger.log_completion(&format!(
                    "{} ({} bytes) in {:.1}s",
                    summary.filename, summary.size, elapsed
                ));
                ProcessingResult::succeeded(request.job_id.as_str(), summary, elapsed)
            }
            Err(e) => {
                let code = e.code();
                logger.log_failure(code, &e.to_string());
                tracker.fail(code, code.user_message()).await;
                ProcessingResult::failed(request.job_id.as_str(), code, elapsed)
            }
        };

        if let Some(dir) = workspace {
            remove_workspace(dir, &logger);
        }

        let outcome_label = result.error_code.map_or("success", |code| code.as_str());
        metrics::counter!("clipper_jobs_total", "outcome" => outcome_label).increment(1);
        metrics::histogram!("clipper_job_duration_seconds").record(elapsed);

        result
    }

    async fn execute(
        &self,
        request: &ClipRequest,
        tracker: &mut JobTracker,
        workspace: &mut Option<TempDir>,
        cancel_rx: Option<watch::Receiver<bool>>,
        logger: &JobLogger,
    ) -> WorkerResult<(ClipArtifact, ArtifactSummary)> {
        let valid = validate(request, &self.settings.validation)?;
        tracker.advance(Stage::Validate, VALIDATED).await;

        tokio::fs::create_dir_all(&self.settings.work_dir).await?;
        let prefix = format!("{}-", valid.job_id());
        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(&self.settings.work_dir)?;
        let work_dir = workspace.insert(dir).path().to_path_buf();

        let timeout = self.settings.job_timeout;
        let stages = self.run_stages(&valid, tracker, &work_dir, logger);
        let (title, clip) = tokio::select! {
            biased;
            _ = cancelled(cancel_rx) => return Err(WorkerError::Cancelled),
            _ = tokio::time::sleep(timeout) => return Err(WorkerError::TimedOut(timeout)),
            result = stages => result?,
        };

        // Not interruptible: a dropped save would strand a staged file
        self.save(&valid, tracker, &title, &clip, logger).await
    }

    async fn run_stages(
        &self,
        request: &ValidRequest,
        tracker: &mut JobTracker,
        work_dir: &Path,
        logger: &JobLogger,
    ) -> WorkerResult<(String, TrimmedClip)> {
        let title = self
            .components
            .analyzer
            .extract_title(request.source_url())
            .await;
        tracker.advance(Stage::ExtractTitle, TITLE_EXTRACTED).await;
        logger.log_stage(Stage::ExtractTitle, &title);

        tracker.advance(Stage::Acquire, TITLE_EXTRACTED).await;
        let media = self
            .components
            .acquirer
            .acquire(request.source_url(), request.format_hint(), work_dir)
            .await?;
        tracker.advance(Stage::Acquire, ACQUIRED).await;
        logger.log_stage(
            Stage::Acquire,
            &format!(
                "format {} via {} ({} bytes)",
                media.selected_format_id, media.persona, media.byte_size
            ),
        );

        let clip = self
            .analyze_and_trim(request, tracker, &media.local_path, work_dir, logger)
            .await;
        remove_source(&media.local_path, logger).await;

        clip.map(|clip| (title, clip))
    }

    async fn analyze_and_trim(
        &self,
        request: &ValidRequest,
        tracker: &mut JobTracker,
        source: &Path,
        work_dir: &Path,
        logger: &JobLogger,
    ) -> WorkerResult<TrimmedClip> {
        let probe = self.components.analyzer.analyze_file(source).await?;
        tracker.advance(Stage::Analyze, ANALYZED).await;
        logger.log_stage(
            Stage::Analyze,
            &format!("{:.2}s, rotation {:?}", probe.duration, probe.rotation),
        );

        let plan = self
            .components
            .trimmer
            .plan(source, &probe, request.start(), request.end())
            .await?;
        tracker.advance(Stage::Trim, TRIM_START).await;

        let output = work_dir.join(CLIP_FILE_NAME);
        let (progress_tx, mut progress_rx) = watch::channel(0.0_f64);
        let callback: ProgressCallback = Box::new(move |fraction| {
            progress_tx.send_replace(fraction);
        });

        let execute = self.components.trimmer.execute(&plan, &output, Some(callback));
        tokio::pin!(execute);

        let clip = loop {
            tokio::select! {
                result = &mut execute => break result?,
                changed = progress_rx.changed() => match changed {
                    Ok(()) => {
                        let fraction = *progress_rx.borrow_and_update();
                        tracker.advance(Stage::Trim, trim_percent(fraction)).await;
                    }
                    // Encoder finished; only verification remains
                    Err(_) => break (&mut execute).await?,
                },
            }
        };

        tracker.advance(Stage::Trim, VERIFIED).await;
        logger.log_stage(
            Stage::Trim,
            &format!(
                "{} {}x{} {:.2}s",
                clip.strategy, clip.width, clip.height, clip.duration
            ),
        );
        Ok(clip)
    }

    async fn save(
        &self,
        request: &ValidRequest,
        tracker: &mut JobTracker,
        title: &str,
        clip: &TrimmedClip,
        logger: &JobLogger,
    ) -> WorkerResult<(ClipArtifact, ArtifactSummary)> {
        tracker.advance(Stage::Save, VERIFIED).await;
        let artifact = self
            .components
            .store
            .save_file(request.job_id(), &clip.path, title)
            .await?;
        tracker.advance(Stage::Save, SAVED).await;

        let download_url = self
            .components
            .store
            .get_download_url(request.job_id(), &artifact.filename)?;
        tracker.advance(Stage::Save, URL_READY).await;
        logger.log_stage(Stage::Save, &artifact.relative_path);

        let summary = ArtifactSummary {
            download_url,
            size: artifact.byte_size,
            sha256: artifact.sha256.clone(),
            title: title.to_string(),
            filename: artifact.filename.clone(),
        };
        Ok((artifact, summary))
    }
}

/// Map encoder progress onto the trim checkpoint range.
fn trim_percent(fraction: f64) -> u8 {
    let span = f64::from(TRIM_END - TRIM_START);
    let offset = (fraction.clamp(0.0, 1.0) * span).round();
    if offset.is_nan() {
        TRIM_START
    } else {
        TRIM_START + offset as u8
    }
}

async fn remove_source(path: &Path, logger: &JobLogger) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            logger.log_warning(&format!("Failed to remove source {}: {}", path.display(), e));
        }
    }
}

fn remove_workspace(dir: TempDir, logger: &JobLogger) {
    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
        logger.log_warning(&format!("Failed to remove workspace {}: {}", path.display(), e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_percent_stays_in_range() {
        assert_eq!(trim_percent(0.0), TRIM_START);
        assert_eq!(trim_percent(0.5), 53);
        assert_eq!(trim_percent(1.0), TRIM_END);
        assert_eq!(trim_percent(7.0), TRIM_END);
        assert_eq!(trim_percent(-1.0), TRIM_START);
        assert_eq!(trim_percent(f64::NAN), TRIM_START);
    }

    #[test]
    fn test_checkpoints_are_monotonic() {
        let checkpoints = [
            VALIDATED,
            TITLE_EXTRACTED,
            ACQUIRED,
            ANALYZED,
            TRIM_START,
            TRIM_END,
            VERIFIED,
            SAVED,
            URL_READY,
        ];
        assert!(checkpoints.windows(2).all(|w| w[0] <= w[1]));
        assert!(URL_READY < 100);
    }
}
