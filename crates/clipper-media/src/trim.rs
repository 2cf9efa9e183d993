//! Keyframe-aware clip trimming.
//!
//! Planning decides between remuxing from the preceding keyframe (fast,
//! may start up to the threshold early) and a frame-accurate re-encode.
//! Rotation, odd source dimensions or a distant keyframe force the re-encode.
//! Execution runs FFmpeg and then verifies what was written.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use clipper_models::{EncodingConfig, ProbeMetadata, TrimPlan, TrimStrategy};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::filters::{build_filter_chain, corrective_rotation_filter, rotation_filter};
use crate::probe::{nearest_keyframe_at_or_before, probe_file, probe_keyframes};
use crate::progress::ProgressCallback;

/// Trimmer settings.
#[derive(Debug, Clone)]
pub struct TrimConfig {
    /// Largest keyframe gap (seconds) still served by stream copy
    pub keyframe_threshold: f64,
    /// How far before `start` to look for a keyframe
    pub keyframe_lookback: f64,
    /// Rotation applied to sources without rotation metadata; `None` disables it
    pub corrective_rotation_deg: Option<f64>,
    /// Allowed difference between requested and measured duration
    pub duration_tolerance: f64,
    /// Whether a duration mismatch fails the trim or is only logged
    pub duration_mismatch_fatal: bool,
    /// Pass `-display_rotation` when rotating ourselves (FFmpeg 7 and later)
    pub reset_display_rotation: bool,
    pub encode_timeout: Duration,
    pub probe_timeout: Duration,
    pub encoding: EncodingConfig,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            keyframe_threshold: 1.0,
            keyframe_lookback: 10.0,
            corrective_rotation_deg: None,
            duration_tolerance: 0.5,
            duration_mismatch_fatal: true,
            reset_display_rotation: true,
            encode_timeout: Duration::from_secs(600),
            probe_timeout: Duration::from_secs(60),
            encoding: EncodingConfig::default(),
        }
    }
}

/// A verified clip on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct TrimmedClip {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Measured duration in seconds
    pub duration: f64,
    pub byte_size: u64,
    pub strategy: TrimStrategy,
}

#[async_trait]
pub trait Trimmer: Send + Sync {
    /// Decide how to cut `[start, end)` out of `source`.
    async fn plan(
        &self,
        source: &Path,
        probe: &ProbeMetadata,
        start: f64,
        end: f64,
    ) -> MediaResult<TrimPlan>;

    /// Cut the clip into `output` and verify the result.
    async fn execute(
        &self,
        plan: &TrimPlan,
        output: &Path,
        progress: Option<ProgressCallback>,
    ) -> MediaResult<TrimmedClip>;
}

/// Pick a strategy. Returns the strategy and a short reason.
pub fn choose_strategy(
    start: f64,
    keyframe: Option<f64>,
    needs_rotation: bool,
    odd_dimensions: bool,
    threshold: f64,
) -> (TrimStrategy, String) {
    if needs_rotation {
        return (TrimStrategy::Reencode, "rotation filter required".to_string());
    }
    if odd_dimensions {
        return (TrimStrategy::Reencode, "source has odd dimensions".to_string());
    }
    match keyframe {
        None => (TrimStrategy::Reencode, "no keyframe within lookback window".to_string()),
        Some(kf) if start - kf > threshold => (
            TrimStrategy::Reencode,
            format!("nearest keyframe is {:.3}s before start", start - kf),
        ),
        Some(kf) => (
            TrimStrategy::StreamCopy,
            format!("keyframe {:.3}s before start", start - kf),
        ),
    }
}

/// Rotation filter from metadata, or the configured correction when there is none.
fn rotation_for(probe: &ProbeMetadata, config: &TrimConfig) -> Option<String> {
    match probe.rotation {
        Some(deg) => rotation_filter(deg),
        None => config.corrective_rotation_deg.and_then(corrective_rotation_filter),
    }
}

/// Build a plan from probe data and the keyframes found before `start`.
pub fn build_plan(
    source: &Path,
    probe: &ProbeMetadata,
    start: f64,
    end: f64,
    keyframes: &[f64],
    config: &TrimConfig,
) -> MediaResult<TrimPlan> {
    if !start.is_finite() || !end.is_finite() || start < 0.0 || end <= start {
        return Err(MediaError::trim(format!(
            "invalid trim window {:.3}..{:.3}",
            start, end
        )));
    }
    if probe.duration > 0.0 && start >= probe.duration {
        return Err(MediaError::trim(format!(
            "start {:.3}s is beyond source duration {:.3}s",
            start, probe.duration
        )));
    }

    let video = probe
        .primary_video()
        .ok_or_else(|| MediaError::video_analysis("No video stream found"))?;

    let end = if probe.duration > 0.0 && end > probe.duration {
        warn!(
            requested_end = end,
            source_duration = probe.duration,
            "Clip end beyond source, clamping"
        );
        probe.duration
    } else {
        end
    };

    let rotation = rotation_for(probe, config);

    let keyframe_time = nearest_keyframe_at_or_before(keyframes, start);
    let (strategy, reason) = choose_strategy(
        start,
        keyframe_time,
        rotation.is_some(),
        video.has_odd_dimensions(),
        config.keyframe_threshold,
    );

    let video_filter = match strategy {
        TrimStrategy::Reencode => Some(build_filter_chain(rotation.as_deref())),
        TrimStrategy::StreamCopy => None,
    };

    Ok(TrimPlan {
        source_path: source.to_path_buf(),
        start,
        end,
        strategy,
        video_filter,
        keyframe_time,
        keyframe_offset: keyframe_time.map(|kf| start - kf),
        video_stream: video.index,
        disable_autorotate: rotation.is_some(),
        reset_display_rotation: rotation.is_some() && config.reset_display_rotation,
        include_audio: probe.has_audio(),
        reason,
    })
}

/// FFmpeg invocation for a plan.
pub fn build_command(plan: &TrimPlan, output: &Path, encoding: &EncodingConfig) -> FfmpegCommand {
    let mut cmd = FfmpegCommand::new(&plan.source_path, output);

    if plan.disable_autorotate {
        cmd = cmd.no_autorotate();
    }
    if plan.reset_display_rotation {
        cmd = cmd.reset_display_rotation(plan.video_stream);
    }

    cmd = cmd
        .seek(plan.seek_time())
        .duration(plan.output_duration())
        .map(format!("0:{}", plan.video_stream));
    if plan.include_audio {
        cmd = cmd.map("0:a:0?");
    }

    let cmd = match plan.strategy {
        TrimStrategy::StreamCopy => cmd.codec_copy().avoid_negative_ts(),
        TrimStrategy::Reencode => {
            if let Some(filter) = &plan.video_filter {
                cmd = cmd.video_filter(filter.clone());
            }
            cmd = cmd.output_args(encoding.video_args());
            cmd = if plan.include_audio {
                cmd.output_args(encoding.audio_args())
            } else {
                cmd.output_arg("-an")
            };
            if plan.disable_autorotate {
                cmd = cmd.clear_rotation_metadata();
            }
            cmd
        }
    };
    cmd.faststart()
}

/// Check a probed output against its plan. Returns `(width, height, duration)`.
pub fn check_output(
    probe: &ProbeMetadata,
    byte_size: u64,
    plan: &TrimPlan,
    config: &TrimConfig,
) -> MediaResult<(u32, u32, f64)> {
    if byte_size == 0 {
        return Err(MediaError::ffmpeg_failed("FFmpeg produced an empty file", None, None));
    }
    let video = probe
        .primary_video()
        .ok_or_else(|| MediaError::ffmpeg_failed("output has no video stream", None, None))?;
    if !video.has_dimensions() || video.has_odd_dimensions() {
        return Err(MediaError::H264Dimension {
            width: video.width,
            height: video.height,
        });
    }

    let expected = plan.duration();
    let tolerance = match plan.strategy {
        TrimStrategy::StreamCopy => config.duration_tolerance + plan.keyframe_offset.unwrap_or(0.0),
        TrimStrategy::Reencode => config.duration_tolerance,
    };
    let diff = (probe.duration - expected).abs();
    if diff > tolerance {
        let message = format!(
            "output duration {:.3}s differs from requested {:.3}s by more than {:.3}s",
            probe.duration, expected, tolerance
        );
        if config.duration_mismatch_fatal {
            return Err(MediaError::trim(message));
        }
        warn!(strategy = %plan.strategy, "{}", message);
    }

    Ok((video.width, video.height, probe.duration))
}

/// FFmpeg-backed [`Trimmer`].
#[derive(Debug, Clone, Default)]
pub struct ClipTrimmer {
    config: TrimConfig,
}

impl ClipTrimmer {
    pub fn new(config: TrimConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrimConfig {
        &self.config
    }

    async fn verify_output(&self, plan: &TrimPlan, output: &Path) -> MediaResult<TrimmedClip> {
        let byte_size = tokio::fs::metadata(output)
            .await
            .map(|m| m.len())
            .map_err(|_| MediaError::ffmpeg_failed("FFmpeg did not create the output file", None, None))?;

        let probe = probe_file(output, self.config.probe_timeout)
            .await
            .map_err(|e| match e {
                MediaError::Timeout { .. } => e,
                other => MediaError::ffmpeg_failed(format!("unreadable output: {}", other), None, None),
            })?;

        let (width, height, duration) = check_output(&probe, byte_size, plan, &self.config)?;

        Ok(TrimmedClip {
            path: output.to_path_buf(),
            width,
            height,
            duration,
            byte_size,
            strategy: plan.strategy,
        })
    }
}

#[async_trait]
impl Trimmer for ClipTrimmer {
    async fn plan(
        &self,
        source: &Path,
        probe: &ProbeMetadata,
        start: f64,
        end: f64,
    ) -> MediaResult<TrimPlan> {
        // Keyframes only matter when nothing else forces a re-encode
        let video = probe.primary_video();
        let needs_keyframes = video.map_or(false, |v| !v.has_odd_dimensions())
            && rotation_for(probe, &self.config).is_none();

        let keyframes = if needs_keyframes && start.is_finite() && start >= 0.0 {
            let from = start - self.config.keyframe_lookback;
            let stream = video.map_or(0, |v| v.index);
            match probe_keyframes(source, stream, from, start + 0.001, self.config.probe_timeout).await {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(error = %e, "Keyframe scan failed, falling back to re-encode");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let plan = build_plan(source, probe, start, end, &keyframes, &self.config)?;
        info!(
            strategy = %plan.strategy,
            reason = %plan.reason,
            keyframe = ?plan.keyframe_time,
            "Planned trim"
        );
        Ok(plan)
    }

    async fn execute(
        &self,
        plan: &TrimPlan,
        output: &Path,
        progress: Option<ProgressCallback>,
    ) -> MediaResult<TrimmedClip> {
        let cmd = build_command(plan, output, &self.config.encoding);
        let runner = FfmpegRunner::new().with_timeout(self.config.encode_timeout);
        let total_ms = (plan.output_duration() * 1000.0) as i64;

        metrics::counter!("clipper_trim_strategy_total", "strategy" => plan.strategy.as_str())
            .increment(1);

        let result = match progress {
            Some(callback) => {
                runner
                    .run_with_progress(&cmd, move |p| callback(p.fraction(total_ms)))
                    .await
            }
            None => runner.run_with_progress(&cmd, |_| {}).await,
        };

        let verified = match result {
            Ok(()) => self.verify_output(plan, output).await,
            Err(e) => Err(e),
        };

        match verified {
            Ok(clip) => {
                debug!(
                    path = %clip.path.display(),
                    width = clip.width,
                    height = clip.height,
                    duration = clip.duration,
                    "Trim verified"
                );
                Ok(clip)
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(output).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %output.display(), error = %rm, "Failed to remove rejected output");
                    }
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipper_models::{ErrorCode, StreamInfo, StreamKind};

    fn probe(width: u32, height: u32, rotation: Option<f64>, duration: f64) -> ProbeMetadata {
        ProbeMetadata {
            streams: vec![
                StreamInfo {
                    index: 0,
                    kind: StreamKind::Video,
                    codec: "h264".into(),
                    width,
                    height,
                    frame_rate: 30.0,
                    pix_fmt: Some("yuv420p".into()),
                },
                StreamInfo {
                    index: 1,
                    kind: StreamKind::Audio,
                    codec: "aac".into(),
                    width: 0,
                    height: 0,
                    frame_rate: 0.0,
                    pix_fmt: None,
                },
            ],
            rotation,
            duration,
            format_name: Some("mov,mp4".into()),
        }
    }

    fn src() -> &'static Path {
        Path::new("/work/source.mp4")
    }

    #[test]
    fn test_close_keyframe_uses_stream_copy() {
        let plan = build_plan(src(), &probe(1920, 1080, None, 60.0), 10.0, 15.0, &[0.0, 4.0, 9.5], &TrimConfig::default())
            .unwrap();
        assert_eq!(plan.strategy, TrimStrategy::StreamCopy);
        assert_eq!(plan.keyframe_time, Some(9.5));
        assert!((plan.keyframe_offset.unwrap() - 0.5).abs() < 1e-9);
        assert!(plan.video_filter.is_none());
        assert!(!plan.disable_autorotate);
    }

    #[test]
    fn test_distant_keyframe_reencodes() {
        let plan = build_plan(src(), &probe(1920, 1080, None, 60.0), 10.0, 15.0, &[0.0, 4.0], &TrimConfig::default())
            .unwrap();
        assert_eq!(plan.strategy, TrimStrategy::Reencode);
        assert_eq!(plan.video_filter.as_deref(), Some(crate::filters::EVEN_DIMENSIONS_FILTER));

        let plan = build_plan(src(), &probe(1920, 1080, None, 60.0), 10.0, 15.0, &[], &TrimConfig::default())
            .unwrap();
        assert_eq!(plan.strategy, TrimStrategy::Reencode);
    }

    #[test]
    fn test_rotation_metadata_forces_reencode() {
        let plan = build_plan(src(), &probe(1920, 1080, Some(90.0), 60.0), 10.0, 15.0, &[10.0], &TrimConfig::default())
            .unwrap();
        assert_eq!(plan.strategy, TrimStrategy::Reencode);
        assert!(plan.disable_autorotate);
        let filter = plan.video_filter.unwrap();
        assert!(filter.starts_with("transpose=1,"));
        assert!(filter.ends_with("scale=trunc(iw/2)*2:trunc(ih/2)*2"));
    }

    #[test]
    fn test_corrective_rotation_is_opt_in() {
        let meta = probe(1920, 1080, None, 60.0);
        let plan = build_plan(src(), &meta, 10.0, 15.0, &[10.0], &TrimConfig::default()).unwrap();
        assert_eq!(plan.strategy, TrimStrategy::StreamCopy);

        let config = TrimConfig {
            corrective_rotation_deg: Some(-1.0),
            ..Default::default()
        };
        let plan = build_plan(src(), &meta, 10.0, 15.0, &[10.0], &config).unwrap();
        assert_eq!(plan.strategy, TrimStrategy::Reencode);
        assert!(plan.video_filter.unwrap().starts_with("rotate="));

        // Explicit zero rotation metadata suppresses the correction
        let plan = build_plan(src(), &probe(1920, 1080, Some(0.0), 60.0), 10.0, 15.0, &[10.0], &config).unwrap();
        assert_eq!(plan.strategy, TrimStrategy::StreamCopy);
    }

    #[test]
    fn test_odd_dimensions_force_reencode() {
        let plan = build_plan(src(), &probe(1921, 1080, None, 60.0), 10.0, 15.0, &[10.0], &TrimConfig::default())
            .unwrap();
        assert_eq!(plan.strategy, TrimStrategy::Reencode);
        assert!(plan.video_filter.unwrap().contains("trunc(iw/2)*2"));
    }

    #[test]
    fn test_plan_cuts_first_sized_video_stream() {
        let mut meta = probe(1920, 1080, None, 60.0);
        meta.streams[0].index = 1;
        meta.streams.insert(
            0,
            StreamInfo {
                index: 0,
                kind: StreamKind::Video,
                codec: "mjpeg".into(),
                width: 0,
                height: 0,
                frame_rate: 0.0,
                pix_fmt: None,
            },
        );
        meta.streams[2].index = 2;

        let plan = build_plan(src(), &meta, 10.0, 15.0, &[9.5], &TrimConfig::default()).unwrap();
        assert_eq!(plan.video_stream, 1);
        assert_eq!(plan.strategy, TrimStrategy::StreamCopy);

        let args = build_command(&plan, Path::new("/work/out.mp4"), &EncodingConfig::default()).build_args();
        assert!(args.windows(2).any(|w| w == ["-map", "0:1"]));
    }

    #[test]
    fn test_invalid_windows() {
        let meta = probe(1920, 1080, None, 60.0);
        let config = TrimConfig::default();
        let err = build_plan(src(), &meta, 15.0, 15.0, &[], &config).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Trim);
        let err = build_plan(src(), &meta, 60.0, 65.0, &[], &config).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Trim);
        assert!(build_plan(src(), &meta, f64::NAN, 5.0, &[], &config).is_err());
    }

    #[test]
    fn test_end_clamped_to_source() {
        let plan = build_plan(src(), &probe(1920, 1080, None, 12.0), 10.0, 15.0, &[10.0], &TrimConfig::default())
            .unwrap();
        assert_eq!(plan.end, 12.0);
    }

    #[test]
    fn test_stream_copy_command_seeks_to_keyframe() {
        let plan = build_plan(src(), &probe(1920, 1080, None, 60.0), 10.0, 15.0, &[9.5], &TrimConfig::default())
            .unwrap();
        let args = build_command(&plan, Path::new("/work/out.mp4"), &EncodingConfig::default()).build_args();
        assert!(args.windows(2).any(|w| w == ["-ss", "9.500"]));
        assert!(args.windows(2).any(|w| w == ["-t", "5.500"]));
        assert!(args.windows(2).any(|w| w == ["-avoid_negative_ts", "make_zero"]));
        assert!(!args.iter().any(|a| a == "-vf"));
    }

    #[test]
    fn test_reencode_command() {
        let plan = build_plan(src(), &probe(1920, 1080, Some(270.0), 60.0), 10.0, 15.0, &[], &TrimConfig::default())
            .unwrap();
        let args = build_command(&plan, Path::new("/work/out.mp4"), &EncodingConfig::default()).build_args();
        assert!(args.contains(&"-noautorotate".to_string()));
        assert!(args.windows(2).any(|w| w == ["-display_rotation:0", "0"]));
        assert!(args.windows(2).any(|w| w == ["-ss", "10.000"]));
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(args.windows(2).any(|w| w == ["-c:a", "aac"]));
        assert!(args.windows(2).any(|w| w[0] == "-vf" && w[1].starts_with("transpose=2,")));
    }

    #[test]
    fn test_display_rotation_reset_only_when_rotating() {
        let copy = build_plan(src(), &probe(1920, 1080, None, 60.0), 10.0, 15.0, &[9.5], &TrimConfig::default())
            .unwrap();
        assert!(!copy.reset_display_rotation);
        let args = build_command(&copy, Path::new("/work/out.mp4"), &EncodingConfig::default()).build_args();
        assert!(!args.iter().any(|a| a.starts_with("-display_rotation")));

        let config = TrimConfig {
            corrective_rotation_deg: Some(90.0),
            ..Default::default()
        };
        let corrected = build_plan(src(), &probe(1920, 1080, None, 60.0), 10.0, 15.0, &[], &config).unwrap();
        assert!(corrected.reset_display_rotation);

        let legacy = TrimConfig {
            reset_display_rotation: false,
            ..Default::default()
        };
        let plan = build_plan(src(), &probe(1920, 1080, Some(90.0), 60.0), 10.0, 15.0, &[], &legacy).unwrap();
        assert!(plan.disable_autorotate);
        assert!(!plan.reset_display_rotation);
    }

    #[test]
    fn test_check_output_dimensions() {
        let plan = build_plan(src(), &probe(1920, 1080, None, 60.0), 10.0, 15.0, &[], &TrimConfig::default())
            .unwrap();
        let err = check_output(&probe(1921, 1080, None, 5.0), 1000, &plan, &TrimConfig::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::H264Dimension);

        let ok = check_output(&probe(1920, 1080, None, 5.1), 1000, &plan, &TrimConfig::default()).unwrap();
        assert_eq!(ok, (1920, 1080, 5.1));

        let err = check_output(&probe(1920, 1080, None, 5.0), 0, &plan, &TrimConfig::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Ffmpeg);
    }

    #[test]
    fn test_check_output_duration_tolerance() {
        let config = TrimConfig::default();
        let copy = build_plan(src(), &probe(1920, 1080, None, 60.0), 10.0, 15.0, &[9.2], &config).unwrap();
        // Stream copy may run long by the keyframe offset
        assert!(check_output(&probe(1920, 1080, None, 5.8), 1, &copy, &config).is_ok());
        assert!(check_output(&probe(1920, 1080, None, 7.0), 1, &copy, &config).is_err());

        let reencode = build_plan(src(), &probe(1920, 1080, None, 60.0), 10.0, 15.0, &[], &config).unwrap();
        let err = check_output(&probe(1920, 1080, None, 6.0), 1, &reencode, &config).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Trim);

        let lenient = TrimConfig {
            duration_mismatch_fatal: false,
            ..Default::default()
        };
        assert!(check_output(&probe(1920, 1080, None, 6.0), 1, &reencode, &lenient).is_ok());
    }

    #[test]
    fn test_choose_strategy() {
        assert_eq!(choose_strategy(10.0, Some(9.0), false, false, 1.0).0, TrimStrategy::StreamCopy);
        assert_eq!(choose_strategy(10.0, Some(8.9), false, false, 1.0).0, TrimStrategy::Reencode);
        assert_eq!(choose_strategy(10.0, Some(10.0), true, false, 1.0).0, TrimStrategy::Reencode);
        assert_eq!(choose_strategy(10.0, Some(10.0), false, true, 1.0).0, TrimStrategy::Reencode);
        assert_eq!(choose_strategy(10.0, None, false, false, 1.0).0, TrimStrategy::Reencode);
    }
}
