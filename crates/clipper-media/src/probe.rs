//! FFprobe stream metadata and keyframe lookup.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use clipper_models::media::normalize_degrees;
use clipper_models::{ProbeMetadata, StreamInfo, StreamKind};

use crate::command::{check_ffprobe, output_with_timeout, FFPROBE};
use crate::error::{MediaError, MediaResult};

/// FFprobe JSON output format.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    format_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: u32,
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    pix_fmt: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    tags: Option<FfprobeTags>,
    #[serde(default)]
    disposition: Option<FfprobeDisposition>,
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
}

#[derive(Debug, Deserialize)]
struct FfprobeTags {
    rotate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeDisposition {
    #[serde(default)]
    attached_pic: u8,
}

#[derive(Debug, Deserialize)]
struct FfprobeSideData {
    /// Counter-clockwise rotation from the display matrix
    rotation: Option<f64>,
}

impl FfprobeStream {
    fn kind(&self) -> StreamKind {
        let cover_art = self.disposition.as_ref().map_or(false, |d| d.attached_pic == 1);
        match self.codec_type.as_deref() {
            Some("video") if !cover_art => StreamKind::Video,
            Some("audio") => StreamKind::Audio,
            Some("subtitle") => StreamKind::Subtitle,
            _ => StreamKind::Other,
        }
    }

    /// Clockwise rotation; the display matrix wins over the legacy tag.
    fn rotation(&self) -> Option<f64> {
        if let Some(ccw) = self.side_data_list.iter().find_map(|sd| sd.rotation) {
            return Some(normalize_degrees(-ccw));
        }
        self.tags
            .as_ref()
            .and_then(|t| t.rotate.as_deref())
            .and_then(|r| r.trim().parse::<f64>().ok())
            .map(normalize_degrees)
    }
}

/// Parse `ffprobe -print_format json -show_format -show_streams` output.
pub fn parse_probe_output(stdout: &[u8]) -> MediaResult<ProbeMetadata> {
    let probe: FfprobeOutput = serde_json::from_slice(stdout)?;

    let streams: Vec<StreamInfo> = probe
        .streams
        .iter()
        .map(|s| {
            let kind = s.kind();
            let frame_rate = if kind == StreamKind::Video {
                s.avg_frame_rate
                    .as_deref()
                    .and_then(parse_frame_rate)
                    .filter(|fps| *fps > 0.0)
                    .or_else(|| s.r_frame_rate.as_deref().and_then(parse_frame_rate))
                    .unwrap_or(0.0)
            } else {
                0.0
            };
            StreamInfo {
                index: s.index,
                kind,
                codec: s.codec_name.clone().unwrap_or_default(),
                width: s.width.unwrap_or(0),
                height: s.height.unwrap_or(0),
                frame_rate,
                pix_fmt: s.pix_fmt.clone(),
            }
        })
        .collect();

    let rotation = probe
        .streams
        .iter()
        .find(|s| s.kind() == StreamKind::Video)
        .and_then(FfprobeStream::rotation);

    // Fall back to the longest stream when the container has no duration
    let duration = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| {
            probe
                .streams
                .iter()
                .filter_map(|s| s.duration.as_deref()?.parse::<f64>().ok())
                .reduce(f64::max)
        })
        .unwrap_or(0.0);

    Ok(ProbeMetadata {
        streams,
        rotation,
        duration,
        format_name: probe.format.and_then(|f| f.format_name),
    })
}

/// Probe a media file for stream and container metadata.
pub async fn probe_file(path: impl AsRef<Path>, timeout: Duration) -> MediaResult<ProbeMetadata> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(MediaError::FileNotFound(path.to_path_buf()));
    }

    check_ffprobe()?;

    let mut cmd = Command::new(FFPROBE);
    cmd.args([
        "-v",
        "error",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
    ])
    .arg(path);

    let output = output_with_timeout(&mut cmd, FFPROBE, timeout).await?;

    if !output.status.success() {
        return Err(MediaError::ffprobe_failed(
            "FFprobe failed",
            Some(String::from_utf8_lossy(&output.stderr).to_string()),
        ));
    }

    parse_probe_output(&output.stdout)
}

/// Keyframe timestamps of stream `stream` within `[from, to]`.
pub async fn probe_keyframes(
    path: impl AsRef<Path>,
    stream: u32,
    from: f64,
    to: f64,
    timeout: Duration,
) -> MediaResult<Vec<f64>> {
    let path = path.as_ref();
    check_ffprobe()?;

    let interval = format!("{:.3}%{:.3}", from.max(0.0), to);
    let stream = stream.to_string();
    debug!(path = %path.display(), interval = %interval, "Probing keyframes");

    let mut cmd = Command::new(FFPROBE);
    cmd.args([
        "-v",
        "error",
        "-select_streams",
        stream.as_str(),
        "-skip_frame",
        "nokey",
        "-read_intervals",
        interval.as_str(),
        "-show_entries",
        "frame=pts_time",
        "-of",
        "csv=p=0",
    ])
    .arg(path);

    let output = output_with_timeout(&mut cmd, FFPROBE, timeout).await?;

    if !output.status.success() {
        return Err(MediaError::ffprobe_failed(
            "FFprobe keyframe scan failed",
            Some(String::from_utf8_lossy(&output.stderr).to_string()),
        ));
    }

    Ok(parse_keyframe_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse one timestamp per line, skipping `N/A` and blank entries.
pub fn parse_keyframe_output(stdout: &str) -> Vec<f64> {
    let mut times: Vec<f64> = stdout
        .lines()
        .filter_map(|line| line.split(',').next())
        .filter_map(|t| t.trim().parse::<f64>().ok())
        .filter(|t| t.is_finite())
        .collect();
    times.sort_by(|a, b| a.total_cmp(b));
    times.dedup();
    times
}

/// Latest keyframe at or before `start`.
pub fn nearest_keyframe_at_or_before(keyframes: &[f64], start: f64) -> Option<f64> {
    // Container timestamps are rounded to the microsecond
    const EPSILON: f64 = 1e-6;
    keyframes
        .iter()
        .copied()
        .filter(|kf| *kf <= start + EPSILON)
        .reduce(f64::max)
}

/// Parse frame rate string (e.g., "30/1" or "29.97").
pub fn parse_frame_rate(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den > 0.0 {
            return Some(num / den);
        }
        return None;
    }
    s.parse().ok()
}
