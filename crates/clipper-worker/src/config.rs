//! Worker configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clipper_media::{AcquirerConfig, TrimConfig};
use clipper_models::ValidationConfig;
use clipper_storage::{DeliveryConfig, StoreConfig};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Parent of the per-job temporary directories
    pub work_dir: PathBuf,
    /// Root of the artifact store
    pub artifact_dir: PathBuf,
    /// Public base URL of download links
    pub base_url: String,
    /// Download URL signing secret; links are unsigned without it
    pub signing_secret: Option<String>,
    pub min_duration_secs: f64,
    pub max_duration_secs: f64,
    /// Height cap of the generic format selector
    pub height_cap: u32,
    pub metadata_timeout: Duration,
    pub probe_timeout: Duration,
    pub encode_timeout: Duration,
    /// Budget for a whole job, all stages included
    pub job_timeout: Duration,
    /// JSON list of client personas; the built-in set when unset
    pub persona_file: Option<PathBuf>,
    /// Netscape cookie file handed to yt-dlp
    pub cookies_file: Option<PathBuf>,
    /// Rotation applied to sources without rotation metadata
    pub corrective_rotation_deg: Option<f64>,
    pub duration_tolerance: f64,
    pub duration_mismatch_fatal: bool,
    /// Reset the input display matrix when rotating; needs FFmpeg 7
    pub reset_display_rotation: bool,
    /// Days searched by artifact lookups
    pub lookback_days: u32,
    /// Progress goes to Redis when set, in-memory otherwise
    pub redis_url: Option<String>,
    pub progress_ttl: Duration,
    /// Prometheus listener address
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let validation = ValidationConfig::default();
        let trim = TrimConfig::default();
        Self {
            work_dir: PathBuf::from("/tmp/clipper"),
            artifact_dir: StoreConfig::default().base_dir,
            base_url: DeliveryConfig::default().base_url,
            signing_secret: None,
            min_duration_secs: validation.min_duration_secs,
            max_duration_secs: validation.max_duration_secs,
            height_cap: AcquirerConfig::default().height_cap,
            metadata_timeout: Duration::from_secs(60),
            probe_timeout: trim.probe_timeout,
            encode_timeout: trim.encode_timeout,
            job_timeout: Duration::from_secs(900), // 15 minutes
            persona_file: None,
            cookies_file: None,
            corrective_rotation_deg: trim.corrective_rotation_deg,
            duration_tolerance: trim.duration_tolerance,
            duration_mismatch_fatal: trim.duration_mismatch_fatal,
            reset_display_rotation: trim.reset_display_rotation,
            lookback_days: StoreConfig::default().lookback_days,
            redis_url: None,
            progress_ttl: Duration::from_secs(86_400),
            metrics_addr: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary variable source.
    ///
    /// Unset, empty or unparsable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let secs = |key: &str| parse::<u64>(var(key)).map(Duration::from_secs);

        let defaults = Self::default();
        Self {
            work_dir: var("CLIPPER_WORK_DIR").map(PathBuf::from).unwrap_or(defaults.work_dir),
            artifact_dir: var("CLIPPER_ARTIFACT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifact_dir),
            base_url: var("CLIPPER_BASE_URL").unwrap_or(defaults.base_url),
            signing_secret: var("CLIPPER_SIGNING_SECRET"),
            min_duration_secs: parse(var("CLIPPER_MIN_DURATION_SECS"))
                .unwrap_or(defaults.min_duration_secs),
            max_duration_secs: parse(var("CLIPPER_MAX_DURATION_SECS"))
                .unwrap_or(defaults.max_duration_secs),
            height_cap: parse(var("CLIPPER_HEIGHT_CAP")).unwrap_or(defaults.height_cap),
            metadata_timeout: secs("CLIPPER_METADATA_TIMEOUT_SECS")
                .unwrap_or(defaults.metadata_timeout),
            probe_timeout: secs("CLIPPER_PROBE_TIMEOUT_SECS").unwrap_or(defaults.probe_timeout),
            encode_timeout: secs("CLIPPER_ENCODE_TIMEOUT_SECS").unwrap_or(defaults.encode_timeout),
            job_timeout: secs("CLIPPER_JOB_TIMEOUT_SECS").unwrap_or(defaults.job_timeout),
            persona_file: var("CLIPPER_PERSONA_FILE").map(PathBuf::from),
            cookies_file: var("CLIPPER_COOKIES_FILE").map(PathBuf::from),
            corrective_rotation_deg: parse(var("CLIPPER_CORRECTIVE_ROTATION_DEG"))
                .or(defaults.corrective_rotation_deg),
            duration_tolerance: parse(var("CLIPPER_DURATION_TOLERANCE_SECS"))
                .unwrap_or(defaults.duration_tolerance),
            duration_mismatch_fatal: parse_bool(var("CLIPPER_DURATION_MISMATCH_FATAL"))
                .unwrap_or(defaults.duration_mismatch_fatal),
            reset_display_rotation: parse_bool(var("CLIPPER_RESET_DISPLAY_ROTATION"))
                .unwrap_or(defaults.reset_display_rotation),
            lookback_days: parse(var("CLIPPER_LOOKBACK_DAYS")).unwrap_or(defaults.lookback_days),
            redis_url: var("REDIS_URL"),
            progress_ttl: secs("CLIPPER_PROGRESS_TTL_SECS").unwrap_or(defaults.progress_ttl),
            metrics_addr: parse(var("CLIPPER_METRICS_ADDR")),
        }
    }

    pub fn validation(&self) -> ValidationConfig {
        ValidationConfig {
            min_duration_secs: self.min_duration_secs,
            max_duration_secs: self.max_duration_secs,
        }
    }

    pub fn acquirer(&self) -> AcquirerConfig {
        AcquirerConfig {
            height_cap: self.height_cap,
            ..Default::default()
        }
    }

    pub fn trim(&self) -> TrimConfig {
        TrimConfig {
            corrective_rotation_deg: self.corrective_rotation_deg,
            duration_tolerance: self.duration_tolerance,
            duration_mismatch_fatal: self.duration_mismatch_fatal,
            reset_display_rotation: self.reset_display_rotation,
            encode_timeout: self.encode_timeout,
            probe_timeout: self.probe_timeout,
            ..Default::default()
        }
    }

    pub fn store(&self) -> StoreConfig {
        StoreConfig {
            base_dir: self.artifact_dir.clone(),
            lookback_days: self.lookback_days,
        }
    }

    pub fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            base_url: self.base_url.clone(),
            signing_secret: self.signing_secret.clone(),
        }
    }
}

fn parse<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.parse().ok())
}

fn parse_bool(value: Option<String>) -> Option<bool> {
    match value?.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
