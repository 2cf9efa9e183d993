//! Clip processing worker binary.
//!
//! Reads one `ClipRequest` JSON document per line from the file given as the
//! first argument (stdin otherwise) and prints one `ProcessingResult` JSON
//! line per request.

use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use clipper_media::{check_ffmpeg, check_ffprobe, check_ytdlp};
use clipper_models::{ClipRequest, ErrorCode, ProcessingResult};
use clipper_progress::{MemoryProgressReporter, ProgressReporter, RedisProgressReporter};
use clipper_worker::{ProcessingOrchestrator, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing()?;

    info!("Starting clipper-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", redacted(&config));

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(%addr, "Serving metrics");
    }

    for (tool, found) in [
        ("ffmpeg", check_ffmpeg()),
        ("ffprobe", check_ffprobe()),
        ("yt-dlp", check_ytdlp()),
    ] {
        match found {
            Ok(path) => info!(tool, path = %path.display(), "Found external tool"),
            Err(e) => warn!(tool, error = %e, "External tool missing, jobs will fail"),
        }
    }

    let reporter: Arc<dyn ProgressReporter> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisProgressReporter::new(url, config.progress_ttl)
                .context("Failed to create Redis progress reporter")?,
        ),
        None => Arc::new(MemoryProgressReporter::new()),
    };

    let orchestrator = ProcessingOrchestrator::from_config(&config, reporter)
        .await
        .context("Failed to create processing orchestrator")?;

    // Setup signal handler
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            cancel_tx.send_replace(true);
        }
    });

    let input: Box<dyn AsyncBufRead + Unpin + Send> = match std::env::args().nth(1) {
        Some(path) => Box::new(BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path))?,
        )),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let mut lines = input.lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if *cancel_rx.borrow() {
            break;
        }

        let result = match serde_json::from_str::<ClipRequest>(&line) {
            Ok(request) => {
                orchestrator
                    .process_with_cancel(&request, Some(cancel_rx.clone()))
                    .await
            }
            Err(e) => {
                warn!(error = %e, "Malformed clip request");
                ProcessingResult::failed(job_id_of(&line), ErrorCode::Validation, 0.0)
            }
        };

        let mut out = serde_json::to_string(&result)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }

    info!("Worker shutdown complete");
    Ok(())
}

/// Colored output for dev, JSON with `LOG_FORMAT=json`.
fn init_tracing() -> anyhow::Result<()> {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("clipper=info".parse()?);

    // Results go to stdout, logs to stderr
    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .with(env_filter)
            .init();
    }
    Ok(())
}

fn redacted(config: &WorkerConfig) -> WorkerConfig {
    let mut shown = config.clone();
    if shown.signing_secret.is_some() {
        shown.signing_secret = Some("<redacted>".to_string());
    }
    shown
}

/// Best-effort job id of a request that failed to deserialize.
fn job_id_of(line: &str) -> String {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("job_id").and_then(|id| id.as_str()).map(str::to_string))
        .unwrap_or_default()
}
