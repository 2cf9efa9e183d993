//! Redis progress reporter integration tests.
//!
//! Run with `REDIS_URL=redis://... cargo test -p clipper-progress -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use clipper_models::{ErrorCode, JobState, JobStateMachine, Stage};
use clipper_progress::{JobSnapshot, JobTracker, ProgressReporter, RedisProgressReporter};

fn reporter() -> RedisProgressReporter {
    dotenvy::dotenv().ok();
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    RedisProgressReporter::new(&url, Duration::from_secs(60))
        .expect("Failed to create reporter")
        .with_key_prefix("clipper-test:job:")
}

fn unique_job_id(tag: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{}-{}", tag, nanos)
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_snapshot_round_trip() {
    let reporter = reporter();
    let job_id = unique_job_id("roundtrip");

    reporter.update(&job_id, Stage::Validate, 5).await.expect("update failed");
    reporter.update(&job_id, Stage::Acquire, 30).await.expect("update failed");

    let current = reporter
        .current(&job_id)
        .await
        .expect("read failed")
        .expect("snapshot missing");
    assert_eq!(current.seq, 2);
    assert_eq!(
        current.state,
        JobState::Working {
            stage: Stage::Acquire,
            percent: 30
        }
    );
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_stored_state_rejects_backwards_update() {
    let reporter = reporter();
    let job_id = unique_job_id("backwards");

    reporter.update(&job_id, Stage::Trim, 50).await.expect("update failed");
    assert!(reporter.update(&job_id, Stage::Acquire, 60).await.is_err());

    reporter
        .update_error(&job_id, ErrorCode::Trim, ErrorCode::Trim.user_message())
        .await
        .expect("update_error failed");
    assert!(reporter.update(&job_id, Stage::Save, 90).await.is_err());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_tracker_publishes_to_redis() {
    let reporter = Arc::new(reporter());
    let job_id = unique_job_id("tracker");

    let mut tracker = JobTracker::new(job_id.as_str(), reporter.clone());
    tracker.advance(Stage::Validate, 5).await;
    tracker.fail(ErrorCode::Download, ErrorCode::Download.user_message()).await;

    let current = reporter.current(&job_id).await.unwrap().unwrap();
    assert!(matches!(
        current.state,
        JobState::Error {
            code: ErrorCode::Download,
            ..
        }
    ));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_late_lower_seq_write_is_dropped() {
    let reporter = reporter();
    let job_id = unique_job_id("stale");

    let mut machine = JobStateMachine::new(job_id.as_str());
    machine.advance(Stage::Validate, 5).unwrap();
    let early = JobSnapshot::of(&machine);
    machine.advance(Stage::Trim, 50).unwrap();
    let late = JobSnapshot::of(&machine);

    reporter.record(&late).await.expect("record failed");
    reporter.record(&early).await.expect("stale record should be a no-op");

    let current = reporter.current(&job_id).await.unwrap().unwrap();
    assert_eq!(current.seq, late.seq);
    assert_eq!(current.state, late.state);
}
