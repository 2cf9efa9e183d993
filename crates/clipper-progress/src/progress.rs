//! Progress sinks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use clipper_models::{ErrorCode, JobState, JobStateMachine, Stage};

use crate::error::ProgressResult;

/// Persisted view of a job's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    /// Sequence number of the transition that produced `state`
    pub seq: u64,
    pub state: JobState,
    pub updated_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn of(machine: &JobStateMachine) -> Self {
        Self {
            job_id: machine.job_id().to_string(),
            seq: machine.seq(),
            state: machine.state().clone(),
            updated_at: Utc::now(),
        }
    }
}

/// Sink for job progress.
///
/// Each job has a single writer; implementations only need to keep the
/// snapshot with the highest `seq`.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn record(&self, snapshot: &JobSnapshot) -> ProgressResult<()>;

    async fn current(&self, job_id: &str) -> ProgressResult<Option<JobSnapshot>>;

    /// Advance a job to `stage` at `percent`, starting from its stored state.
    async fn update(&self, job_id: &str, stage: Stage, percent: u8) -> ProgressResult<()> {
        let mut machine = self.machine(job_id).await?;
        if machine.advance(stage, percent)? {
            self.record(&JobSnapshot::of(&machine)).await?;
        }
        Ok(())
    }

    /// Move a job to its terminal error state.
    async fn update_error(&self, job_id: &str, code: ErrorCode, message: &str) -> ProgressResult<()> {
        let mut machine = self.machine(job_id).await?;
        machine.fail(code, message)?;
        self.record(&JobSnapshot::of(&machine)).await
    }

    #[doc(hidden)]
    async fn machine(&self, job_id: &str) -> ProgressResult<JobStateMachine> {
        Ok(match self.current(job_id).await? {
            Some(snapshot) => JobStateMachine::resume(job_id, snapshot.state, snapshot.seq),
            None => JobStateMachine::new(job_id),
        })
    }
}

/// Snapshots kept per job by [`MemoryProgressReporter::new`].
pub const DEFAULT_HISTORY_LIMIT: usize = 128;

/// Finished jobs kept by [`MemoryProgressReporter::new`].
pub const DEFAULT_FINISHED_LIMIT: usize = 1024;

#[derive(Debug, Default)]
struct MemoryJobs {
    snapshots: HashMap<String, VecDeque<JobSnapshot>>,
    /// Finished job ids, oldest first
    finished: VecDeque<String>,
}

/// In-process reporter keeping a bounded history per job.
///
/// At most `history_limit` snapshots are kept per job (always at least the
/// latest) and only the `finished_limit` most recently finished jobs are
/// retained, so a long-running worker does not grow without bound.
#[derive(Debug)]
pub struct MemoryProgressReporter {
    jobs: Mutex<MemoryJobs>,
    history_limit: usize,
    finished_limit: usize,
}

impl Default for MemoryProgressReporter {
    fn default() -> Self {
        Self::with_limits(DEFAULT_HISTORY_LIMIT, DEFAULT_FINISHED_LIMIT)
    }
}

impl MemoryProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(history_limit: usize, finished_limit: usize) -> Self {
        Self {
            jobs: Mutex::new(MemoryJobs::default()),
            history_limit: history_limit.max(1),
            finished_limit,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryJobs> {
        match self.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Retained snapshots of a job, oldest first.
    pub fn history(&self, job_id: &str) -> Vec<JobSnapshot> {
        self.lock()
            .snapshots
            .get(job_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of jobs currently held.
    pub fn job_count(&self) -> usize {
        self.lock().snapshots.len()
    }
}

#[async_trait]
impl ProgressReporter for MemoryProgressReporter {
    async fn record(&self, snapshot: &JobSnapshot) -> ProgressResult<()> {
        let mut jobs = self.lock();
        let history = jobs.snapshots.entry(snapshot.job_id.clone()).or_default();
        // Stale snapshots would look like a step backwards
        if history.back().map_or(false, |last| snapshot.seq <= last.seq) {
            return Ok(());
        }
        history.push_back(snapshot.clone());
        while history.len() > self.history_limit {
            history.pop_front();
        }

        if snapshot.state.is_terminal() {
            jobs.finished.push_back(snapshot.job_id.clone());
            while jobs.finished.len() > self.finished_limit {
                if let Some(evicted) = jobs.finished.pop_front() {
                    jobs.snapshots.remove(&evicted);
                }
            }
        }
        Ok(())
    }

    async fn current(&self, job_id: &str) -> ProgressResult<Option<JobSnapshot>> {
        Ok(self.lock().snapshots.get(job_id).and_then(|h| h.back().cloned()))
    }
}

/// Writes the snapshot and publishes it unless the stored one has an equal or
/// higher `seq`. Returns 1 when written, 0 when stale.
const RECORD_IF_NEWER: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
    local ok, decoded = pcall(cjson.decode, current)
    if ok and type(decoded) == 'table' and tonumber(decoded['seq']) ~= nil
        and tonumber(decoded['seq']) >= tonumber(ARGV[2]) then
        return 0
    end
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[3])
redis.call('PUBLISH', ARGV[4], ARGV[1])
return 1
"#;

/// Redis reporter: `SET <prefix><job_id> EX ttl` plus a publish on `progress:<job_id>`.
pub struct RedisProgressReporter {
    client: redis::Client,
    ttl: Duration,
    key_prefix: String,
}

impl RedisProgressReporter {
    pub fn new(redis_url: &str, ttl: Duration) -> ProgressResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            ttl,
            key_prefix: "clipper:job:".to_string(),
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn state_key(&self, job_id: &str) -> String {
        format!("{}{}", self.key_prefix, job_id)
    }

    /// Get the channel name for a job.
    pub fn channel_name(job_id: &str) -> String {
        format!("progress:{}", job_id)
    }
}

#[async_trait]
impl ProgressReporter for RedisProgressReporter {
    async fn record(&self, snapshot: &JobSnapshot) -> ProgressResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(snapshot)?;
        let key = self.state_key(&snapshot.job_id);
        let channel = Self::channel_name(&snapshot.job_id);

        let written: i32 = Script::new(RECORD_IF_NEWER)
            .key(&key)
            .arg(&payload)
            .arg(snapshot.seq)
            .arg(self.ttl.as_secs().max(1))
            .arg(&channel)
            .invoke_async(&mut conn)
            .await?;

        if written == 1 {
            debug!("Published job state to {}", channel);
        } else {
            debug!(job_id = %snapshot.job_id, seq = snapshot.seq, "Skipped stale job state");
        }
        Ok(())
    }

    async fn current(&self, job_id: &str) -> ProgressResult<Option<JobSnapshot>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload: Option<String> = conn.get(self.state_key(job_id)).await?;
        payload
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_provided_update_is_monotonic() {
        let reporter = MemoryProgressReporter::new();
        reporter.update("job", Stage::Validate, 5).await.unwrap();
        reporter.update("job", Stage::Trim, 50).await.unwrap();
        reporter.update("job", Stage::Trim, 40).await.unwrap();

        let current = reporter.current("job").await.unwrap().unwrap();
        assert_eq!(current.state.percent(), Some(50));
        assert_eq!(current.seq, 2);

        assert!(reporter.update("job", Stage::Acquire, 60).await.is_err());
    }

    #[tokio::test]
    async fn test_update_error_is_terminal() {
        let reporter = MemoryProgressReporter::new();
        reporter.update("job", Stage::Acquire, 10).await.unwrap();
        reporter
            .update_error("job", ErrorCode::Download, "Could not download the source video")
            .await
            .unwrap();

        let current = reporter.current("job").await.unwrap().unwrap();
        assert!(matches!(current.state, JobState::Error { code: ErrorCode::Download, .. }));
        assert!(reporter.update("job", Stage::Save, 90).await.is_err());
    }

    #[tokio::test]
    async fn test_stale_snapshot_ignored() {
        let reporter = MemoryProgressReporter::new();
        let mut machine = JobStateMachine::new("job");
        machine.advance(Stage::Validate, 5).unwrap();
        let early = JobSnapshot::of(&machine);
        machine.advance(Stage::Acquire, 30).unwrap();
        let late = JobSnapshot::of(&machine);

        reporter.record(&late).await.unwrap();
        reporter.record(&early).await.unwrap();

        assert_eq!(reporter.current("job").await.unwrap().unwrap().seq, late.seq);
        assert_eq!(reporter.history("job").len(), 1);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let reporter = MemoryProgressReporter::with_limits(3, 8);
        for percent in 1..=20 {
            reporter.update("job", Stage::Trim, percent).await.unwrap();
        }

        let history = reporter.history("job");
        assert_eq!(history.len(), 3);
        assert_eq!(history.last().unwrap().state.percent(), Some(20));
        assert_eq!(history[0].state.percent(), Some(18));
    }

    #[tokio::test]
    async fn test_finished_jobs_are_pruned() {
        let reporter = MemoryProgressReporter::with_limits(4, 2);
        for id in ["a", "b", "c"] {
            reporter.update(id, Stage::Acquire, 10).await.unwrap();
            reporter
                .update_error(id, ErrorCode::Download, "Could not download the source video")
                .await
                .unwrap();
        }
        reporter.update("running", Stage::Validate, 5).await.unwrap();

        assert_eq!(reporter.job_count(), 3);
        assert!(reporter.current("a").await.unwrap().is_none());
        assert!(reporter.current("b").await.unwrap().is_some());
        assert!(reporter.current("running").await.unwrap().is_some());
    }

    #[test]
    fn test_redis_names() {
        let reporter = RedisProgressReporter::new("redis://127.0.0.1/", Duration::from_secs(60))
            .unwrap()
            .with_key_prefix("test:");
        assert_eq!(reporter.state_key("abc"), "test:abc");
        assert_eq!(RedisProgressReporter::channel_name("abc"), "progress:abc");
    }

    #[test]
    fn test_snapshot_serialization() {
        let machine = JobStateMachine::new("job");
        let json = serde_json::to_value(JobSnapshot::of(&machine)).unwrap();
        assert_eq!(json["state"]["status"], "queued");
        assert_eq!(json["seq"], 0);
    }
}
