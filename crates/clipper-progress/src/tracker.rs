//! Per-job state owner.

use std::sync::Arc;
use tracing::{debug, warn};

use clipper_models::{ClipArtifact, ErrorCode, JobState, JobStateMachine, Stage, TransitionError};

use crate::progress::{JobSnapshot, ProgressReporter};

/// Drives one job's [`JobStateMachine`] and mirrors accepted transitions to a reporter.
///
/// Reporter failures are logged and never fail the job.
pub struct JobTracker {
    machine: JobStateMachine,
    reporter: Arc<dyn ProgressReporter>,
}

impl JobTracker {
    pub fn new(job_id: impl Into<String>, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            machine: JobStateMachine::new(job_id),
            reporter,
        }
    }

    pub fn job_id(&self) -> &str {
        self.machine.job_id()
    }

    pub fn state(&self) -> &JobState {
        self.machine.state()
    }

    /// Percent of the current state; terminal errors report `None`.
    pub fn percent(&self) -> Option<u8> {
        self.machine.state().percent()
    }

    pub async fn advance(&mut self, stage: Stage, percent: u8) {
        let result = self.machine.advance(stage, percent);
        match result {
            Ok(true) => self.publish().await,
            Ok(false) => {}
            Err(e) => self.reject(e),
        }
    }

    pub async fn complete(&mut self, artifact: ClipArtifact) {
        let result = self.machine.complete(artifact).map(|_| ());
        self.apply(result).await;
    }

    pub async fn fail(&mut self, code: ErrorCode, message: impl Into<String>) {
        let result = self.machine.fail(code, message).map(|_| ());
        self.apply(result).await;
    }

    async fn apply(&mut self, result: Result<(), TransitionError>) {
        match result {
            Ok(()) => self.publish().await,
            Err(e) => self.reject(e),
        }
    }

    fn reject(&self, e: TransitionError) {
        warn!(job_id = self.job_id(), error = %e, "Rejected job state transition");
    }

    async fn publish(&self) {
        let snapshot = JobSnapshot::of(&self.machine);
        debug!(job_id = self.job_id(), seq = snapshot.seq, state = %snapshot.state, "Job state");
        if let Err(e) = self.reporter.record(&snapshot).await {
            warn!(job_id = self.job_id(), error = %e, "Failed to record job progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProgressResult;
    use crate::progress::MemoryProgressReporter;
    use async_trait::async_trait;

    struct BrokenReporter;

    #[async_trait]
    impl ProgressReporter for BrokenReporter {
        async fn record(&self, _snapshot: &JobSnapshot) -> ProgressResult<()> {
            Err(redis::RedisError::from((redis::ErrorKind::IoError, "down")).into())
        }

        async fn current(&self, _job_id: &str) -> ProgressResult<Option<JobSnapshot>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_tracker_mirrors_transitions() {
        let reporter = Arc::new(MemoryProgressReporter::new());
        let mut tracker = JobTracker::new("job", reporter.clone());

        tracker.advance(Stage::Validate, 5).await;
        tracker.advance(Stage::ExtractTitle, 5).await;
        tracker.advance(Stage::ExtractTitle, 5).await;
        tracker.advance(Stage::Acquire, 30).await;
        tracker.fail(ErrorCode::Download, "Could not download the source video").await;
        // Ignored after the terminal state
        tracker.advance(Stage::Save, 90).await;

        let history = reporter.history("job");
        assert_eq!(history.len(), 4);
        assert!(history.windows(2).all(|w| w[0].seq < w[1].seq));
        assert!(matches!(history[3].state, JobState::Error { .. }));
        assert!(tracker.state().is_terminal());
    }

    #[tokio::test]
    async fn test_reporter_failure_is_not_fatal() {
        let mut tracker = JobTracker::new("job", Arc::new(BrokenReporter));
        tracker.advance(Stage::Validate, 5).await;
        assert_eq!(tracker.percent(), Some(5));
    }
}
