//! Job state machine.
//!
//! `Queued → Working(stage, %) → Done | Error`. Transitions only move
//! forward: stages never go back, percent never decreases while working, and
//! both `Done` and `Error` are final.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::artifact::ClipArtifact;
use crate::error_code::ErrorCode;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    ExtractTitle,
    Acquire,
    Analyze,
    Trim,
    Save,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::ExtractTitle => "extract_title",
            Stage::Acquire => "acquire",
            Stage::Analyze => "analyze",
            Stage::Trim => "trim",
            Stage::Save => "save",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable state of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Queued,
    Working {
        stage: Stage,
        percent: u8,
    },
    Done {
        artifact: ClipArtifact,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Working { .. } => "working",
            JobState::Done { .. } => "done",
            JobState::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done { .. } | JobState::Error { .. })
    }

    /// Progress percentage; `None` for failed jobs.
    pub fn percent(&self) -> Option<u8> {
        match self {
            JobState::Queued => Some(0),
            JobState::Working { percent, .. } => Some(*percent),
            JobState::Done { .. } => Some(100),
            JobState::Error { .. } => None,
        }
    }

    /// Whether moving from `self` to `next` keeps the job moving forward.
    pub fn can_transition_to(&self, next: &JobState) -> bool {
        match (self, next) {
            (JobState::Done { .. } | JobState::Error { .. }, _) => false,
            (_, JobState::Queued) => false,
            (JobState::Queued, _) => true,
            (
                JobState::Working { stage, percent },
                JobState::Working {
                    stage: next_stage,
                    percent: next_percent,
                },
            ) => next_stage >= stage && next_percent >= percent && *next_percent <= 100,
            (JobState::Working { .. }, JobState::Done { .. } | JobState::Error { .. }) => true,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Working { stage, percent } => write!(f, "working({}, {}%)", stage, percent),
            JobState::Error { code, .. } => write!(f, "error({})", code),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    #[error("illegal job state transition from {from} to {to}")]
    Illegal { from: String, to: String },
}

/// Owner of one job's state; rejects any backwards transition.
#[derive(Debug, Clone)]
pub struct JobStateMachine {
    job_id: String,
    state: JobState,
    /// Incremented on every accepted transition
    seq: u64,
}

impl JobStateMachine {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Queued,
            seq: 0,
        }
    }

    /// Rebuild a machine from a persisted state and sequence number.
    pub fn resume(job_id: impl Into<String>, state: JobState, seq: u64) -> Self {
        Self {
            job_id: job_id.into(),
            state,
            seq,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn transition(&mut self, next: JobState) -> Result<&JobState, TransitionError> {
        if !self.state.can_transition_to(&next) {
            return Err(TransitionError::Illegal {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.seq += 1;
        Ok(&self.state)
    }

    /// Move to `stage` at `percent`, never lowering the current percent.
    ///
    /// Returns `Ok(false)` when the update would not change the state.
    pub fn advance(&mut self, stage: Stage, percent: u8) -> Result<bool, TransitionError> {
        let percent = match &self.state {
            JobState::Working { percent: current, .. } => percent.max(*current),
            _ => percent,
        }
        .min(100);

        let next = JobState::Working { stage, percent };
        if self.state == next {
            return Ok(false);
        }
        self.transition(next).map(|_| true)
    }

    pub fn complete(&mut self, artifact: ClipArtifact) -> Result<&JobState, TransitionError> {
        self.transition(JobState::Done { artifact })
    }

    pub fn fail(&mut self, code: ErrorCode, message: impl Into<String>) -> Result<&JobState, TransitionError> {
        self.transition(JobState::Error {
            code,
            message: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn artifact() -> ClipArtifact {
        ClipArtifact {
            relative_path: "2024-01-01/t_job.mp4".into(),
            sha256: "00".repeat(32),
            byte_size: 1,
            filename: "t_job.mp4".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_forward_progression() {
        let mut sm = JobStateMachine::new("job");
        assert!(sm.advance(Stage::Validate, 5).unwrap());
        assert!(sm.advance(Stage::Acquire, 30).unwrap());
        assert!(sm.advance(Stage::Trim, 70).unwrap());
        sm.complete(artifact()).unwrap();
        assert!(sm.state().is_terminal());
        assert_eq!(sm.seq(), 4);
    }

    #[test]
    fn test_percent_never_decreases() {
        let mut sm = JobStateMachine::new("job");
        sm.advance(Stage::Trim, 60).unwrap();
        sm.advance(Stage::Trim, 40).unwrap();
        assert_eq!(sm.state().percent(), Some(60));
    }

    #[test]
    fn test_stage_cannot_go_back() {
        let mut sm = JobStateMachine::new("job");
        sm.advance(Stage::Analyze, 35).unwrap();
        assert!(sm.advance(Stage::Acquire, 40).is_err());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut sm = JobStateMachine::new("job");
        sm.fail(ErrorCode::Download, "boom").unwrap();
        assert!(sm.advance(Stage::Save, 90).is_err());
        assert!(sm.complete(artifact()).is_err());
        assert!(sm.fail(ErrorCode::Trim, "again").is_err());

        let mut sm = JobStateMachine::new("job");
        sm.complete(artifact()).unwrap();
        assert!(sm.fail(ErrorCode::Storage, "late").is_err());
    }

    #[test]
    fn test_cannot_return_to_queued() {
        let mut sm = JobStateMachine::new("job");
        assert!(sm.transition(JobState::Queued).is_err());
    }

    #[test]
    fn test_duplicate_update_is_noop() {
        let mut sm = JobStateMachine::new("job");
        assert!(sm.advance(Stage::Validate, 5).unwrap());
        assert!(sm.advance(Stage::ExtractTitle, 5).unwrap());
        assert!(!sm.advance(Stage::ExtractTitle, 5).unwrap());
        assert_eq!(sm.seq(), 2);
    }

    #[test]
    fn test_resume_keeps_guarantees() {
        let mut sm = JobStateMachine::resume(
            "job",
            JobState::Working {
                stage: Stage::Trim,
                percent: 50,
            },
            7,
        );
        assert!(sm.advance(Stage::Analyze, 60).is_err());
        assert!(sm.advance(Stage::Trim, 55).unwrap());
        assert_eq!(sm.seq(), 8);
    }

    #[test]
    fn test_state_serialization() {
        let state = JobState::Working {
            stage: Stage::ExtractTitle,
            percent: 5,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "working");
        assert_eq!(json["stage"], "extract_title");

        let err = JobState::Error {
            code: ErrorCode::Trim,
            message: "x".into(),
        };
        let back: JobState = serde_json::from_value(serde_json::to_value(&err).unwrap()).unwrap();
        assert_eq!(back, err);
    }
}
