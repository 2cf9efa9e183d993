//! Job state tracking and progress reporting.
//!
//! The orchestrator owns one [`JobTracker`] per job. The tracker applies every
//! transition to a [`clipper_models::JobStateMachine`] first and only then
//! hands the resulting [`JobSnapshot`] to a [`ProgressReporter`], so readers
//! never observe a backwards step.

pub mod error;
pub mod progress;
pub mod tracker;

pub use error::{ProgressError, ProgressResult};
pub use progress::{JobSnapshot, MemoryProgressReporter, ProgressReporter, RedisProgressReporter};
pub use tracker::JobTracker;
