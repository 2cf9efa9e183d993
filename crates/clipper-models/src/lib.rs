//! Shared data models for the clip processing pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Clip requests and their validation
//! - Encoding configuration
//! - Acquired media, probe metadata and trim plans
//! - Stored clip artifacts and processing results
//! - The job state machine and error code taxonomy

pub mod artifact;
pub mod encoding;
pub mod error_code;
pub mod job_state;
pub mod media;
pub mod request;
pub mod utils;

// Re-export common types
pub use artifact::{ArtifactSummary, ClipArtifact, ProcessingResult};
pub use encoding::EncodingConfig;
pub use error_code::ErrorCode;
pub use job_state::{JobState, JobStateMachine, Stage, TransitionError};
pub use media::{AcquiredMedia, ProbeMetadata, StreamInfo, StreamKind, TrimPlan, TrimStrategy};
pub use request::{validate, ClipRequest, ValidRequest, ValidationConfig, ValidationError};
pub use utils::{is_valid_job_id, sanitize_title, DEFAULT_TITLE, MAX_TITLE_CHARS};
