//! Clip processing worker.
//!
//! This crate provides:
//! - Environment-driven worker configuration
//! - The processing orchestrator tying acquisition, analysis, trimming and
//!   storage together
//! - Structured per-job logging

pub mod config;
pub mod error;
pub mod logging;
pub mod processor;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use logging::JobLogger;
pub use processor::{Components, OrchestratorSettings, ProcessingOrchestrator};
