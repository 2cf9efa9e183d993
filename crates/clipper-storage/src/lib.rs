//! Local artifact storage for finished clips.
//!
//! This crate provides:
//! - Atomic, date-partitioned clip persistence with SHA-256 digests
//! - Lookup and deletion across recent partitions
//! - Deterministic (optionally signed) download URLs

pub mod delivery;
pub mod error;
pub mod fs_utils;
pub mod store;

pub use delivery::{DeliveryConfig, DownloadUrlGenerator};
pub use error::{StorageError, StorageResult};
pub use store::{artifact_filename, sha256_file, ArtifactStore, StoreConfig};
