//! Shared data models for the EchoPersona synthesis pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, their payload and state machine
//! - Blob identifiers
//! - Pipeline configuration

pub mod blob;
pub mod config;
pub mod job;

// Re-export common types
pub use blob::{BlobId, VIDEO_CONTENT_TYPE};
pub use config::{ConfigError, PipelineConfig};
pub use job::{ErrorKind, Job, JobError, JobId, JobState, SynthesisPayload};
