//! Synthesis worker.
//!
//! This crate provides:
//! - A pool of claim-execute-report loops over the job queue
//! - Streaming of rendered videos into the blob store
//! - Retry of queue bookkeeping on transient backend errors
//! - A lease sweeper and graceful shutdown

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod processor;
pub mod retry;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use logging::JobLogger;
pub use pool::WorkerPool;
pub use processor::{JobOutcome, JobProcessor};
