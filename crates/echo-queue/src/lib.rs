//! Durable job queue with lease-based claims.
//!
//! This crate provides:
//! - The [`JobQueue`] contract (enqueue, claim, ack, fail, lease reclamation)
//! - A Redis backend where each transition is one atomic Lua script
//! - An in-memory backend for tests and local development
//! - Polling claim with exponential backoff

pub mod error;
pub mod memory;
pub mod poll;
pub mod queue;
pub mod redis_queue;

use std::sync::Arc;

use tracing::warn;
use url::Url;

pub use error::{QueueError, QueueResult};
pub use memory::MemoryJobQueue;
pub use poll::poll_claim;
pub use queue::{ClaimedJob, FailOutcome, JobQueue, Lease, QueueConfig, QueueStats};
pub use redis_queue::RedisJobQueue;

/// Open the job queue named by `address`.
///
/// `redis://` and `rediss://` select Redis; `memory://` selects the
/// non-durable in-process queue.
pub fn open_job_queue(address: &str, config: QueueConfig) -> QueueResult<Arc<dyn JobQueue>> {
    let url = Url::parse(address)
        .map_err(|e| QueueError::Config(format!("invalid queue address {}: {}", address, e)))?;

    match url.scheme() {
        "redis" | "rediss" => Ok(Arc::new(RedisJobQueue::new(address, config)?)),
        "memory" => {
            warn!("Using in-memory job queue; jobs will not survive a restart");
            Ok(Arc::new(MemoryJobQueue::new(config)))
        }
        other => Err(QueueError::Config(format!(
            "unsupported queue scheme: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_backend_by_scheme() {
        let queue = open_job_queue("memory://", QueueConfig::default()).unwrap();
        assert_eq!(queue.backend_name(), "memory");

        let queue = open_job_queue("redis://127.0.0.1:6379", QueueConfig::default()).unwrap();
        assert_eq!(queue.backend_name(), "redis");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(matches!(
            open_job_queue("amqp://localhost", QueueConfig::default()),
            Err(QueueError::Config(_))
        ));
    }
}
