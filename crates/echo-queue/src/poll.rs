//! Blocking claim with backoff.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::QueueResult;
use crate::queue::{ClaimedJob, JobQueue};

/// First delay between empty claims.
pub const INITIAL_POLL_DELAY: Duration = Duration::from_millis(50);

/// Longest delay between empty claims.
pub const MAX_POLL_DELAY: Duration = Duration::from_secs(1);

/// Claim a job, polling with exponential backoff until one is available or
/// `wait` has elapsed.
///
/// Returns `Ok(None)` once the deadline passes. A zero `wait` makes exactly
/// one attempt.
pub async fn poll_claim(
    queue: &dyn JobQueue,
    worker_id: &str,
    lease_duration: Duration,
    wait: Duration,
) -> QueueResult<Option<ClaimedJob>> {
    let deadline = Instant::now() + wait;
    let mut delay = INITIAL_POLL_DELAY;

    loop {
        if let Some(claimed) = queue.claim(worker_id, lease_duration).await? {
            return Ok(Some(claimed));
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }

        tokio::time::sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(MAX_POLL_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryJobQueue;
    use echo_models::SynthesisPayload;
    use std::sync::Arc;

    #[tokio::test]
    async fn empty_queue_returns_none_after_wait() {
        let queue = MemoryJobQueue::default();
        let started = std::time::Instant::now();

        let claimed = poll_claim(
            &queue,
            "w1",
            Duration::from_secs(60),
            Duration::from_millis(200),
        )
        .await
        .unwrap();

        assert!(claimed.is_none());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn zero_wait_makes_a_single_attempt() {
        let queue = MemoryJobQueue::default();
        let claimed = poll_claim(&queue, "w1", Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn picks_up_job_enqueued_while_waiting() {
        let queue = Arc::new(MemoryJobQueue::default());
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            producer
                .enqueue(SynthesisPayload::new("u1", "hello", "a1", "v1"))
                .await
                .unwrap();
        });

        let claimed = poll_claim(
            queue.as_ref(),
            "w1",
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(claimed.is_some());
    }
}
