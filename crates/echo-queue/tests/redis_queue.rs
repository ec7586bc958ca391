//! Redis job queue integration tests.
//!
//! These run the Lua scripts against a real server and are skipped unless
//! `REDIS_URL` is set, e.g. `REDIS_URL=redis://localhost:6379 cargo test`.
//! Every test uses a fresh namespace, so a shared server is fine.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use echo_models::{BlobId, ErrorKind, JobError, JobState, SynthesisPayload};
use echo_queue::{FailOutcome, JobQueue, QueueConfig, QueueError, RedisJobQueue};

const LEASE: Duration = Duration::from_secs(60);

fn redis_url() -> Option<String> {
    match std::env::var("REDIS_URL") {
        Ok(url) if !url.is_empty() => Some(url),
        _ => {
            eprintln!("REDIS_URL not set, skipping Redis test");
            None
        }
    }
}

/// Each test gets its own namespace so runs never see each other's jobs.
fn queue_with(config: QueueConfig) -> Option<RedisJobQueue> {
    let url = redis_url()?;
    let config = config.with_namespace(format!("echo-test:{}", uuid::Uuid::new_v4()));
    Some(RedisJobQueue::new(&url, config).expect("Failed to create queue"))
}

fn queue(max_attempts: u32) -> Option<RedisJobQueue> {
    queue_with(QueueConfig::default().with_max_attempts(max_attempts))
}

fn payload() -> SynthesisPayload {
    SynthesisPayload::new("u1", "hello", "a1", "v1")
}

#[tokio::test]
async fn test_redis_connection() {
    let Some(queue) = queue(3) else { return };
    queue.ping().await.expect("Failed to ping Redis");
    let stats = queue.stats().await.expect("Failed to get stats");
    assert_eq!(stats.queued, 0);
}

#[tokio::test]
async fn test_enqueue_claim_ack() {
    let Some(queue) = queue(3) else { return };
    let job_id = queue.enqueue(payload()).await.expect("Failed to enqueue");

    let claimed = queue
        .claim("worker-a", LEASE)
        .await
        .expect("Failed to claim")
        .expect("Job should be claimable");
    assert_eq!(claimed.job.id, job_id);
    assert_eq!(claimed.lease.attempt, 1);
    assert_eq!(claimed.job.payload, payload());

    let blob_id = BlobId::for_job(&job_id);
    queue.ack(&claimed.lease, &blob_id).await.expect("Failed to ack");

    let job = queue.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.result_blob_id, Some(blob_id.clone()));

    let err = queue.ack(&claimed.lease, &blob_id).await.unwrap_err();
    assert!(matches!(err, QueueError::UnknownJob(_)));
}

#[tokio::test]
async fn test_fail_until_dead_lettered() {
    let Some(queue) = queue(3) else { return };
    let job_id = queue.enqueue(payload()).await.unwrap();

    for attempt in 1..=3 {
        let claimed = queue.claim("worker-a", LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.lease.attempt, attempt);
        let outcome = queue
            .fail(
                &claimed.lease,
                JobError::new(ErrorKind::SynthesisTimeout, "timed out"),
            )
            .await
            .unwrap();
        if attempt < 3 {
            assert_eq!(outcome, FailOutcome::Retrying { attempts: attempt });
        } else {
            assert_eq!(outcome, FailOutcome::DeadLettered);
        }
    }

    let job = queue.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::DeadLettered);
    assert_eq!(job.last_error.unwrap().kind, ErrorKind::SynthesisTimeout);
    assert_eq!(queue.stats().await.unwrap().dead_lettered, 1);
    assert!(queue.claim("worker-a", LEASE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed() {
    let Some(queue) = queue(3) else { return };
    let job_id = queue.enqueue(payload()).await.unwrap();

    let stale = queue
        .claim("worker-a", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let fresh = queue.claim("worker-b", LEASE).await.unwrap().unwrap();
    assert_eq!(fresh.job.id, job_id);
    assert_eq!(fresh.lease.attempt, 2);
    assert_eq!(
        fresh.job.last_error.map(|e| e.kind),
        Some(ErrorKind::LeaseExpired)
    );

    let err = queue
        .ack(&stale.lease, &BlobId::for_job(&job_id))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost { .. }));
}

#[tokio::test]
async fn test_concurrent_claims_are_exclusive() {
    let Some(queue) = queue(3) else { return };
    let queue = Arc::new(queue);
    for _ in 0..40 {
        queue.enqueue(payload()).await.unwrap();
    }

    let claims = (0..8).map(|w| {
        let queue = queue.clone();
        async move {
            let mut ids = Vec::new();
            while let Some(claimed) = queue.claim(&format!("worker-{}", w), LEASE).await.unwrap() {
                ids.push(claimed.job.id);
            }
            ids
        }
    });

    let mut seen = HashSet::new();
    for ids in futures::future::join_all(claims).await {
        for id in ids {
            assert!(seen.insert(id), "job claimed twice");
        }
    }
    assert_eq!(seen.len(), 40);
}

#[tokio::test]
async fn test_late_ack_accepted_before_reclaim() {
    let Some(queue) = queue(3) else { return };
    let job_id = queue.enqueue(payload()).await.unwrap();
    let claimed = queue
        .claim("worker-a", Duration::from_millis(20))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    queue
        .ack(&claimed.lease, &BlobId::for_job(&job_id))
        .await
        .unwrap();
    let job = queue.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(queue.stats().await.unwrap().processing, 0);
}

#[tokio::test]
async fn test_sweep_dead_letters_final_attempt() {
    let Some(queue) = queue(1) else { return };
    let job_id = queue.enqueue(payload()).await.unwrap();
    queue
        .claim("worker-a", Duration::from_millis(20))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(queue.reclaim_expired().await.unwrap(), 1);
    let job = queue.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::DeadLettered);
    assert_eq!(job.last_error.map(|e| e.kind), Some(ErrorKind::LeaseExpired));

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.dead_lettered, 1);
    assert!(queue.claim("worker-b", LEASE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_dead_letter_count_expires_with_retention() {
    let config = QueueConfig {
        max_attempts: 1,
        job_retention: Some(Duration::from_secs(1)),
        ..QueueConfig::default()
    };
    let Some(queue) = queue_with(config) else { return };
    let job_id = queue.enqueue(payload()).await.unwrap();
    let claimed = queue.claim("worker-a", LEASE).await.unwrap().unwrap();
    let outcome = queue
        .fail(
            &claimed.lease,
            JobError::new(ErrorKind::SynthesisRejected, "bad input"),
        )
        .await
        .unwrap();
    assert_eq!(outcome, FailOutcome::DeadLettered);
    assert_eq!(queue.stats().await.unwrap().dead_lettered, 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(queue.stats().await.unwrap().dead_lettered, 0);
    assert!(queue.get(&job_id).await.unwrap().is_none());

    // The sweep trims the expired entry for good.
    queue.reclaim_expired().await.unwrap();
    assert_eq!(queue.stats().await.unwrap().dead_lettered, 0);
}
