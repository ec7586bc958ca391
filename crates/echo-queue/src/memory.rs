//! In-process job queue.
//!
//! Same state machine as the Redis backend, kept under one async mutex so
//! every transition is atomic. Nothing survives a restart: use it for tests
//! and local development only.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use echo_models::{BlobId, Job, JobError, JobId, JobState, SynthesisPayload};

use crate::error::{QueueError, QueueResult};
use crate::queue::{lease_deadline, ClaimedJob, FailOutcome, JobQueue, Lease, QueueConfig, QueueStats};

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    ready: VecDeque<JobId>,
}

impl State {
    /// Look up the job a lease refers to, checking the lease still holds.
    fn leased_job(&mut self, lease: &Lease) -> QueueResult<&mut Job> {
        let job = self
            .jobs
            .get_mut(&lease.job_id)
            .ok_or_else(|| QueueError::unknown_job(lease.job_id.as_str()))?;

        if job.state.is_terminal() {
            return Err(QueueError::unknown_job(lease.job_id.as_str()));
        }
        if job.state != JobState::Processing || job.attempts != lease.attempt {
            return Err(QueueError::lease_lost(lease.job_id.as_str(), lease.attempt));
        }
        Ok(job)
    }

    fn reclaim_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut expired: Vec<(DateTime<Utc>, JobId)> = self
            .jobs
            .values()
            .filter(|job| job.lease_expired(now))
            .map(|job| (job.lease_deadline.unwrap_or(now), job.id.clone()))
            .collect();
        expired.sort_by_key(|(deadline, _)| *deadline);

        for (_, job_id) in &expired {
            let Some(job) = self.jobs.get_mut(job_id) else {
                continue;
            };
            job.last_error = Some(JobError::lease_expired());
            job.lease_deadline = None;
            job.worker_id = None;
            job.updated_at = now;

            if job.attempts >= job.max_attempts {
                job.state = JobState::DeadLettered;
                warn!(job_id = %job_id, attempts = job.attempts, "Lease expired on final attempt, dead-lettered");
            } else {
                job.state = JobState::Queued;
                self.ready.push_back(job_id.clone());
                info!(job_id = %job_id, attempts = job.attempts, "Reclaimed expired lease");
            }
        }

        expired.len()
    }

    fn purge_retained(&mut self, now: DateTime<Utc>, retention: Option<Duration>) {
        let Some(retention) = retention.and_then(|r| chrono::Duration::from_std(r).ok()) else {
            return;
        };
        self.jobs
            .retain(|_, job| !(job.state.is_terminal() && job.updated_at + retention <= now));
    }
}

/// Job queue held in process memory.
pub struct MemoryJobQueue {
    config: QueueConfig,
    state: Mutex<State>,
}

impl MemoryJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, payload: SynthesisPayload) -> QueueResult<JobId> {
        let job = Job::new(payload, self.config.max_attempts);
        let job_id = job.id.clone();

        let mut state = self.state.lock().await;
        state.jobs.insert(job_id.clone(), job);
        state.ready.push_back(job_id.clone());

        debug!(job_id = %job_id, "Enqueued job");
        Ok(job_id)
    }

    async fn claim(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> QueueResult<Option<ClaimedJob>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.reclaim_expired(now);

        while let Some(job_id) = state.ready.pop_front() {
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            if !job.state.is_claimable() {
                continue;
            }

            job.attempts += 1;
            job.state = JobState::Processing;
            job.lease_deadline = Some(lease_deadline(now, lease_duration));
            job.worker_id = Some(worker_id.to_string());
            job.updated_at = now;

            return ClaimedJob::from_job(job.clone()).map(Some);
        }

        Ok(None)
    }

    async fn ack(&self, lease: &Lease, result_blob_id: &BlobId) -> QueueResult<()> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let job = state.leased_job(lease)?;

        job.state = JobState::Completed;
        job.result_blob_id = Some(result_blob_id.clone());
        job.lease_deadline = None;
        job.worker_id = None;
        job.updated_at = now;

        state.purge_retained(now, self.config.job_retention);
        Ok(())
    }

    async fn fail(&self, lease: &Lease, error: JobError) -> QueueResult<FailOutcome> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let job = state.leased_job(lease)?;

        job.last_error = Some(error);
        job.lease_deadline = None;
        job.worker_id = None;
        job.updated_at = now;

        let outcome = if job.attempts < job.max_attempts {
            job.state = JobState::Failed;
            let attempts = job.attempts;
            state.ready.push_back(lease.job_id.clone());
            FailOutcome::Retrying { attempts }
        } else {
            job.state = JobState::DeadLettered;
            FailOutcome::DeadLettered
        };

        state.purge_retained(now, self.config.job_retention);
        Ok(outcome)
    }

    async fn get(&self, job_id: &JobId) -> QueueResult<Option<Job>> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(job_id).cloned())
    }

    async fn reclaim_expired(&self) -> QueueResult<usize> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let reclaimed = state.reclaim_expired(now);
        state.purge_retained(now, self.config.job_retention);
        Ok(reclaimed)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut state = self.state.lock().await;
        state.purge_retained(Utc::now(), self.config.job_retention);
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.state {
                JobState::Queued | JobState::Failed => stats.queued += 1,
                JobState::Processing => stats.processing += 1,
                JobState::DeadLettered => stats.dead_lettered += 1,
                JobState::Completed => {}
            }
        }
        Ok(stats)
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echo_models::ErrorKind;
    use std::collections::HashSet;
    use std::sync::Arc;

    const LEASE: Duration = Duration::from_secs(60);

    fn payload(text: &str) -> SynthesisPayload {
        SynthesisPayload::new("u1", text, "a1", "v1")
    }

    fn queue(max_attempts: u32) -> MemoryJobQueue {
        MemoryJobQueue::new(QueueConfig::default().with_max_attempts(max_attempts))
    }

    fn timeout_error() -> JobError {
        JobError::new(ErrorKind::SynthesisTimeout, "exceeded timeout")
    }

    #[tokio::test]
    async fn claim_on_empty_queue_returns_none() {
        let queue = queue(3);
        assert!(queue.claim("w1", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claims_in_fifo_order() {
        let queue = queue(3);
        let first = queue.enqueue(payload("one")).await.unwrap();
        let second = queue.enqueue(payload("two")).await.unwrap();

        let a = queue.claim("w1", LEASE).await.unwrap().unwrap();
        let b = queue.claim("w2", LEASE).await.unwrap().unwrap();
        assert_eq!(a.job.id, first);
        assert_eq!(b.job.id, second);
        assert_eq!(a.lease.attempt, 1);
        assert_eq!(a.job.state, JobState::Processing);
        assert!(queue.claim("w3", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_completes_job_once() {
        let queue = queue(3);
        let job_id = queue.enqueue(payload("hello")).await.unwrap();
        let claimed = queue.claim("w1", LEASE).await.unwrap().unwrap();
        let blob_id = BlobId::for_job(&job_id);

        queue.ack(&claimed.lease, &blob_id).await.unwrap();

        let job = queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.result_blob_id, Some(blob_id.clone()));
        assert!(job.lease_deadline.is_none());

        let err = queue.ack(&claimed.lease, &blob_id).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownJob(_)));
    }

    #[tokio::test]
    async fn ack_unknown_job_is_reported() {
        let queue = queue(3);
        let lease = Lease {
            job_id: JobId::from("missing"),
            attempt: 1,
            worker_id: "w1".to_string(),
            deadline: Utc::now(),
        };
        let err = queue.ack(&lease, &BlobId::from("b")).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownJob(_)));
    }

    #[tokio::test]
    async fn fail_retries_at_tail_then_dead_letters() {
        let queue = queue(2);
        let job_id = queue.enqueue(payload("flaky")).await.unwrap();
        let other = queue.enqueue(payload("other")).await.unwrap();

        let claimed = queue.claim("w1", LEASE).await.unwrap().unwrap();
        let outcome = queue.fail(&claimed.lease, timeout_error()).await.unwrap();
        assert_eq!(outcome, FailOutcome::Retrying { attempts: 1 });
        assert_eq!(
            queue.get(&job_id).await.unwrap().unwrap().state,
            JobState::Failed
        );

        // The retried job went behind the one enqueued after it.
        let next = queue.claim("w1", LEASE).await.unwrap().unwrap();
        assert_eq!(next.job.id, other);

        let retry = queue.claim("w1", LEASE).await.unwrap().unwrap();
        assert_eq!(retry.job.id, job_id);
        assert_eq!(retry.lease.attempt, 2);

        let outcome = queue.fail(&retry.lease, timeout_error()).await.unwrap();
        assert_eq!(outcome, FailOutcome::DeadLettered);

        let job = queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::DeadLettered);
        assert_eq!(job.last_error.unwrap().kind, ErrorKind::SynthesisTimeout);
        assert_eq!(queue.stats().await.unwrap().dead_lettered, 1);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_by_next_claim() {
        let queue = queue(3);
        let job_id = queue.enqueue(payload("slow")).await.unwrap();

        let first = queue
            .claim("w1", Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let second = queue.claim("w2", LEASE).await.unwrap().unwrap();
        assert_eq!(second.job.id, job_id);
        assert_eq!(second.lease.attempt, 2);
        assert_eq!(
            second.job.last_error.as_ref().map(|e| e.kind),
            Some(ErrorKind::LeaseExpired)
        );

        // The stale worker can no longer report.
        let err = queue
            .ack(&first.lease, &BlobId::for_job(&job_id))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn late_ack_is_accepted_before_reclaim() {
        let queue = queue(3);
        let job_id = queue.enqueue(payload("late")).await.unwrap();
        let claimed = queue
            .claim("w1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        queue
            .ack(&claimed.lease, &BlobId::for_job(&job_id))
            .await
            .unwrap();
        assert_eq!(
            queue.get(&job_id).await.unwrap().unwrap().state,
            JobState::Completed
        );
    }

    #[tokio::test]
    async fn lease_expiry_on_last_attempt_dead_letters() {
        let queue = queue(1);
        let job_id = queue.enqueue(payload("stuck")).await.unwrap();
        queue
            .claim("w1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(queue.reclaim_expired().await.unwrap(), 1);
        let job = queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::DeadLettered);
        assert!(queue.claim("w2", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_job() {
        let queue = Arc::new(queue(3));
        for i in 0..50 {
            queue.enqueue(payload(&format!("job {}", i))).await.unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = queue.claim(&format!("w{}", w), LEASE).await.unwrap() {
                    claimed.push(job.job.id);
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for job_id in handle.await.unwrap() {
                assert!(seen.insert(job_id), "job claimed twice");
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[tokio::test]
    async fn retention_purges_terminal_jobs() {
        let queue = MemoryJobQueue::new(QueueConfig {
            job_retention: Some(Duration::from_millis(10)),
            ..QueueConfig::default()
        });
        let job_id = queue.enqueue(payload("done")).await.unwrap();
        let claimed = queue.claim("w1", LEASE).await.unwrap().unwrap();
        queue
            .ack(&claimed.lease, &BlobId::for_job(&job_id))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.reclaim_expired().await.unwrap();
        assert!(queue.get(&job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_letter_count_drops_after_retention() {
        let queue = MemoryJobQueue::new(QueueConfig {
            max_attempts: 1,
            job_retention: Some(Duration::from_millis(20)),
            ..QueueConfig::default()
        });
        let job_id = queue.enqueue(payload("doomed")).await.unwrap();
        let claimed = queue.claim("w1", LEASE).await.unwrap().unwrap();
        assert_eq!(
            queue.fail(&claimed.lease, timeout_error()).await.unwrap(),
            FailOutcome::DeadLettered
        );
        assert_eq!(queue.stats().await.unwrap().dead_lettered, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.stats().await.unwrap().dead_lettered, 0);
        assert!(queue.get(&job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_purges_expired_terminal_jobs() {
        let queue = MemoryJobQueue::new(QueueConfig {
            max_attempts: 1,
            job_retention: Some(Duration::from_millis(20)),
            ..QueueConfig::default()
        });
        let first = queue.enqueue(payload("first")).await.unwrap();
        let claimed = queue.claim("w1", LEASE).await.unwrap().unwrap();
        queue.fail(&claimed.lease, timeout_error()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.enqueue(payload("second")).await.unwrap();
        let claimed = queue.claim("w1", LEASE).await.unwrap().unwrap();
        queue.fail(&claimed.lease, timeout_error()).await.unwrap();

        let state = queue.state.lock().await;
        assert!(!state.jobs.contains_key(&first));
        assert_eq!(state.jobs.len(), 1);
    }
}
