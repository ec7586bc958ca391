//! Job queue contract shared by all backends.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use echo_models::{BlobId, Job, JobError, JobId, PipelineConfig, SynthesisPayload};

use crate::error::QueueResult;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Key namespace for the Redis backend
    pub namespace: String,
    /// Claims allowed per job before dead-lettering
    pub max_attempts: u32,
    /// How long terminal jobs are kept (`None` keeps them forever)
    pub job_retention: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: "echo:video-generation".to_string(),
            max_attempts: 3,
            job_retention: Some(Duration::from_secs(7 * 24 * 3600)),
        }
    }
}

impl QueueConfig {
    /// Build from the pipeline config plus queue-specific environment variables.
    pub fn from_pipeline(pipeline: &PipelineConfig) -> Self {
        let defaults = Self::default();
        Self {
            namespace: std::env::var("QUEUE_NAMESPACE").unwrap_or(defaults.namespace),
            max_attempts: pipeline.max_attempts,
            job_retention: match std::env::var("JOB_RETENTION_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
            {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.job_retention,
            },
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// A time-bounded exclusive claim on one job.
///
/// Identified by `(job_id, attempt)`: once the job is reclaimed the attempt
/// moves on and this lease can no longer report an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: JobId,
    pub attempt: u32,
    pub worker_id: String,
    pub deadline: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline <= now
    }
}

/// A job handed to a worker together with its lease.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub lease: Lease,
}

impl ClaimedJob {
    pub fn from_job(job: Job) -> QueueResult<Self> {
        let worker_id = job.worker_id.clone().unwrap_or_default();
        let deadline = job.lease_deadline.ok_or_else(|| {
            crate::error::QueueError::invalid_record(format!(
                "claimed job {} has no lease deadline",
                job.id
            ))
        })?;
        Ok(Self {
            lease: Lease {
                job_id: job.id.clone(),
                attempt: job.attempts,
                worker_id,
                deadline,
            },
            job,
        })
    }
}

/// What `fail` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-queued at the tail; `attempts` claims used so far.
    Retrying { attempts: u32 },
    /// Attempts exhausted.
    DeadLettered,
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs waiting to be claimed (queued or failed-retrying)
    pub queued: u64,
    /// Jobs currently leased
    pub processing: u64,
    /// Jobs that exhausted their attempts
    pub dead_lettered: u64,
}

/// Durable FIFO of synthesis jobs with lease-based claims.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Store a new job in `Queued` and return its id.
    async fn enqueue(&self, payload: SynthesisPayload) -> QueueResult<JobId>;

    /// Atomically claim the oldest claimable job.
    ///
    /// Expired leases are reclaimed first. Returns `None` when nothing is
    /// eligible; never blocks waiting for work.
    async fn claim(&self, worker_id: &str, lease_duration: Duration)
        -> QueueResult<Option<ClaimedJob>>;

    /// Mark the leased job `Completed` with its result blob.
    async fn ack(&self, lease: &Lease, result_blob_id: &BlobId) -> QueueResult<()>;

    /// Record a failed attempt and apply the retry policy.
    async fn fail(&self, lease: &Lease, error: JobError) -> QueueResult<FailOutcome>;

    /// Read a job without changing it.
    async fn get(&self, job_id: &JobId) -> QueueResult<Option<Job>>;

    /// Return expired leases to the queue (or dead-letter them). Returns how
    /// many jobs were reclaimed.
    async fn reclaim_expired(&self) -> QueueResult<usize>;

    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Check the backing store is reachable.
    async fn ping(&self) -> QueueResult<()>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

pub(crate) fn lease_deadline(now: DateTime<Utc>, lease_duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease_duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claimed_job_derives_lease_from_job() {
        let mut job = Job::new(SynthesisPayload::new("u1", "hello", "a1", "v1"), 3);
        job.attempts = 2;
        job.worker_id = Some("worker-1".to_string());
        job.lease_deadline = Some(Utc::now());

        let claimed = ClaimedJob::from_job(job.clone()).unwrap();
        assert_eq!(claimed.lease.job_id, job.id);
        assert_eq!(claimed.lease.attempt, 2);
        assert_eq!(claimed.lease.worker_id, "worker-1");
    }

    #[test]
    fn claimed_job_requires_deadline() {
        let job = Job::new(SynthesisPayload::new("u1", "hello", "a1", "v1"), 3);
        assert!(ClaimedJob::from_job(job).is_err());
    }

    #[test]
    fn lease_deadline_saturates() {
        let now = Utc::now();
        assert!(lease_deadline(now, Duration::from_secs(u64::MAX)) > now);
        assert_eq!(
            lease_deadline(now, Duration::from_secs(60)),
            now + chrono::Duration::seconds(60)
        );
    }
}
