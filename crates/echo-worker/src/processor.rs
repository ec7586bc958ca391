//! One claim-execute-report cycle for a synthesis job.

use std::sync::Arc;
use std::time::Instant;

use futures::stream;
use tokio::sync::Semaphore;
use tracing::{debug, Instrument};

use echo_models::{BlobId, Job, JobError, JobId};
use echo_queue::{poll_claim, ClaimedJob, FailOutcome, JobQueue, Lease, QueueError};
use echo_storage::{split_chunks, write_stream, BlobMetadata, BlobStore, StorageError};
use echo_synthesis::{SynthesisRequest, Synthesizer};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::retry::{retry_async, RetryConfig};

/// How a processed job left the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Blob written and job acked.
    Completed {
        job_id: JobId,
        blob_id: BlobId,
        bytes: u64,
    },
    /// Attempt failed; the queue re-queued the job.
    Retrying {
        job_id: JobId,
        attempts: u32,
        error: JobError,
    },
    /// Attempt failed and no attempts remain.
    DeadLettered { job_id: JobId, error: JobError },
    /// Someone else owns the job now; our result was discarded.
    LeaseLost { job_id: JobId },
}

impl JobOutcome {
    pub fn job_id(&self) -> &JobId {
        match self {
            JobOutcome::Completed { job_id, .. }
            | JobOutcome::Retrying { job_id, .. }
            | JobOutcome::DeadLettered { job_id, .. }
            | JobOutcome::LeaseLost { job_id } => job_id,
        }
    }
}

/// Runs claimed jobs against the synthesizer and blob store.
pub struct JobProcessor {
    config: WorkerConfig,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn BlobStore>,
    synthesizer: Arc<dyn Synthesizer>,
    synthesis_slots: Arc<Semaphore>,
}

impl JobProcessor {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn BlobStore>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        let synthesis_slots = Arc::new(Semaphore::new(config.synthesis_concurrency()));
        Self {
            config,
            queue,
            store,
            synthesizer,
            synthesis_slots,
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Wait up to `claim_wait` for a job.
    pub async fn claim(&self, worker_id: &str) -> WorkerResult<Option<ClaimedJob>> {
        let claimed = poll_claim(
            self.queue.as_ref(),
            worker_id,
            self.config.lease_duration(),
            self.config.claim_wait,
        )
        .await?;

        if claimed.is_some() {
            metrics::record_job_claimed();
        }
        Ok(claimed)
    }

    /// Execute a claimed job and report the result to the queue.
    ///
    /// Job failures are reported through `fail` and come back as an outcome;
    /// an `Err` means the outcome could not be recorded at all and the lease
    /// will eventually expire.
    pub async fn process(&self, claimed: ClaimedJob) -> WorkerResult<JobOutcome> {
        let logger = JobLogger::new(&claimed.lease);
        let span = logger.create_span();

        async move {
            logger.log_start(&format!(
                "recipient={} attempt {}/{}",
                claimed.job.payload.recipient_identity,
                claimed.lease.attempt,
                claimed.job.max_attempts
            ));

            match self.execute(&claimed.job, &logger).await {
                Ok((blob_id, bytes)) => {
                    self.report_success(&claimed.lease, blob_id, bytes, &logger)
                        .await
                }
                Err(e) => self.report_failure(&claimed.lease, e, &logger).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, job: &Job, logger: &JobLogger) -> WorkerResult<(BlobId, u64)> {
        let request = SynthesisRequest::for_job(&job.id, &job.payload);

        let video = {
            let _permit = self
                .synthesis_slots
                .acquire()
                .await
                .map_err(|_| WorkerError::internal("synthesis semaphore closed"))?;

            let started = Instant::now();
            let result = self
                .synthesizer
                .synthesize(&request, self.config.synthesis_timeout())
                .await;
            let elapsed = started.elapsed().as_secs_f64();
            let outcome = match &result {
                Ok(_) => "success",
                Err(e) => e.kind().as_str(),
            };
            metrics::record_synthesis_duration(outcome, elapsed);
            result?
        };
        logger.log_progress(&format!("synthesized {} bytes", video.len()));

        let blob_id = BlobId::for_job(&job.id);
        let metadata = BlobMetadata::video(job.payload.recipient_identity.clone())
            .with_content_type(video.content_type.clone())
            .with_filename(format!("{}.mp4", job.id));
        let chunks = stream::iter(
            split_chunks(video.bytes, self.config.blob_chunk_size).map(Ok::<_, StorageError>),
        );

        let info = write_stream(self.store.as_ref(), &blob_id, metadata, chunks).await?;
        metrics::record_blob_bytes_written(info.size);
        debug!(blob_id = %blob_id, size = info.size, "Blob written");

        Ok((blob_id, info.size))
    }

    async fn report_success(
        &self,
        lease: &Lease,
        blob_id: BlobId,
        bytes: u64,
        logger: &JobLogger,
    ) -> WorkerResult<JobOutcome> {
        let retry = RetryConfig::new("ack");
        let acked = retry_async(&retry, QueueError::is_transient, || {
            self.queue.ack(lease, &blob_id)
        })
        .await;

        match acked {
            Ok(()) => {
                metrics::record_job_completed();
                logger.log_completion(&format!("{} bytes in {}", bytes, blob_id));
                Ok(JobOutcome::Completed {
                    job_id: lease.job_id.clone(),
                    blob_id,
                    bytes,
                })
            }
            Err(e) => self.lease_lost_or(lease, e, logger),
        }
    }

    async fn report_failure(
        &self,
        lease: &Lease,
        error: WorkerError,
        logger: &JobLogger,
    ) -> WorkerResult<JobOutcome> {
        let job_error = error.to_job_error();
        logger.log_error(&job_error.to_string());

        let retry = RetryConfig::new("fail");
        let failed = retry_async(&retry, QueueError::is_transient, || {
            self.queue.fail(lease, job_error.clone())
        })
        .await;

        match failed {
            Ok(FailOutcome::Retrying { attempts }) => {
                metrics::record_job_retried(job_error.kind.as_str());
                logger.log_warning(&format!("re-queued after {} attempts", attempts));
                Ok(JobOutcome::Retrying {
                    job_id: lease.job_id.clone(),
                    attempts,
                    error: job_error,
                })
            }
            Ok(FailOutcome::DeadLettered) => {
                metrics::record_job_dead_lettered(job_error.kind.as_str());
                logger.log_error("attempts exhausted, job dead-lettered");
                Ok(JobOutcome::DeadLettered {
                    job_id: lease.job_id.clone(),
                    error: job_error,
                })
            }
            Err(e) => self.lease_lost_or(lease, e, logger),
        }
    }

    /// A lost lease is an expected race with reclamation, not a worker error.
    fn lease_lost_or(
        &self,
        lease: &Lease,
        error: QueueError,
        logger: &JobLogger,
    ) -> WorkerResult<JobOutcome> {
        match error {
            QueueError::LeaseLost { .. } | QueueError::UnknownJob(_) => {
                metrics::record_lease_lost();
                logger.log_warning(&format!("result discarded: {}", error));
                Ok(JobOutcome::LeaseLost {
                    job_id: lease.job_id.clone(),
                })
            }
            other => Err(other.into()),
        }
    }
}
