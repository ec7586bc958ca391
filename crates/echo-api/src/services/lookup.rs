//! Result lookup: job status and result streaming.

use std::sync::Arc;

use echo_models::{Job, JobId, JobState};
use echo_queue::JobQueue;
use echo_storage::{BlobReader, BlobStore, StorageError};

use crate::error::{ApiError, ApiResult};

/// Read-only view over jobs and their result blobs.
#[derive(Clone)]
pub struct ResultLookup {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn BlobStore>,
}

impl ResultLookup {
    pub fn new(queue: Arc<dyn JobQueue>, store: Arc<dyn BlobStore>) -> Self {
        Self { queue, store }
    }

    /// Current job record. Never mutates the job.
    pub async fn status(&self, job_id: &JobId) -> ApiResult<Job> {
        self.queue
            .get(job_id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("job {}", job_id)))
    }

    /// Open a streaming reader on a completed job's video.
    pub async fn open_result(&self, job_id: &JobId) -> ApiResult<(Job, BlobReader)> {
        let job = self.status(job_id).await?;

        match job.state {
            JobState::Completed => {}
            JobState::DeadLettered => {
                let reason = job
                    .last_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "attempts exhausted".to_string());
                return Err(ApiError::gone(format!("job {} failed: {}", job_id, reason)));
            }
            state => {
                return Err(ApiError::not_ready(format!("job {} is {}", job_id, state)));
            }
        }

        let blob_id = job.result_blob_id.clone().ok_or_else(|| {
            ApiError::internal(format!("completed job {} has no result blob", job_id))
        })?;

        match self.store.open_reader(&blob_id).await {
            Ok(reader) => Ok((job, reader)),
            Err(StorageError::NotFound(_)) => Err(ApiError::gone(format!(
                "result of job {} is no longer available",
                job_id
            ))),
            Err(e) => Err(e.into()),
        }
    }
}
