//! Job producer: validate and enqueue.

use std::sync::Arc;

use tracing::info;

use echo_models::{JobId, SynthesisPayload};
use echo_queue::JobQueue;

use crate::error::{ApiError, ApiResult};
use crate::metrics;

/// Accepts generation requests without waiting for them to run.
#[derive(Clone)]
pub struct JobProducer {
    queue: Arc<dyn JobQueue>,
}

impl JobProducer {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    /// Enqueue a validated payload and return its job id.
    pub async fn submit(&self, payload: SynthesisPayload) -> ApiResult<JobId> {
        let missing = payload.missing_fields();
        if !missing.is_empty() {
            return Err(ApiError::invalid_request(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        let job_id = self.queue.enqueue(payload).await?;
        metrics::record_job_enqueued();
        info!(job_id = %job_id, "Job enqueued");
        Ok(job_id)
    }
}
