//! Worker error types.

use thiserror::Error;

use echo_models::{ErrorKind, JobError};

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Synthesis failed: {0}")]
    Synthesis(#[from] echo_synthesis::SynthesisError),

    #[error("Blob write failed: {0}")]
    Storage(#[from] echo_storage::StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] echo_queue::QueueError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkerError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Failure reason recorded on the job when this error ends an attempt.
    pub fn to_job_error(&self) -> JobError {
        match self {
            WorkerError::Synthesis(e) => e.to_job_error(),
            WorkerError::Storage(e) => JobError::new(ErrorKind::BlobWriteFailed, e.to_string()),
            other => JobError::new(ErrorKind::Internal, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echo_storage::StorageError;
    use echo_synthesis::SynthesisError;
    use std::time::Duration;

    #[test]
    fn errors_map_to_job_error_kinds() {
        let err = WorkerError::from(SynthesisError::Timeout(Duration::from_secs(3)));
        assert_eq!(err.to_job_error().kind, ErrorKind::SynthesisTimeout);

        let err = WorkerError::from(StorageError::upload_failed("disk full"));
        assert_eq!(err.to_job_error().kind, ErrorKind::BlobWriteFailed);

        let err = WorkerError::internal("bug");
        assert_eq!(err.to_job_error().kind, ErrorKind::Internal);
    }
}
