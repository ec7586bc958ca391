//! Queue error types.

use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue backend unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Lease lost for job {job_id} (attempt {attempt})")]
    LeaseLost { job_id: String, attempt: u32 },

    #[error("Invalid job record: {0}")]
    InvalidRecord(String),

    #[error("Invalid queue configuration: {0}")]
    Config(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::QueueUnavailable(msg.into())
    }

    pub fn unknown_job(job_id: impl Into<String>) -> Self {
        Self::UnknownJob(job_id.into())
    }

    pub fn lease_lost(job_id: impl Into<String>, attempt: u32) -> Self {
        Self::LeaseLost {
            job_id: job_id.into(),
            attempt,
        }
    }

    pub fn invalid_record(msg: impl Into<String>) -> Self {
        Self::InvalidRecord(msg.into())
    }

    /// Whether the backing store could not be reached.
    ///
    /// Callers surface these as `QueueUnavailable` and may retry the whole
    /// operation.
    pub fn is_unavailable(&self) -> bool {
        match self {
            QueueError::QueueUnavailable(_) => true,
            QueueError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_refusal()
                    || e.is_connection_dropped()
                    || e.is_timeout()
            }
            _ => false,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        self.is_unavailable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_errors_are_not_transient() {
        assert!(!QueueError::lease_lost("j1", 2).is_transient());
        assert!(!QueueError::unknown_job("j1").is_transient());
        assert!(QueueError::unavailable("down").is_unavailable());
    }

    #[test]
    fn redis_io_errors_count_as_unavailable() {
        let err = QueueError::from(redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        assert!(err.is_unavailable());
    }
}
