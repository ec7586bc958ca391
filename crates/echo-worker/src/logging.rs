//! Structured job logging.

use tracing::{error, info, warn, Span};

use echo_queue::Lease;

/// Stamps every lifecycle line of one job attempt with the same fields.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    worker_id: String,
    attempt: u32,
}

impl JobLogger {
    pub fn new(lease: &Lease) -> Self {
        Self {
            job_id: lease.job_id.to_string(),
            worker_id: lease.worker_id.clone(),
            attempt: lease.attempt,
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            "Job started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            attempt = self.attempt,
            "Job progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            attempt = self.attempt,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Span covering the whole attempt.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            attempt = self.attempt
        )
    }
}
