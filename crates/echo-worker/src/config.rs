//! Worker configuration.

use std::time::Duration;

use echo_models::PipelineConfig;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Shared pipeline options (lease, timeout, pool size, backends)
    pub pipeline: PipelineConfig,
    /// Size of chunks streamed into the blob store
    pub blob_chunk_size: usize,
    /// How long one claim poll waits before checking for shutdown again
    pub claim_wait: Duration,
    /// How often expired leases are swept back into the queue
    pub reclaim_interval: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Delay after a failed claim before trying again
    pub claim_error_backoff: Duration,
    /// Cap on overlapping synthesis calls (`None` allows one per worker)
    pub synthesis_concurrency: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            blob_chunk_size: 256 * 1024,
            claim_wait: Duration::from_secs(5),
            reclaim_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
            claim_error_backoff: Duration::from_secs(2),
            synthesis_concurrency: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_pipeline(PipelineConfig::from_env())
    }

    /// Build around an explicit pipeline config, reading worker-only keys
    /// from the environment.
    pub fn from_pipeline(pipeline: PipelineConfig) -> Self {
        let defaults = Self::default();
        Self {
            pipeline,
            blob_chunk_size: std::env::var("BLOB_CHUNK_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|size: &usize| *size > 0)
                .unwrap_or(defaults.blob_chunk_size),
            claim_wait: std::env::var("WORKER_CLAIM_WAIT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_wait),
            reclaim_interval: std::env::var("WORKER_RECLAIM_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.reclaim_interval),
            shutdown_timeout: std::env::var("WORKER_SHUTDOWN_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            claim_error_backoff: defaults.claim_error_backoff,
            synthesis_concurrency: std::env::var("SYNTHESIS_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0),
        }
    }

    pub fn lease_duration(&self) -> Duration {
        self.pipeline.lease_duration
    }

    pub fn synthesis_timeout(&self) -> Duration {
        self.pipeline.synthesis_timeout
    }

    pub fn pool_size(&self) -> usize {
        self.pipeline.worker_pool_size
    }

    /// Synthesis calls allowed in flight at once, never more than the pool
    /// can issue and never zero.
    pub fn synthesis_concurrency(&self) -> usize {
        let pool = self.pool_size().max(1);
        self.synthesis_concurrency
            .map_or(pool, |limit| limit.min(pool))
            .max(1)
    }
}
