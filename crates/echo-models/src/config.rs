//! Pipeline configuration shared by the API and the worker.

use std::time::Duration;

use thiserror::Error;

/// Errors from invalid pipeline configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_attempts must be at least 1")]
    ZeroMaxAttempts,

    #[error("worker_pool_size must be at least 1")]
    ZeroWorkerPool,

    #[error("synthesis_timeout ({timeout:?}) must be shorter than lease_duration ({lease:?})")]
    TimeoutExceedsLease { timeout: Duration, lease: Duration },
}

/// Options recognized by every pipeline component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Job queue backend (`redis://...`, `rediss://...`, `memory://`)
    pub queue_backend_address: String,
    /// Blob store backend (`file:///dir`, `s3://bucket`)
    pub blob_store_backend_address: String,
    /// Claims allowed per job before dead-lettering
    pub max_attempts: u32,
    /// How long a claim stays exclusive
    pub lease_duration: Duration,
    /// Hard limit on one synthesis call
    pub synthesis_timeout: Duration,
    /// Claim loops per worker process
    pub worker_pool_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_backend_address: "redis://localhost:6379".to_string(),
            blob_store_backend_address: "file:///tmp/echo/blobs".to_string(),
            max_attempts: 3,
            lease_duration: Duration::from_secs(2400), // 40 minutes
            synthesis_timeout: Duration::from_secs(1800), // 30 minutes
            worker_pool_size: 2,
        }
    }
}

impl PipelineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_backend_address: std::env::var("QUEUE_BACKEND_ADDRESS")
                .unwrap_or(defaults.queue_backend_address),
            blob_store_backend_address: std::env::var("BLOB_STORE_BACKEND_ADDRESS")
                .unwrap_or(defaults.blob_store_backend_address),
            max_attempts: std::env::var("MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_attempts),
            lease_duration: std::env::var("LEASE_DURATION_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_duration),
            synthesis_timeout: std::env::var("SYNTHESIS_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.synthesis_timeout),
            worker_pool_size: std::env::var("WORKER_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.worker_pool_size),
        }
    }

    /// Check invariants between options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        if self.worker_pool_size == 0 {
            return Err(ConfigError::ZeroWorkerPool);
        }
        if self.synthesis_timeout >= self.lease_duration {
            return Err(ConfigError::TimeoutExceedsLease {
                timeout: self.synthesis_timeout,
                lease: self.lease_duration,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn timeout_must_be_shorter_than_lease() {
        let config = PipelineConfig {
            lease_duration: Duration::from_secs(60),
            synthesis_timeout: Duration::from_secs(60),
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TimeoutExceedsLease { .. })
        ));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let config = PipelineConfig {
            max_attempts: 0,
            ..PipelineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroMaxAttempts));

        let config = PipelineConfig {
            worker_pool_size: 0,
            ..PipelineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroWorkerPool));
    }
}
