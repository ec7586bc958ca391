//! Retry with exponential backoff for queue bookkeeping calls.
//!
//! Only the worker's own calls to the queue backend (`ack`, `fail`) are
//! retried here. Synthesis is never retried in-process; a failed render goes
//! back through the queue's retry policy instead.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles after each.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Operation name for logging.
    pub operation_name: &'static str,
}

impl RetryConfig {
    pub fn new(operation_name: &'static str) -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            operation_name,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay before retry number `retry` (1-based).
    fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `operation`, retrying errors for which `is_retryable` holds.
///
/// Non-retryable errors are returned immediately; the last retryable error
/// is returned once retries run out.
pub async fn retry_async<F, Fut, T, E, P>(
    config: &RetryConfig,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut retry = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if retry > 0 {
                    debug!("{} succeeded after {} retries", config.operation_name, retry);
                }
                return Ok(value);
            }
            Err(e) if retry < config.max_retries && is_retryable(&e) => {
                retry += 1;
                let delay = config.delay_for_retry(retry);
                warn!(
                    "{} failed (retry {}/{}), retrying in {:?}: {}",
                    config.operation_name, retry, config.max_retries, delay, e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Tracks consecutive failures of a repeating background operation and
/// suppresses log spam once a threshold is crossed.
#[derive(Debug, Default)]
pub struct FailureTracker {
    consecutive_failures: u32,
    max_logged_failures: u32,
}

impl FailureTracker {
    pub fn new(max_logged_failures: u32) -> Self {
        Self {
            consecutive_failures: 0,
            max_logged_failures,
        }
    }

    /// Reset after a success.
    pub fn record_success(&mut self) {
        if self.consecutive_failures > self.max_logged_failures {
            warn!(
                "Recovered after {} consecutive failures",
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
    }

    /// Record a failure. Returns `true` if it should be logged.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;

        if self.consecutive_failures == self.max_logged_failures + 1 {
            warn!(
                "Suppressing further failure logs after {} consecutive failures",
                self.max_logged_failures
            );
        }
        self.consecutive_failures <= self.max_logged_failures
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}
