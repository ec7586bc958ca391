//! Worker pool: independent claim loops plus a lease sweeper.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use echo_queue::JobQueue;
use echo_storage::BlobStore;
use echo_synthesis::Synthesizer;

use crate::config::WorkerConfig;
use crate::error::WorkerResult;
use crate::metrics;
use crate::processor::{JobOutcome, JobProcessor};
use crate::retry::FailureTracker;

/// Consecutive claim failures logged before going quiet.
const MAX_LOGGED_CLAIM_FAILURES: u32 = 5;

/// Pause after an empty claim when `claim_wait` itself does not wait.
const IDLE_DELAY: Duration = Duration::from_millis(50);

/// Shortest sweep period accepted.
const MIN_RECLAIM_INTERVAL: Duration = Duration::from_millis(100);

/// Runs `worker_pool_size` claim-execute-report loops against one queue.
pub struct WorkerPool {
    config: WorkerConfig,
    processor: Arc<JobProcessor>,
    shutdown: watch::Sender<bool>,
    pool_id: String,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn BlobStore>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        let processor = Arc::new(JobProcessor::new(config.clone(), queue, store, synthesizer));
        let (shutdown, _) = watch::channel(false);
        let pool_id = format!("worker-{}", Uuid::new_v4());

        Self {
            config,
            processor,
            shutdown,
            pool_id,
        }
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// Stop claiming new jobs. In-flight jobs are allowed to finish.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run one claim-execute-report cycle. `None` when no job was claimable
    /// within `claim_wait`.
    pub async fn process_next(&self, worker_id: &str) -> WorkerResult<Option<JobOutcome>> {
        match self.processor.claim(worker_id).await? {
            Some(claimed) => Ok(Some(self.processor.process(claimed).await?)),
            None => Ok(None),
        }
    }

    /// Run until [`WorkerPool::shutdown`] is called, then drain.
    pub async fn run(&self) -> WorkerResult<()> {
        let size = self.config.pool_size();
        info!(
            "Starting worker pool '{}' with {} workers on {} queue",
            self.pool_id,
            size,
            self.processor.queue().backend_name()
        );

        let mut workers = JoinSet::new();
        for n in 0..size {
            let worker_id = format!("{}-{}", self.pool_id, n);
            workers.spawn(worker_loop(
                worker_id,
                Arc::clone(&self.processor),
                self.shutdown.subscribe(),
            ));
        }

        let sweeper = tokio::spawn(sweep_loop(
            Arc::clone(self.processor.queue()),
            self.config.reclaim_interval.max(MIN_RECLAIM_INTERVAL),
            self.shutdown.subscribe(),
        ));

        let mut shutdown_rx = self.shutdown.subscribe();
        // The sender lives in `self`, so this only returns once shutdown is set.
        let _ = shutdown_rx.wait_for(|stop| *stop).await;
        info!("Shutdown signal received, waiting for in-flight jobs...");

        sweeper.abort();

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Worker task panicked: {}", e);
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "In-flight jobs did not finish within {:?}; abandoning them to lease expiry",
                self.config.shutdown_timeout
            );
            workers.abort_all();
        }

        info!("Worker pool '{}' stopped", self.pool_id);
        Ok(())
    }
}

async fn worker_loop(
    worker_id: String,
    processor: Arc<JobProcessor>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let backoff = processor.config().claim_error_backoff;
    let idle = if processor.config().claim_wait.is_zero() {
        Some(IDLE_DELAY)
    } else {
        None
    };
    let mut failures = FailureTracker::new(MAX_LOGGED_CLAIM_FAILURES);
    debug!(worker_id = %worker_id, "Worker loop started");

    // Each claim waits at most `claim_wait`, which bounds shutdown latency.
    while !*shutdown_rx.borrow() {
        match processor.claim(&worker_id).await {
            Ok(Some(claimed)) => {
                failures.record_success();
                match processor.process(claimed).await {
                    Ok(outcome) => {
                        debug!(worker_id = %worker_id, job_id = %outcome.job_id(), "Job finished: {:?}", outcome);
                    }
                    Err(e) => {
                        error!(worker_id = %worker_id, "Failed to record job outcome: {}", e);
                    }
                }
            }
            Ok(None) => {
                failures.record_success();
                if let Some(delay) = idle {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }
            Err(e) => {
                if failures.record_failure() {
                    warn!(worker_id = %worker_id, "Failed to claim job: {}", e);
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }
    }

    debug!(worker_id = %worker_id, "Worker loop stopped");
}

async fn sweep_loop(
    queue: Arc<dyn JobQueue>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut failures = FailureTracker::new(MAX_LOGGED_CLAIM_FAILURES);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = interval.tick() => {
                match queue.reclaim_expired().await {
                    Ok(0) => failures.record_success(),
                    Ok(count) => {
                        failures.record_success();
                        metrics::record_leases_reclaimed(count);
                        info!("Reclaimed {} expired leases", count);
                    }
                    Err(e) => {
                        if failures.record_failure() {
                            warn!("Failed to reclaim expired leases: {}", e);
                        }
                    }
                }
            }
        }
    }
}
