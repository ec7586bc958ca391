//! Prometheus metrics for the worker.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_CLAIMED_TOTAL: &str = "echo_worker_jobs_claimed_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "echo_worker_jobs_completed_total";
    pub const JOBS_RETRIED_TOTAL: &str = "echo_worker_jobs_retried_total";
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "echo_worker_jobs_dead_lettered_total";
    pub const LEASES_LOST_TOTAL: &str = "echo_worker_leases_lost_total";
    pub const LEASES_RECLAIMED_TOTAL: &str = "echo_worker_leases_reclaimed_total";
    pub const SYNTHESIS_DURATION_SECONDS: &str = "echo_worker_synthesis_duration_seconds";
    pub const BLOB_BYTES_WRITTEN_TOTAL: &str = "echo_worker_blob_bytes_written_total";
}

/// Install the Prometheus recorder with a scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
}

pub fn record_job_claimed() {
    counter!(names::JOBS_CLAIMED_TOTAL).increment(1);
}

pub fn record_job_completed() {
    counter!(names::JOBS_COMPLETED_TOTAL).increment(1);
}

/// Record a failed attempt by its error kind.
pub fn record_job_retried(kind: &str) {
    let labels = [("kind", kind.to_string())];
    counter!(names::JOBS_RETRIED_TOTAL, &labels).increment(1);
}

pub fn record_job_dead_lettered(kind: &str) {
    let labels = [("kind", kind.to_string())];
    counter!(names::JOBS_DEAD_LETTERED_TOTAL, &labels).increment(1);
}

pub fn record_lease_lost() {
    counter!(names::LEASES_LOST_TOTAL).increment(1);
}

pub fn record_leases_reclaimed(count: usize) {
    counter!(names::LEASES_RECLAIMED_TOTAL).increment(count as u64);
}

pub fn record_synthesis_duration(outcome: &str, duration_secs: f64) {
    let labels = [("outcome", outcome.to_string())];
    histogram!(names::SYNTHESIS_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_blob_bytes_written(bytes: u64) {
    counter!(names::BLOB_BYTES_WRITTEN_TOTAL).increment(bytes);
}
