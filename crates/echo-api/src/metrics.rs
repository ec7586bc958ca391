//! Prometheus metrics for the API server.

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

/// Initialize the Prometheus metrics recorder.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "echo_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "echo_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "echo_http_requests_in_flight";

    // Queue metrics
    pub const QUEUE_LENGTH: &str = "echo_queue_length";
    pub const QUEUE_PROCESSING: &str = "echo_queue_processing";
    pub const QUEUE_DEAD_LETTERED: &str = "echo_queue_dead_lettered";
    pub const JOBS_ENQUEUED_TOTAL: &str = "echo_jobs_enqueued_total";

    // Delivery metrics
    pub const VIDEO_BYTES_SERVED_TOTAL: &str = "echo_video_bytes_served_total";

    // Rate limiting metrics
    pub const RATE_LIMIT_HITS_TOTAL: &str = "echo_rate_limit_hits_total";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Update queue depth gauges.
pub fn set_queue_depths(queued: u64, processing: u64, dead_lettered: u64) {
    gauge!(names::QUEUE_LENGTH).set(queued as f64);
    gauge!(names::QUEUE_PROCESSING).set(processing as f64);
    gauge!(names::QUEUE_DEAD_LETTERED).set(dead_lettered as f64);
}

pub fn record_job_enqueued() {
    counter!(names::JOBS_ENQUEUED_TOTAL).increment(1);
}

/// Record the declared size of a video response.
pub fn record_video_served(format: &str, bytes: u64) {
    let labels = [("format", format.to_string())];
    counter!(names::VIDEO_BYTES_SERVED_TOTAL, &labels).increment(bytes);
}

/// Record rate limit hit.
pub fn record_rate_limit_hit(endpoint: &str) {
    let labels = [("endpoint", sanitize_path(endpoint))];
    counter!(names::RATE_LIMIT_HITS_TOTAL, &labels).increment(1);
}

/// Collapse job ids so label cardinality stays bounded.
fn sanitize_path(path: &str) -> String {
    let mut segments: Vec<&str> = path.split('/').collect();
    for i in 1..segments.len() {
        if segments[i - 1] == "jobs" && !segments[i].is_empty() {
            segments[i] = ":job_id";
        }
    }
    segments.join("/")
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);

    let response = next.run(request).await;

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &path, status, duration);

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path() {
        assert_eq!(
            sanitize_path("/api/jobs/550e8400-e29b-41d4-a716-446655440000/video"),
            "/api/jobs/:job_id/video"
        );
        assert_eq!(sanitize_path("/api/jobs"), "/api/jobs");
        assert_eq!(sanitize_path("/api/jobs/"), "/api/jobs/");
        assert_eq!(sanitize_path("/health"), "/health");
    }
}
