//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use echo_queue::QueueError;
use echo_storage::StorageError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The job exists but has no result yet.
    #[error("Result not ready: {0}")]
    NotReady(String),

    #[error("Gone: {0}")]
    Gone(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(QueueError),
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        if err.is_unavailable() {
            return Self::QueueUnavailable(err.to_string());
        }
        match err {
            QueueError::UnknownJob(job_id) => Self::NotFound(format!("job {}", job_id)),
            other => Self::Queue(other),
        }
    }
}

impl ApiError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    pub fn gone(msg: impl Into<String>) -> Self {
        Self::Gone(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NotReady(_) => StatusCode::CONFLICT,
            ApiError::Gone(_) => StatusCode::GONE,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) | ApiError::Storage(_) | ApiError::Queue(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "InvalidRequest",
            ApiError::Unauthorized(_) => "Unauthorized",
            ApiError::NotFound(_) => "UnknownJob",
            ApiError::NotReady(_) => "NotReady",
            ApiError::Gone(_) => "Gone",
            ApiError::PayloadTooLarge(_) => "PayloadTooLarge",
            ApiError::QueueUnavailable(_) => "QueueUnavailable",
            ApiError::Internal(_) | ApiError::Storage(_) | ApiError::Queue(_) => "Internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Don't expose internal error details in production
        let detail = match &self {
            ApiError::Internal(_) | ApiError::Storage(_) | ApiError::Queue(_) => {
                tracing::error!("Request failed: {}", self);
                if std::env::var("ENVIRONMENT").unwrap_or_default() == "production" {
                    "An internal error occurred".to_string()
                } else {
                    self.to_string()
                }
            }
            _ => self.to_string(),
        };

        let body = ErrorResponse {
            detail,
            code: self.code(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_errors_map_to_statuses() {
        let err = ApiError::from(QueueError::unavailable("connection refused"));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err = ApiError::from(QueueError::unknown_job("j1"));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = ApiError::from(QueueError::lease_lost("j1", 1));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn client_errors_carry_codes() {
        assert_eq!(
            ApiError::invalid_request("text").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::not_ready("queued").code(), "NotReady");
        assert_eq!(ApiError::gone("dead").status_code(), StatusCode::GONE);
    }
}
