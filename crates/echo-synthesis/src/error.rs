//! Synthesis error types.

use std::time::Duration;

use thiserror::Error;

use echo_models::{ErrorKind, JobError};

pub type SynthesisResult<T> = Result<T, SynthesisError>;

/// Longest response body kept in a rejection error.
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("Synthesis timed out after {0:?}")]
    Timeout(Duration),

    #[error("Synthesis service rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Synthesis service unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid synthesis response: {0}")]
    InvalidResponse(String),

    #[error("Invalid synthesis configuration: {0}")]
    Config(String),
}

impl SynthesisError {
    pub fn rejected(status: u16, body: impl Into<String>) -> Self {
        let body: String = body.into();
        let body = if body.chars().count() > MAX_ERROR_BODY_CHARS {
            let truncated: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            format!("{}...", truncated)
        } else {
            body
        };
        Self::Rejected { status, body }
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Classify a transport-level failure.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_decode() || err.is_body() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }

    /// Failure category persisted on the job.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SynthesisError::Timeout(_) => ErrorKind::SynthesisTimeout,
            SynthesisError::Rejected { .. } => ErrorKind::SynthesisRejected,
            SynthesisError::Unavailable(_) => ErrorKind::SynthesisUnavailable,
            SynthesisError::InvalidResponse(_) => ErrorKind::InvalidSynthesisResponse,
            SynthesisError::Config(_) => ErrorKind::Internal,
        }
    }

    pub fn to_job_error(&self) -> JobError {
        JobError::new(self.kind(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_job_error_taxonomy() {
        assert_eq!(
            SynthesisError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::SynthesisTimeout
        );
        assert_eq!(
            SynthesisError::rejected(500, "boom").kind(),
            ErrorKind::SynthesisRejected
        );
        assert_eq!(
            SynthesisError::Unavailable("refused".into()).to_job_error().kind,
            ErrorKind::SynthesisUnavailable
        );
    }

    #[test]
    fn rejection_body_is_truncated() {
        let err = SynthesisError::rejected(502, "x".repeat(2000));
        match err {
            SynthesisError::Rejected { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body.len(), MAX_ERROR_BODY_CHARS + 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
