//! Job definitions for the synthesis queue.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::blob::BlobId;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job state in the queue.
///
/// `Failed` is not terminal: the job failed its last attempt and sits at the
/// tail of the ready list waiting for another claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Job is waiting in queue
    #[default]
    Queued,
    /// Job is leased by a worker
    Processing,
    /// Result blob is durably written
    Completed,
    /// Last attempt failed, retry pending
    Failed,
    /// Attempts exhausted
    DeadLettered,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::DeadLettered)
    }

    /// Whether a worker may claim a job in this state.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead_lettered" => Ok(JobState::DeadLettered),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

/// What the synthesis service is asked to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SynthesisPayload {
    /// Already-authenticated identity of the user the video is for
    pub recipient_identity: String,
    /// Script the avatar speaks
    pub text: String,
    /// Voice sample in the avatar catalog
    pub audio_reference_id: String,
    /// Avatar video in the avatar catalog
    pub video_avatar_reference_id: String,
    /// Normalized transcript hint for the speech model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_text: Option<String>,
}

impl SynthesisPayload {
    pub fn new(
        recipient_identity: impl Into<String>,
        text: impl Into<String>,
        audio_reference_id: impl Into<String>,
        video_avatar_reference_id: impl Into<String>,
    ) -> Self {
        Self {
            recipient_identity: recipient_identity.into(),
            text: text.into(),
            audio_reference_id: audio_reference_id.into(),
            video_avatar_reference_id: video_avatar_reference_id.into(),
            audio_text: None,
        }
    }

    /// Set the optional transcript hint.
    pub fn with_audio_text(mut self, audio_text: impl Into<String>) -> Self {
        self.audio_text = Some(audio_text.into());
        self
    }

    /// Names of required fields that are blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.recipient_identity.trim().is_empty() {
            missing.push("recipientIdentity");
        }
        if self.text.trim().is_empty() {
            missing.push("text");
        }
        if self.audio_reference_id.trim().is_empty() {
            missing.push("audioReferenceID");
        }
        if self.video_avatar_reference_id.trim().is_empty() {
            missing.push("videoAvatarReferenceID");
        }
        missing
    }
}

/// Failure category recorded on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ErrorKind {
    SynthesisTimeout,
    SynthesisRejected,
    SynthesisUnavailable,
    InvalidSynthesisResponse,
    BlobWriteFailed,
    LeaseExpired,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SynthesisTimeout => "SynthesisTimeout",
            ErrorKind::SynthesisRejected => "SynthesisRejected",
            ErrorKind::SynthesisUnavailable => "SynthesisUnavailable",
            ErrorKind::InvalidSynthesisResponse => "InvalidSynthesisResponse",
            ErrorKind::BlobWriteFailed => "BlobWriteFailed",
            ErrorKind::LeaseExpired => "LeaseExpired",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last failure reason of a job. Kept after a successful retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn lease_expired() -> Self {
        Self::new(ErrorKind::LeaseExpired, "lease expired before the job was reported")
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A unit of synthesis work tracked through the queue state machine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job ID, assigned at enqueue
    pub id: JobId,

    /// Synthesis request
    pub payload: SynthesisPayload,

    /// Current state
    #[serde(default)]
    pub state: JobState,

    /// Number of times a worker claimed this job
    #[serde(default)]
    pub attempts: u32,

    /// Claims allowed before dead-lettering
    pub max_attempts: u32,

    /// Deadline of the current lease (only while processing)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_deadline: Option<DateTime<Utc>>,

    /// Worker holding the current lease
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    /// Finished video (only when completed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_blob_id: Option<BlobId>,

    /// Last failure reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobError>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a freshly queued job.
    pub fn new(payload: SynthesisPayload, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            payload,
            state: JobState::Queued,
            attempts: 0,
            max_attempts,
            lease_deadline: None,
            worker_id: None,
            result_blob_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the lease (if any) has passed its deadline.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Processing
            && self.lease_deadline.map(|d| d <= now).unwrap_or(true)
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_parses_its_own_names() {
        for state in [
            JobState::Queued,
            JobState::Processing,
            JobState::Completed,
            JobState::Failed,
            JobState::DeadLettered,
        ] {
            assert_eq!(state.as_str().parse::<JobState>(), Ok(state));
        }
        assert!("running".parse::<JobState>().is_err());
    }

    #[test]
    fn job_state_serializes_snake_case() {
        let json = serde_json::to_string(&JobState::DeadLettered).unwrap();
        assert_eq!(json, "\"dead_lettered\"");
    }

    #[test]
    fn failed_is_claimable_but_not_terminal() {
        assert!(JobState::Failed.is_claimable());
        assert!(!JobState::Failed.is_terminal());
        assert!(JobState::DeadLettered.is_terminal());
        assert!(!JobState::Processing.is_claimable());
    }

    #[test]
    fn missing_fields_reports_blank_required_fields() {
        let payload = SynthesisPayload::new("u1", "  ", "a1", "");
        assert_eq!(payload.missing_fields(), vec!["text", "videoAvatarReferenceID"]);

        let payload = SynthesisPayload::new("u1", "hello", "a1", "v1");
        assert!(payload.missing_fields().is_empty());
    }

    #[test]
    fn job_error_display_leads_with_kind() {
        let err = JobError::new(ErrorKind::SynthesisTimeout, "exceeded 30s");
        assert_eq!(err.to_string(), "SynthesisTimeout: exceeded 30s");
    }

    #[test]
    fn new_job_is_queued_without_lease() {
        let job = Job::new(SynthesisPayload::new("u1", "hello", "a1", "v1"), 3);
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.attempts_remaining(), 3);
        assert!(!job.lease_expired(Utc::now()));
    }
}
