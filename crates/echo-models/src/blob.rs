//! Blob identifiers.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::job::JobId;

/// Media type of rendered videos.
pub const VIDEO_CONTENT_TYPE: &str = "video/mp4";

/// Maximum length of a blob identifier.
const MAX_BLOB_ID_LEN: usize = 200;

/// Identifier of a stored binary object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct BlobId(pub String);

impl BlobId {
    /// Blob holding the rendered video of a job.
    ///
    /// Derived only from the job ID so a retried job overwrites the same object.
    pub fn for_job(job_id: &JobId) -> Self {
        Self(format!("video-{}", job_id))
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is safe to use as a file name or object key.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_BLOB_ID_LEN
            && !self.0.starts_with('.')
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for BlobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for BlobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
