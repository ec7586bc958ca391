//! Job submission, status polling and result delivery.

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use echo_models::{BlobId, Job, JobError, JobId, JobState, SynthesisPayload};
use echo_storage::{read_to_end, StorageError};
use echo_synthesis::encode_data_url;

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

// ============================================================================
// Types
// ============================================================================

/// Body of `POST /api/jobs`.
///
/// Also accepts the legacy field names used by older clients.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateJobRequest {
    #[serde(rename = "recipientIdentity", alias = "email")]
    pub recipient_identity: Option<String>,
    pub text: Option<String>,
    #[serde(rename = "audioReferenceID", alias = "audioId")]
    pub audio_reference_id: Option<String>,
    #[serde(rename = "videoAvatarReferenceID", alias = "videoId")]
    pub video_avatar_reference_id: Option<String>,
    #[serde(rename = "audioText", alias = "audio_text")]
    pub audio_text: Option<String>,
}

impl CreateJobRequest {
    /// Missing fields become blank and are reported by validation.
    pub fn into_payload(self) -> SynthesisPayload {
        let mut payload = SynthesisPayload::new(
            self.recipient_identity.unwrap_or_default(),
            self.text.unwrap_or_default(),
            self.audio_reference_id.unwrap_or_default(),
            self.video_avatar_reference_id.unwrap_or_default(),
        );
        if let Some(audio_text) = self.audio_text.filter(|t| !t.trim().is_empty()) {
            payload = payload.with_audio_text(audio_text);
        }
        payload
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub job_id: String,
}

/// Job status response.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    /// queued, processing, completed, failed (retry pending), dead_lettered
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_blob_id: Option<BlobId>,
    /// Where to fetch the video once completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        let video_url = (job.state == JobState::Completed)
            .then(|| format!("/api/jobs/{}/video", job.id));
        Self {
            job_id: job.id.to_string(),
            state: job.state,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            last_error: job.last_error,
            result_blob_id: job.result_blob_id,
            video_url,
            created_at: job.created_at.to_rfc3339(),
            updated_at: job.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct VideoQuery {
    /// `data_url` returns the video inline as JSON
    #[serde(default)]
    pub format: Option<String>,
}

/// Inline video payload for clients that cannot consume a binary body.
#[derive(Debug, Serialize, Deserialize)]
pub struct InlineVideoResponse {
    pub video: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/jobs
///
/// Returns 202 with the job id as soon as the job is durably queued.
pub async fn create_job(
    State(state): State<AppState>,
    body: Result<Json<CreateJobRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CreateJobResponse>)> {
    let Json(request) = body.map_err(|e| ApiError::invalid_request(e.body_text()))?;

    let job_id = state.producer.submit(request.into_payload()).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateJobResponse {
            job_id: job_id.to_string(),
        }),
    ))
}

/// GET /api/jobs/:job_id
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job = state.lookup.status(&JobId::from(job_id)).await?;
    Ok(Json(job.into()))
}

/// GET /api/jobs/:job_id/video
///
/// Streams the stored video chunk by chunk. Returns:
/// - 200: video body (or inline JSON with `?format=data_url`)
/// - 404: unknown job
/// - 409: job not completed yet
/// - 410: job dead-lettered or result expired
pub async fn get_job_video(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<VideoQuery>,
) -> ApiResult<Response> {
    let job_id = JobId::from(job_id);
    let (job, reader) = state.lookup.open_result(&job_id).await?;

    if query.format.as_deref() == Some("data_url") {
        let content_type = reader.info().metadata.content_type.clone();
        let limit = state.config.max_inline_video_bytes;
        let bytes = read_to_end(reader, limit).await.map_err(|e| match e {
            StorageError::TooLarge { limit } => ApiError::PayloadTooLarge(format!(
                "video exceeds {} bytes; fetch it without format=data_url",
                limit
            )),
            other => other.into(),
        })?;
        metrics::record_video_served("data_url", bytes.len() as u64);
        return Ok(Json(InlineVideoResponse {
            video: encode_data_url(&content_type, &bytes),
        })
        .into_response());
    }

    let (info, chunks) = reader.into_parts();
    info!(job_id = %job.id, blob_id = %info.blob_id, size = info.size, "Streaming video");
    metrics::record_video_served("binary", info.size);

    let filename = info
        .metadata
        .filename
        .clone()
        .unwrap_or_else(|| format!("{}.mp4", job.id));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, info.metadata.content_type.as_str())
        .header(header::CONTENT_LENGTH, info.size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{}\"", filename.replace('"', "")),
        )
        .header(header::CACHE_CONTROL, "private, max-age=3600")
        .body(Body::from_stream(chunks.map_err(|e| {
            tracing::warn!("Video stream aborted: {}", e);
            e
        })))
        .map_err(|e| ApiError::internal(format!("Failed to build response: {}", e)))
}
