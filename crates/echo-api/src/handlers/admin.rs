//! Operator endpoints.

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

/// Queue status response.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueStatusResponse {
    pub backend: String,
    pub queued: u64,
    pub processing: u64,
    pub dead_lettered: u64,
}

/// GET /api/admin/queue/status
pub async fn get_queue_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<QueueStatusResponse>> {
    require_admin(&state, &headers)?;

    let stats = state.queue.stats().await?;
    metrics::set_queue_depths(stats.queued, stats.processing, stats.dead_lettered);

    Ok(Json(QueueStatusResponse {
        backend: state.queue.backend_name().to_string(),
        queued: stats.queued,
        processing: stats.processing,
        dead_lettered: stats.dead_lettered,
    }))
}

/// Check the bearer token against `ADMIN_API_TOKEN`.
fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Err(ApiError::unauthorized("admin API is disabled"));
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(ApiError::unauthorized("invalid admin token")),
    }
}
