//! Session status, cancellation, and retry endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::models::{CombinedResult, SessionKey, SessionStatus};
use crate::AppState;

/// GET /analysis/status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub owner_id: String,
    pub session_id: String,
    pub model_name: String,
    pub status: SessionStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combined_result: Option<CombinedResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// POST /analysis/cancel response
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub owner_id: String,
    pub session_id: String,
    pub status: SessionStatus,
}

/// POST /analysis/retry response
#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub owner_id: String,
    pub session_id: String,
    pub views_redispatched: usize,
}

/// GET /analysis/status/:owner_id/:session_id
///
/// Reads the committed row outside the session lock; rows are only ever
/// written whole, so this is a consistent snapshot.
pub async fn get_status(
    State(state): State<AppState>,
    Path((owner_id, session_id)): Path<(String, String)>,
) -> ApiResult<Json<StatusResponse>> {
    let key = SessionKey::new(owner_id, session_id);
    let session = db::sessions::load_session(&state.db, &key)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("analysis session {}", key)))?;

    tracing::debug!(session = %key, status = %session.status, "Status query");

    Ok(Json(StatusResponse {
        owner_id: session.owner_id,
        session_id: session.session_id,
        model_name: session.model_name,
        status: session.status,
        progress: session.progress,
        combined_result: session.combined_result,
        error: session.error,
        created_at: session.created_at,
        updated_at: session.updated_at,
    }))
}

/// POST /analysis/cancel/:owner_id/:session_id
///
/// Called by the deletion collaborator before it removes the underlying
/// files. Idempotent: cancelling a terminal session reports its state.
pub async fn cancel_analysis(
    State(state): State<AppState>,
    Path((owner_id, session_id)): Path<(String, String)>,
) -> ApiResult<Json<CancelResponse>> {
    let key = SessionKey::new(owner_id, session_id);
    let status = state.coordinator.cancel(&key).await.map_err(ApiError::from)?;

    tracing::info!(session = %key, status = %status, "Cancellation requested");

    Ok(Json(CancelResponse {
        owner_id: key.owner_id,
        session_id: key.session_id,
        status,
    }))
}

/// POST /analysis/retry/:owner_id/:session_id
///
/// External re-attempt action: resets a failed session to pending and
/// re-dispatches every recorded upload. Returns 202.
pub async fn retry_analysis(
    State(state): State<AppState>,
    Path((owner_id, session_id)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<RetryResponse>)> {
    let key = SessionKey::new(owner_id, session_id);
    let views_redispatched = state
        .coordinator
        .clone()
        .reset_and_redispatch(&key)
        .await
        .map_err(ApiError::from)?;

    tracing::info!(session = %key, views_redispatched, "Failed session re-dispatched");

    Ok((
        StatusCode::ACCEPTED,
        Json(RetryResponse {
            owner_id: key.owner_id,
            session_id: key.session_id,
            views_redispatched,
        }),
    ))
}

/// Build analysis routes
pub fn analysis_routes() -> Router<AppState> {
    Router::new()
        .route("/analysis/status/:owner_id/:session_id", get(get_status))
        .route("/analysis/cancel/:owner_id/:session_id", post(cancel_analysis))
        .route("/analysis/retry/:owner_id/:session_id", post(retry_analysis))
}
