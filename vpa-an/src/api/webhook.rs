//! Storage notification webhook
//!
//! Receives MinIO-style upload notifications and fans each record out to
//! its own worker task. The handler itself never blocks on inference;
//! it answers 202 once events are normalized and queued.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::ApiResult;
use crate::ingest;
use crate::AppState;

/// MinIO/S3 notification document
#[derive(Debug, Deserialize)]
pub struct StorageNotification {
    #[serde(rename = "Records", default)]
    pub records: Vec<NotificationRecord>,
}

#[derive(Debug, Deserialize)]
pub struct NotificationRecord {
    #[serde(rename = "eventName", default)]
    pub event_name: String,
    pub s3: S3Entity,
}

#[derive(Debug, Deserialize)]
pub struct S3Entity {
    pub bucket: BucketRef,
    pub object: ObjectRef,
}

#[derive(Debug, Deserialize)]
pub struct BucketRef {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ObjectRef {
    pub key: String,
}

/// POST /hooks/storage response
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Events normalized and handed to workers
    pub accepted: usize,
    /// Records dropped (foreign bucket, non-PUT, malformed key)
    pub dropped: usize,
}

/// POST /hooks/storage
///
/// The storage collaborator redelivers and reorders notifications; both
/// are safe here because per-view dispatch is idempotent downstream.
pub async fn storage_webhook(
    State(state): State<AppState>,
    Json(notification): Json<StorageNotification>,
) -> ApiResult<(StatusCode, Json<WebhookResponse>)> {
    // Correlates all log lines of one (possibly redelivered) notification
    let delivery_id = uuid::Uuid::new_v4();
    let mut accepted = 0;
    let mut dropped = 0;

    for record in notification.records {
        if record.s3.bucket.name != state.bucket {
            tracing::debug!(
                delivery = %delivery_id,
                bucket = %record.s3.bucket.name,
                "Notification for foreign bucket skipped"
            );
            dropped += 1;
            continue;
        }

        // Only object-creation events carry new uploads
        if !record.event_name.is_empty() && !record.event_name.contains("ObjectCreated") {
            tracing::debug!(event = %record.event_name, "Non-upload notification skipped");
            dropped += 1;
            continue;
        }

        let event = match ingest::parse_object_key(&record.s3.object.key) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    delivery = %delivery_id,
                    key = %record.s3.object.key,
                    error = %e,
                    "Malformed storage event dropped"
                );
                dropped += 1;
                continue;
            }
        };

        tracing::info!(
            delivery = %delivery_id,
            session = %event.session_key(),
            view = %event.view,
            object = %event.object_key,
            "Upload event accepted"
        );

        // One worker task per event; per-session locking serializes the
        // ones that target the same session.
        let coordinator = state.coordinator.clone();
        let last_error = state.last_error.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.handle_event(event).await {
                tracing::error!(error = %e, "Upload event worker failed");
                *last_error.write().await = Some(e.to_string());
            }
        });
        accepted += 1;
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookResponse { accepted, dropped }),
    ))
}

/// Build webhook routes
pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/hooks/storage", post(storage_webhook))
}
