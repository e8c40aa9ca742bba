//! vpa-an library interface
//!
//! Exposes public APIs for integration testing.

pub mod aggregate;
pub mod api;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod inference;
pub mod ingest;
pub mod models;
pub mod store;
pub mod util;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use vpa_common::events::EventBus;

use crate::coordinator::DispatchCoordinator;
use crate::store::SessionRegistry;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Per-session locks and cancellation tokens
    pub registry: Arc<SessionRegistry>,
    /// The orchestration core
    pub coordinator: Arc<DispatchCoordinator>,
    /// Bucket upload notifications are accepted for
    pub bucket: String,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last worker error for diagnostics
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        registry: Arc<SessionRegistry>,
        coordinator: Arc<DispatchCoordinator>,
        bucket: String,
    ) -> Self {
        Self {
            db,
            event_bus,
            registry,
            coordinator,
            bucket,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::webhook_routes())
        .merge(api::analysis_routes())
        .merge(api::health_routes())
        .route("/events", get(api::event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
