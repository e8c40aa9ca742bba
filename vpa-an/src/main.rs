//! vpa-an - Analysis Orchestrator Microservice
//!
//! Ingests storage-upload notifications for posture-analysis media,
//! groups them into sessions of 1-4 camera views, drives each view
//! through the pose inference backend, and aggregates per-view results
//! into one combined score/feedback record.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vpa_common::events::EventBus;

use vpa_an::coordinator::{DispatchCoordinator, RetryPolicy};
use vpa_an::inference::{InferenceOptions, WsInferenceClient};
use vpa_an::store::SessionRegistry;
use vpa_an::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Step 1: Load TOML configuration
    let config_path = vpa_common::config::default_config_path("vpa-an")
        .map_err(|e| anyhow::anyhow!("Failed to resolve config path: {}", e))?;
    let config = vpa_common::config::load_toml_config(&config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    // Step 2: Initialize tracing (RUST_LOG overrides the config level)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting vpa-an (Analysis Orchestrator) microservice");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Step 3: Open or create database
    let data_dir = vpa_common::config::resolve_data_dir(&config);
    let db_path = data_dir.join("vpa.db");
    info!("Database: {}", db_path.display());

    let db_pool = vpa_an::db::init_database_pool(&db_path).await?;
    info!("Database connection established");

    // Step 4: Cancel sessions stranded by a previous run
    let stale = vpa_an::db::sessions::cleanup_stale_sessions(&db_pool).await?;
    if stale > 0 {
        info!(stale, "Stale sessions marked cancelled");
    }

    // Step 5: Resolve inference configuration (Database -> ENV -> TOML)
    let model_registry = vpa_an::config::resolve_model_registry(&db_pool, &config).await?;
    let service_token = vpa_an::config::resolve_service_token(&db_pool, &config).await?;

    let inference = &config.inference;
    let options = InferenceOptions {
        service_token,
        storage_endpoint: config
            .storage
            .endpoint
            .clone()
            .unwrap_or_else(|| "http://127.0.0.1:9000".to_string()),
        frame_stride: inference.frame_stride.unwrap_or(10),
        max_frames: inference.max_frames.unwrap_or(15),
        deadline: Duration::from_millis(inference.deadline_ms.unwrap_or(30_000)),
    };
    let backend = Arc::new(WsInferenceClient::new(model_registry, options));

    let retry = RetryPolicy {
        base_delay: Duration::from_millis(inference.retry_base_ms.unwrap_or(1_000)),
        max_delay: Duration::from_millis(inference.retry_max_delay_ms.unwrap_or(60_000)),
        max_attempts: inference.max_retries.unwrap_or(4),
    };

    // Step 6: Wire the orchestration core
    let lock_wait = vpa_an::db::settings::get_session_lock_wait_ms(&db_pool).await?;
    let registry = Arc::new(SessionRegistry::new(Duration::from_millis(lock_wait)));
    let event_bus = EventBus::new(100);
    let bucket = config
        .storage
        .bucket
        .clone()
        .unwrap_or_else(|| "videos".to_string());

    let coordinator = Arc::new(DispatchCoordinator::new(
        db_pool.clone(),
        registry.clone(),
        backend,
        event_bus.clone(),
        retry,
        bucket.clone(),
    ));

    let state = AppState::new(db_pool, event_bus, registry, coordinator, bucket);
    let app = vpa_an::build_router(state);

    // Step 7: Serve
    let bind_address = config
        .bind_address
        .clone()
        .unwrap_or_else(|| "127.0.0.1:5841".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Listening on http://{}", bind_address);
    info!("Health check: http://{}/health", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
