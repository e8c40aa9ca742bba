//! Configuration resolution for vpa-an
//!
//! Multi-tier resolution with Database → ENV → TOML priority. The
//! settings table is authoritative so operators can repoint a backend
//! without restarting; environment variables and the TOML file seed it.

use sqlx::SqlitePool;
use std::collections::BTreeMap;
use tracing::{info, warn};
use vpa_common::config::TomlConfig;
use vpa_common::{Error, Result};

use crate::inference::{BackendAddr, ModelRegistry};

/// Environment prefix for per-model backend overrides
/// (`VPA_MODEL_CX=host:port` configures model "cx")
const MODEL_ENV_PREFIX: &str = "VPA_MODEL_";

/// Resolve the model registry from 3-tier configuration
///
/// Priority per model: Database → ENV → TOML. An empty registry is a
/// configuration error: the service cannot dispatch anything.
pub async fn resolve_model_registry(
    db: &SqlitePool,
    toml_config: &TomlConfig,
) -> Result<ModelRegistry> {
    let mut backends: BTreeMap<String, BackendAddr> = BTreeMap::new();

    // Tier 3: TOML config
    for (model, addr) in &toml_config.inference.models {
        match addr.parse::<BackendAddr>() {
            Ok(parsed) => {
                backends.insert(model.clone(), parsed);
            }
            Err(e) => {
                warn!(model = %model, error = %e, "Ignoring invalid TOML backend address");
            }
        }
    }

    // Tier 2: environment variables
    for (key, value) in std::env::vars() {
        let Some(model) = key.strip_prefix(MODEL_ENV_PREFIX) else {
            continue;
        };
        let model = model.to_ascii_lowercase();
        match value.parse::<BackendAddr>() {
            Ok(parsed) => {
                if backends.insert(model.clone(), parsed).is_some() {
                    info!(model = %model, "Backend address overridden from environment");
                }
            }
            Err(e) => {
                warn!(model = %model, error = %e, "Ignoring invalid env backend address");
            }
        }
    }

    // Tier 1: database (authoritative)
    for (model, addr) in crate::db::settings::list_model_backends(db).await? {
        match addr.parse::<BackendAddr>() {
            Ok(parsed) => {
                if backends.insert(model.clone(), parsed).is_some() {
                    info!(model = %model, "Backend address overridden from database");
                }
            }
            Err(e) => {
                warn!(model = %model, error = %e, "Ignoring invalid database backend address");
            }
        }
    }

    if backends.is_empty() {
        return Err(Error::Config(
            "No inference backends configured. Configure using one of:\n\
             1. Settings table: inference_backend_<model> = host:port\n\
             2. Environment: VPA_MODEL_<MODEL>=host:port\n\
             3. TOML config: [inference.models] <model> = \"host:port\""
                .to_string(),
        ));
    }

    let registry = ModelRegistry::new(backends);
    info!(
        models = %registry.model_names().collect::<Vec<_>>().join(", "),
        "Model registry resolved"
    );
    Ok(registry)
}

/// Resolve the inference service token (Database → ENV → TOML)
///
/// An absent token is allowed; backends that enforce authentication will
/// reject the connection, which surfaces as a protocol failure.
pub async fn resolve_service_token(db: &SqlitePool, toml_config: &TomlConfig) -> Result<String> {
    if let Some(token) = crate::db::settings::get_service_token(db).await? {
        if !token.trim().is_empty() {
            info!("Inference service token loaded from database");
            return Ok(token);
        }
    }

    if let Ok(token) = std::env::var("VPA_SERVICE_TOKEN") {
        if !token.trim().is_empty() {
            info!("Inference service token loaded from environment");
            return Ok(token);
        }
    }

    if let Some(token) = &toml_config.inference.service_token {
        if !token.trim().is_empty() {
            info!("Inference service token loaded from TOML config");
            return Ok(token.clone());
        }
    }

    warn!("No inference service token configured; connecting unauthenticated");
    Ok(String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    async fn memory_pool() -> SqlitePool {
        // Single connection: each in-memory SQLite connection is its own db
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::init_tables(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    #[serial]
    async fn toml_models_populate_registry() {
        let pool = memory_pool().await;
        let mut config = TomlConfig::default();
        config
            .inference
            .models
            .insert("cx".to_string(), "127.0.0.1:8895".to_string());

        let registry = resolve_model_registry(&pool, &config).await.unwrap();
        assert!(registry.contains("cx"));
        assert_eq!(registry.lookup("cx").unwrap().port, 8895);
    }

    #[tokio::test]
    #[serial]
    async fn database_overrides_toml() {
        let pool = memory_pool().await;
        let mut config = TomlConfig::default();
        config
            .inference
            .models
            .insert("cx".to_string(), "127.0.0.1:8895".to_string());

        crate::db::settings::set_model_backend(&pool, "cx", "10.0.0.9:9000".to_string())
            .await
            .unwrap();

        let registry = resolve_model_registry(&pool, &config).await.unwrap();
        assert_eq!(registry.lookup("cx").unwrap().host, "10.0.0.9");
        assert_eq!(registry.lookup("cx").unwrap().port, 9000);
    }

    #[tokio::test]
    #[serial]
    async fn env_var_adds_model() {
        let pool = memory_pool().await;
        std::env::set_var("VPA_MODEL_GY", "127.0.0.1:8896");

        let registry = resolve_model_registry(&pool, &TomlConfig::default()).await;
        std::env::remove_var("VPA_MODEL_GY");

        let registry = registry.unwrap();
        assert!(registry.contains("gy"));
    }

    #[tokio::test]
    #[serial]
    async fn empty_registry_is_config_error() {
        let pool = memory_pool().await;
        let err = resolve_model_registry(&pool, &TomlConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
