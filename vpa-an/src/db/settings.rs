//! Settings database operations
//!
//! Key-value settings table; the authoritative configuration tier
//! (Database → ENV → TOML resolution happens in crate::config).

use sqlx::SqlitePool;
use vpa_common::{Error, Result};

/// Prefix for per-model backend address overrides
pub const MODEL_BACKEND_PREFIX: &str = "inference_backend_";

/// Maximum total time save_session retries on "database is locked"
pub async fn get_db_max_lock_wait_ms(db: &SqlitePool) -> Result<u64> {
    get_setting(db, "an_database_max_lock_wait_ms")
        .await
        .map(|opt| opt.unwrap_or(5000))
}

/// Maximum wait for a session lock before LockTimeout is surfaced
pub async fn get_session_lock_wait_ms(db: &SqlitePool) -> Result<u64> {
    get_setting(db, "an_session_lock_wait_ms")
        .await
        .map(|opt| opt.unwrap_or(10_000))
}

/// Inference service token override, if set
pub async fn get_service_token(db: &SqlitePool) -> Result<Option<String>> {
    get_setting(db, "inference_service_token").await
}

pub async fn set_service_token(db: &SqlitePool, token: String) -> Result<()> {
    set_setting(db, "inference_service_token", token).await
}

/// All per-model backend overrides: model name -> "host:port"
pub async fn list_model_backends(db: &SqlitePool) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT key, value FROM settings WHERE key LIKE ? || '%'",
    )
    .bind(MODEL_BACKEND_PREFIX)
    .fetch_all(db)
    .await
    .map_err(Error::Database)?;

    Ok(rows
        .into_iter()
        .map(|(key, value)| (key[MODEL_BACKEND_PREFIX.len()..].to_string(), value))
        .collect())
}

pub async fn set_model_backend(db: &SqlitePool, model: &str, addr: String) -> Result<()> {
    set_setting(db, &format!("{}{}", MODEL_BACKEND_PREFIX, model), addr).await
}

/// Generic setting getter (internal)
async fn get_setting<T>(db: &SqlitePool, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await
        .map_err(Error::Database)?;

    match row {
        Some((value,)) => {
            let parsed = value
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Parse setting {} failed: {}", key, e)))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Generic setting setter (internal)
async fn set_setting<T>(db: &SqlitePool, key: &str, value: T) -> Result<()>
where
    T: std::fmt::Display,
{
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await
    .map_err(Error::Database)?;

    Ok(())
}
