//! Analysis session persistence
//!
//! One row per `(owner_id, session_id)`. Rows are written only while the
//! session lock is held, so a committed row is always a consistent
//! snapshot for readers outside the lock (status endpoint).

use sqlx::{Row, SqlitePool};
use vpa_common::{Error, Result};

use crate::models::{AnalysisSession, SessionKey, SessionStatus};
use crate::util::retry_on_lock;

/// Save (upsert) a session row
///
/// Uses retry_on_lock to ride out transient SQLite lock contention.
pub async fn save_session(pool: &SqlitePool, session: &AnalysisSession) -> Result<()> {
    // Prepare all data BEFORE acquiring a database connection
    let expected_views = serde_json::to_string(&session.expected_views)
        .map_err(|e| Error::Internal(format!("Failed to serialize expected_views: {}", e)))?;
    let received_views = serde_json::to_string(&session.received_views)
        .map_err(|e| Error::Internal(format!("Failed to serialize received_views: {}", e)))?;
    let uploaded_objects = serde_json::to_string(&session.uploaded_objects)
        .map_err(|e| Error::Internal(format!("Failed to serialize uploaded_objects: {}", e)))?;
    let combined_result = session
        .combined_result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| Error::Internal(format!("Failed to serialize combined_result: {}", e)))?;
    let status = session.status.as_str();
    let created_at = session.created_at.to_rfc3339();
    let updated_at = session.updated_at.to_rfc3339();

    let max_wait_ms = super::settings::get_db_max_lock_wait_ms(pool).await?;

    retry_on_lock("save_session", max_wait_ms, || async {
        sqlx::query(
            r#"
            INSERT INTO analysis_sessions (
                owner_id, session_id, model_name, status, progress,
                expected_views, received_views, uploaded_objects,
                combined_result, error, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(owner_id, session_id) DO UPDATE SET
                status = excluded.status,
                progress = excluded.progress,
                received_views = excluded.received_views,
                uploaded_objects = excluded.uploaded_objects,
                combined_result = excluded.combined_result,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session.owner_id)
        .bind(&session.session_id)
        .bind(&session.model_name)
        .bind(status)
        .bind(session.progress as i64)
        .bind(&expected_views)
        .bind(&received_views)
        .bind(&uploaded_objects)
        .bind(&combined_result)
        .bind(&session.error)
        .bind(&created_at)
        .bind(&updated_at)
        .execute(pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    })
    .await
}

/// Load the session for a key, or create a pending one
///
/// Must be called with the session lock held. Returns the session and
/// whether it was newly created.
pub async fn get_or_create(
    pool: &SqlitePool,
    key: &SessionKey,
    model_name: &str,
    expected_views: std::collections::BTreeSet<crate::models::View>,
) -> Result<(AnalysisSession, bool)> {
    if let Some(session) = load_session(pool, key).await? {
        return Ok((session, false));
    }

    let session = AnalysisSession::new(key, model_name, expected_views);
    save_session(pool, &session).await?;
    Ok((session, true))
}

/// Load a session row, if present
pub async fn load_session(pool: &SqlitePool, key: &SessionKey) -> Result<Option<AnalysisSession>> {
    let row = sqlx::query(
        r#"
        SELECT owner_id, session_id, model_name, status, progress,
               expected_views, received_views, uploaded_objects,
               combined_result, error, created_at, updated_at
        FROM analysis_sessions
        WHERE owner_id = ? AND session_id = ?
        "#,
    )
    .bind(&key.owner_id)
    .bind(&key.session_id)
    .fetch_optional(pool)
    .await?;

    row.map(session_from_row).transpose()
}

fn session_from_row(row: sqlx::sqlite::SqliteRow) -> Result<AnalysisSession> {
    let status_str: String = row.get("status");
    let status: SessionStatus = status_str
        .parse()
        .map_err(|_| Error::Internal(format!("Unknown session status: {}", status_str)))?;

    let expected_views: String = row.get("expected_views");
    let expected_views = serde_json::from_str(&expected_views)
        .map_err(|e| Error::Internal(format!("Failed to parse expected_views: {}", e)))?;

    let received_views: String = row.get("received_views");
    let received_views = serde_json::from_str(&received_views)
        .map_err(|e| Error::Internal(format!("Failed to parse received_views: {}", e)))?;

    let uploaded_objects: String = row.get("uploaded_objects");
    let uploaded_objects = serde_json::from_str(&uploaded_objects)
        .map_err(|e| Error::Internal(format!("Failed to parse uploaded_objects: {}", e)))?;

    let combined_result: Option<String> = row.get("combined_result");
    let combined_result = combined_result
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| Error::Internal(format!("Failed to parse combined_result: {}", e)))?;

    let created_at: String = row.get("created_at");
    let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| Error::Internal(format!("Failed to parse created_at: {}", e)))?
        .with_timezone(&chrono::Utc);

    let updated_at: String = row.get("updated_at");
    let updated_at = chrono::DateTime::parse_from_rfc3339(&updated_at)
        .map_err(|e| Error::Internal(format!("Failed to parse updated_at: {}", e)))?
        .with_timezone(&chrono::Utc);

    Ok(AnalysisSession {
        owner_id: row.get("owner_id"),
        session_id: row.get("session_id"),
        model_name: row.get("model_name"),
        expected_views,
        received_views,
        uploaded_objects,
        status,
        progress: row.get::<i64, _>("progress") as u8,
        combined_result,
        error: row.get("error"),
        created_at,
        updated_at,
    })
}

/// Cleanup stale sessions on startup
///
/// A session left non-terminal by a previous process has no worker task
/// and will never progress; mark it cancelled so clients stop waiting.
pub async fn cleanup_stale_sessions(pool: &SqlitePool) -> Result<usize> {
    let result = sqlx::query(
        r#"
        UPDATE analysis_sessions
        SET status = 'cancelled',
            error = 'analysis cancelled - service was restarted',
            updated_at = ?
        WHERE status IN ('pending', 'in_progress')
        "#,
    )
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() as usize)
}
