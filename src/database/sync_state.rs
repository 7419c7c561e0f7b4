//! Bookkeeping for sync runs: run and log rows, per-resource cursors and the
//! organization settings row.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::models::*;
use super::{from_db_time, opt_db_time, opt_from_db_time, to_db_time};
use crate::error::SyncError;

pub struct SyncState;

impl SyncState {
    pub async fn create_run(
        pool: &SqlitePool,
        run_type: RunType,
        strategy: SyncStrategy,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<SyncRun, SyncError> {
        let run = SyncRun {
            id: Uuid::new_v4().to_string(),
            run_type,
            strategy,
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            since,
            until,
            error: None,
            summary: None,
        };

        sqlx::query(
            r#"
            INSERT INTO sync_runs (id, run_type, strategy, status, started_at, since, until)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(run.run_type.as_str())
        .bind(run.strategy.as_str())
        .bind(run.status.as_str())
        .bind(to_db_time(run.started_at))
        .bind(opt_db_time(run.since))
        .bind(opt_db_time(run.until))
        .execute(pool)
        .await?;

        Ok(run)
    }

    /// Close a run. Only `running` rows are updated, so a terminal status is written once.
    pub async fn finish_run(
        pool: &SqlitePool,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
        summary: Option<&Value>,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = ?, completed_at = ?, error = ?, summary = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(to_db_time(Utc::now()))
        .bind(error)
        .bind(summary.map(Value::to_string))
        .bind(run_id)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn create_log(
        pool: &SqlitePool,
        run_id: &str,
        resource: Resource,
    ) -> Result<i64, SyncError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_logs (run_id, resource, status, started_at)
            VALUES (?, ?, 'running', ?)
            "#,
        )
        .bind(run_id)
        .bind(resource.as_str())
        .bind(to_db_time(Utc::now()))
        .execute(pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn finish_log(
        pool: &SqlitePool,
        log_id: i64,
        status: RunStatus,
        items_processed: i64,
        error: Option<&str>,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            UPDATE sync_logs
            SET status = ?, completed_at = ?, items_processed = ?, error = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(to_db_time(Utc::now()))
        .bind(items_processed)
        .bind(error)
        .bind(log_id)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn get_run(pool: &SqlitePool, run_id: &str) -> Result<Option<SyncRun>, SyncError> {
        let row = sqlx::query("SELECT * FROM sync_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(pool)
            .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    pub async fn get_cursor(
        pool: &SqlitePool,
        resource: Resource,
    ) -> Result<Option<SyncCursor>, SyncError> {
        let row = sqlx::query("SELECT * FROM sync_cursors WHERE resource = ?")
            .bind(resource.as_str())
            .fetch_optional(pool)
            .await?;

        row.as_ref().map(cursor_from_row).transpose()
    }

    /// Move a resource's high-water mark forward; an older mark leaves the row unchanged.
    pub async fn advance_cursor(
        pool: &SqlitePool,
        resource: Resource,
        cursor: Option<&str>,
        last_item_at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (resource, cursor, last_item_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(resource) DO UPDATE SET
                cursor = CASE
                    WHEN sync_cursors.last_item_at IS NULL OR excluded.last_item_at > sync_cursors.last_item_at
                    THEN COALESCE(excluded.cursor, sync_cursors.cursor)
                    ELSE sync_cursors.cursor
                END,
                last_item_at = MAX(COALESCE(sync_cursors.last_item_at, excluded.last_item_at), excluded.last_item_at),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(resource.as_str())
        .bind(cursor)
        .bind(to_db_time(last_item_at))
        .bind(to_db_time(Utc::now()))
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn get_settings(
        pool: &SqlitePool,
        organization: &str,
    ) -> Result<Option<SyncSettings>, SyncError> {
        let row = sqlx::query("SELECT * FROM sync_settings WHERE organization = ?")
            .bind(organization)
            .fetch_optional(pool)
            .await?;

        row.as_ref().map(settings_from_row).transpose()
    }

    pub async fn mark_started(
        pool: &SqlitePool,
        organization: &str,
        at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO sync_settings (organization, last_started_at, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(organization) DO UPDATE SET
                last_started_at = excluded.last_started_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(organization)
        .bind(to_db_time(at))
        .bind(to_db_time(Utc::now()))
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Stamp run completion; `successful_at` is applied only if it moves the marker forward.
    pub async fn mark_completed(
        pool: &SqlitePool,
        organization: &str,
        at: DateTime<Utc>,
        successful_at: Option<DateTime<Utc>>,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO sync_settings (organization, last_completed_at, last_successful_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(organization) DO UPDATE SET
                last_completed_at = excluded.last_completed_at,
                last_successful_at = CASE
                    WHEN excluded.last_successful_at IS NULL THEN sync_settings.last_successful_at
                    WHEN sync_settings.last_successful_at IS NULL THEN excluded.last_successful_at
                    ELSE MAX(sync_settings.last_successful_at, excluded.last_successful_at)
                END,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(organization)
        .bind(to_db_time(at))
        .bind(opt_db_time(successful_at))
        .bind(to_db_time(Utc::now()))
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn set_schedule(
        pool: &SqlitePool,
        organization: &str,
        enabled: bool,
        interval_minutes: Option<i64>,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO sync_settings (organization, auto_sync_enabled, auto_sync_interval_minutes, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(organization) DO UPDATE SET
                auto_sync_enabled = excluded.auto_sync_enabled,
                auto_sync_interval_minutes = COALESCE(excluded.auto_sync_interval_minutes, sync_settings.auto_sync_interval_minutes),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(organization)
        .bind(enabled)
        .bind(interval_minutes)
        .bind(to_db_time(Utc::now()))
        .execute(pool)
        .await?;

        Ok(())
    }
}

pub(crate) fn run_from_row(row: &SqliteRow) -> Result<SyncRun, SyncError> {
    let run_type: String = row.get("run_type");
    let strategy: String = row.get("strategy");
    let status: String = row.get("status");
    let summary: Option<String> = row.get("summary");

    Ok(SyncRun {
        id: row.get("id"),
        run_type: RunType::from_str(&run_type)
            .ok_or_else(|| SyncError::DatabaseError(format!("Unknown run type: {}", run_type)))?,
        strategy: SyncStrategy::from_str(&strategy)
            .ok_or_else(|| SyncError::DatabaseError(format!("Unknown strategy: {}", strategy)))?,
        status: RunStatus::from_str(&status)
            .ok_or_else(|| SyncError::DatabaseError(format!("Unknown run status: {}", status)))?,
        started_at: from_db_time(row.get("started_at"))?,
        completed_at: opt_from_db_time(row.get("completed_at"))?,
        since: opt_from_db_time(row.get("since"))?,
        until: opt_from_db_time(row.get("until"))?,
        error: row.get("error"),
        summary: summary.map(|s| serde_json::from_str(&s)).transpose()?,
    })
}

pub(crate) fn log_from_row(row: &SqliteRow) -> Result<SyncLog, SyncError> {
    let resource: String = row.get("resource");
    let status: String = row.get("status");

    Ok(SyncLog {
        id: row.get("id"),
        run_id: row.get("run_id"),
        resource: Resource::from_str(&resource)
            .ok_or_else(|| SyncError::DatabaseError(format!("Unknown resource: {}", resource)))?,
        status: RunStatus::from_str(&status)
            .ok_or_else(|| SyncError::DatabaseError(format!("Unknown log status: {}", status)))?,
        started_at: from_db_time(row.get("started_at"))?,
        completed_at: opt_from_db_time(row.get("completed_at"))?,
        items_processed: row.get("items_processed"),
        error: row.get("error"),
    })
}

pub(crate) fn cursor_from_row(row: &SqliteRow) -> Result<SyncCursor, SyncError> {
    let resource: String = row.get("resource");

    Ok(SyncCursor {
        resource: Resource::from_str(&resource)
            .ok_or_else(|| SyncError::DatabaseError(format!("Unknown resource: {}", resource)))?,
        cursor: row.get("cursor"),
        last_item_at: opt_from_db_time(row.get("last_item_at"))?,
        updated_at: from_db_time(row.get("updated_at"))?,
    })
}

fn settings_from_row(row: &SqliteRow) -> Result<SyncSettings, SyncError> {
    Ok(SyncSettings {
        organization: row.get("organization"),
        last_started_at: opt_from_db_time(row.get("last_started_at"))?,
        last_completed_at: opt_from_db_time(row.get("last_completed_at"))?,
        last_successful_at: opt_from_db_time(row.get("last_successful_at"))?,
        auto_sync_enabled: row.get("auto_sync_enabled"),
        auto_sync_interval_minutes: row.get("auto_sync_interval_minutes"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn at(value: &str) -> DateTime<Utc> {
        value.parse().unwrap()
    }

    #[tokio::test]
    async fn test_cursor_never_regresses() {
        let db = Database::new_in_memory().await.unwrap();
        let pool = db.pool();

        SyncState::advance_cursor(pool, Resource::Issues, Some("c2"), at("2024-02-01T00:00:00Z"))
            .await
            .unwrap();
        SyncState::advance_cursor(pool, Resource::Issues, Some("c1"), at("2024-01-01T00:00:00Z"))
            .await
            .unwrap();

        let cursor = SyncState::get_cursor(pool, Resource::Issues).await.unwrap().unwrap();
        assert_eq!(cursor.last_item_at, Some(at("2024-02-01T00:00:00Z")));
        assert_eq!(cursor.cursor.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn test_last_successful_never_decreases() {
        let db = Database::new_in_memory().await.unwrap();
        let pool = db.pool();
        let now = Utc::now();

        SyncState::mark_completed(pool, "acme", now, Some(at("2024-03-01T00:00:00Z")))
            .await
            .unwrap();
        SyncState::mark_completed(pool, "acme", now, Some(at("2024-02-01T00:00:00Z")))
            .await
            .unwrap();
        SyncState::mark_completed(pool, "acme", now, None).await.unwrap();

        let settings = SyncState::get_settings(pool, "acme").await.unwrap().unwrap();
        assert_eq!(settings.last_successful_at, Some(at("2024-03-01T00:00:00Z")));
    }

    #[tokio::test]
    async fn test_terminal_status_written_once() {
        let db = Database::new_in_memory().await.unwrap();
        let pool = db.pool();

        let run = SyncState::create_run(pool, RunType::Manual, SyncStrategy::Incremental, None, None)
            .await
            .unwrap();
        SyncState::finish_run(pool, &run.id, RunStatus::Failed, Some("boom"), None)
            .await
            .unwrap();
        SyncState::finish_run(pool, &run.id, RunStatus::Success, None, None)
            .await
            .unwrap();

        let stored = SyncState::get_run(pool, &run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_schedule_keeps_interval_when_disabled() {
        let db = Database::new_in_memory().await.unwrap();
        let pool = db.pool();

        SyncState::set_schedule(pool, "acme", true, Some(30)).await.unwrap();
        SyncState::set_schedule(pool, "acme", false, None).await.unwrap();

        let settings = SyncState::get_settings(pool, "acme").await.unwrap().unwrap();
        assert!(!settings.auto_sync_enabled);
        assert_eq!(settings.auto_sync_interval_minutes, Some(30));
    }
}
