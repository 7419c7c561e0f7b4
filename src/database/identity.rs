//! Identity migration: re-key an issue whose remote node id changed.
//!
//! All locally accumulated rows follow the issue from the old id to the new
//! one. When the new id already exists locally, its row wins and the old row
//! is dropped.

use serde::Serialize;
use sqlx::{Connection, Row, SqliteConnection};
use tracing::info;

use crate::error::SyncError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationOutcome {
    /// The new id already had a row; the old row was discarded in its favour.
    pub target_existed: bool,
    pub comments_moved: u64,
    pub reactions_moved: u64,
    pub history_moved: u64,
}

/// Tables keyed by `(issue_id, ...)` where the target's rows win on collision.
const KEYED_TABLES: &[&str] = &[
    "project_overrides",
    "pull_request_issue_links",
    "issue_project_items",
];

pub async fn migrate_issue_identity(
    conn: &mut SqliteConnection,
    old_id: &str,
    new_id: &str,
) -> Result<MigrationOutcome, SyncError> {
    if old_id == new_id {
        return Ok(MigrationOutcome::default());
    }

    let mut tx = conn.begin().await?;

    let target_existed = sqlx::query("SELECT COUNT(*) AS n FROM issues WHERE id = ?")
        .bind(new_id)
        .fetch_one(&mut *tx)
        .await?
        .get::<i64, _>("n")
        > 0;

    if !target_existed {
        // Copy the row under the new id so children can be re-pointed before the old row goes.
        sqlx::query(
            r#"
            INSERT INTO issues (id, number, repository_id, author_id, kind, title, state, url,
                                created_at, updated_at, closed_at, payload, ownership_verified_at, synced_at)
            SELECT ?, number, repository_id, author_id, kind, title, state, url,
                   created_at, updated_at, closed_at, payload, ownership_verified_at, synced_at
            FROM issues WHERE id = ?
            "#,
        )
        .bind(new_id)
        .bind(old_id)
        .execute(&mut *tx)
        .await?;
    }

    let comments_moved = sqlx::query("UPDATE comments SET issue_id = ? WHERE issue_id = ?")
        .bind(new_id)
        .bind(old_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    let reactions_moved = sqlx::query("UPDATE reactions SET issue_id = ? WHERE issue_id = ?")
        .bind(new_id)
        .bind(old_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    let history_moved =
        sqlx::query("UPDATE issue_status_history SET issue_id = ? WHERE issue_id = ?")
            .bind(new_id)
            .bind(old_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

    for table in KEYED_TABLES {
        sqlx::query(&format!(
            "UPDATE OR IGNORE {} SET issue_id = ? WHERE issue_id = ?",
            table
        ))
        .bind(new_id)
        .bind(old_id)
        .execute(&mut *tx)
        .await?;

        // Rows left under the old id collided with the target's own rows.
        sqlx::query(&format!("DELETE FROM {} WHERE issue_id = ?", table))
            .bind(old_id)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query("DELETE FROM issue_snapshots WHERE issue_id IN (?, ?)")
        .bind(old_id)
        .bind(new_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM issues WHERE id = ?")
        .bind(old_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    info!(
        old_id,
        new_id, target_existed, comments_moved, reactions_moved, "Migrated issue identity"
    );

    Ok(MigrationOutcome {
        target_existed,
        comments_moved,
        reactions_moved,
        history_moved,
    })
}
