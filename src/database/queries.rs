use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::models::*;
use super::sync_state::{cursor_from_row, log_from_row, run_from_row};
use super::{from_db_time, opt_from_db_time, to_db_time};
use crate::error::SyncError;

/// Row counts per stored entity kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub actors: i64,
    pub repositories: i64,
    pub issues: i64,
    pub discussions: i64,
    pub pull_requests: i64,
    pub reviews: i64,
    pub review_requests: i64,
    pub comments: i64,
    pub reactions: i64,
}

pub struct Queries;

impl Queries {
    pub async fn recent_runs(pool: &SqlitePool, limit: i64) -> Result<Vec<SyncRun>, SyncError> {
        let rows = sqlx::query("SELECT * FROM sync_runs ORDER BY started_at DESC, rowid DESC LIMIT ?")
            .bind(limit)
            .fetch_all(pool)
            .await?;

        rows.iter().map(run_from_row).collect()
    }

    pub async fn logs_for_run(pool: &SqlitePool, run_id: &str) -> Result<Vec<SyncLog>, SyncError> {
        let rows = sqlx::query("SELECT * FROM sync_logs WHERE run_id = ? ORDER BY id")
            .bind(run_id)
            .fetch_all(pool)
            .await?;

        rows.iter().map(log_from_row).collect()
    }

    pub async fn cursors(pool: &SqlitePool) -> Result<Vec<SyncCursor>, SyncError> {
        let rows = sqlx::query("SELECT * FROM sync_cursors ORDER BY resource")
            .fetch_all(pool)
            .await?;

        rows.iter().map(cursor_from_row).collect()
    }

    pub async fn get_issue(pool: &SqlitePool, id: &str) -> Result<Option<Issue>, SyncError> {
        let row = sqlx::query("SELECT * FROM issues WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        row.as_ref().map(issue_from_row).transpose()
    }

    pub async fn get_repository(pool: &SqlitePool, id: &str) -> Result<Option<Repository>, SyncError> {
        let row = sqlx::query("SELECT * FROM repositories WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload: String = row.get("payload");

        Ok(Some(Repository {
            id: row.get("id"),
            name: row.get("name"),
            name_with_owner: row.get("name_with_owner"),
            owner_id: row.get("owner_id"),
            visibility: row.get("visibility"),
            is_archived: row.get("is_archived"),
            url: row.get("url"),
            created_at: opt_from_db_time(row.get("created_at"))?,
            updated_at: opt_from_db_time(row.get("updated_at"))?,
            payload: serde_json::from_str(&payload)?,
        }))
    }

    pub async fn comments_for_issue(pool: &SqlitePool, issue_id: &str) -> Result<Vec<Comment>, SyncError> {
        let rows = sqlx::query("SELECT * FROM comments WHERE issue_id = ? ORDER BY created_at, id")
            .bind(issue_id)
            .fetch_all(pool)
            .await?;

        rows.iter().map(comment_from_row).collect()
    }

    pub async fn comments_for_pull_request(
        pool: &SqlitePool,
        pull_request_id: &str,
    ) -> Result<Vec<Comment>, SyncError> {
        let rows = sqlx::query("SELECT * FROM comments WHERE pull_request_id = ? ORDER BY created_at, id")
            .bind(pull_request_id)
            .fetch_all(pool)
            .await?;

        rows.iter().map(comment_from_row).collect()
    }

    pub async fn pending_reviewers(
        pool: &SqlitePool,
        pull_request_id: &str,
    ) -> Result<Vec<ReviewRequest>, SyncError> {
        let rows = sqlx::query(
            "SELECT * FROM review_requests WHERE pull_request_id = ? ORDER BY reviewer_id",
        )
        .bind(pull_request_id)
        .fetch_all(pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ReviewRequest {
                    pull_request_id: row.get("pull_request_id"),
                    reviewer_id: row.get("reviewer_id"),
                    requested_at: from_db_time(row.get("requested_at"))?,
                })
            })
            .collect()
    }

    pub async fn status_history(pool: &SqlitePool, issue_id: &str) -> Result<Vec<StatusChange>, SyncError> {
        let rows = sqlx::query(
            "SELECT issue_id, state, changed_at FROM issue_status_history WHERE issue_id = ? ORDER BY id",
        )
        .bind(issue_id)
        .fetch_all(pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StatusChange {
                    issue_id: row.get("issue_id"),
                    state: row.get("state"),
                    changed_at: from_db_time(row.get("changed_at"))?,
                })
            })
            .collect()
    }

    pub async fn project_override(
        pool: &SqlitePool,
        issue_id: &str,
    ) -> Result<Option<ProjectOverride>, SyncError> {
        let row = sqlx::query("SELECT * FROM project_overrides WHERE issue_id = ?")
            .bind(issue_id)
            .fetch_optional(pool)
            .await?;

        row.map(|row| {
            Ok(ProjectOverride {
                issue_id: row.get("issue_id"),
                status: row.get("status"),
                priority: row.get("priority"),
                target_date: row.get("target_date"),
                updated_at: from_db_time(row.get("updated_at"))?,
            })
        })
        .transpose()
    }

    pub async fn project_item_ids(pool: &SqlitePool, issue_id: &str) -> Result<Vec<String>, SyncError> {
        let rows = sqlx::query(
            "SELECT project_item_id FROM issue_project_items WHERE issue_id = ? ORDER BY project_item_id",
        )
        .bind(issue_id)
        .fetch_all(pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("project_item_id")).collect())
    }

    pub async fn linked_issue_ids(pool: &SqlitePool, pull_request_id: &str) -> Result<Vec<String>, SyncError> {
        let rows = sqlx::query(
            "SELECT issue_id FROM pull_request_issue_links WHERE pull_request_id = ? ORDER BY issue_id",
        )
        .bind(pull_request_id)
        .fetch_all(pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("issue_id")).collect())
    }

    pub async fn issue_snapshot(pool: &SqlitePool, issue_id: &str) -> Result<Option<IssueSnapshot>, SyncError> {
        let row = sqlx::query("SELECT * FROM issue_snapshots WHERE issue_id = ?")
            .bind(issue_id)
            .fetch_optional(pool)
            .await?;

        row.map(|row| {
            Ok(IssueSnapshot {
                issue_id: row.get("issue_id"),
                comment_count: row.get("comment_count"),
                reaction_count: row.get("reaction_count"),
                last_activity_at: opt_from_db_time(row.get("last_activity_at"))?,
                refreshed_at: from_db_time(row.get("refreshed_at"))?,
            })
        })
        .transpose()
    }

    pub async fn counts(pool: &SqlitePool) -> Result<StoreCounts, SyncError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM actors) AS actors,
                (SELECT COUNT(*) FROM repositories) AS repositories,
                (SELECT COUNT(*) FROM issues WHERE kind = 'issue') AS issues,
                (SELECT COUNT(*) FROM issues WHERE kind = 'discussion') AS discussions,
                (SELECT COUNT(*) FROM pull_requests) AS pull_requests,
                (SELECT COUNT(*) FROM reviews) AS reviews,
                (SELECT COUNT(*) FROM review_requests) AS review_requests,
                (SELECT COUNT(*) FROM comments) AS comments,
                (SELECT COUNT(*) FROM reactions) AS reactions
            "#,
        )
        .fetch_one(pool)
        .await?;

        Ok(StoreCounts {
            actors: row.get("actors"),
            repositories: row.get("repositories"),
            issues: row.get("issues"),
            discussions: row.get("discussions"),
            pull_requests: row.get("pull_requests"),
            reviews: row.get("reviews"),
            review_requests: row.get("review_requests"),
            comments: row.get("comments"),
            reactions: row.get("reactions"),
        })
    }

    /// Issues whose URL no longer names their repository, or whose ownership
    /// check is missing or older than `verified_before`.
    pub async fn realignment_candidates(
        pool: &SqlitePool,
        verified_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RealignCandidate>, SyncError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT i.id, i.kind, i.number, i.url, i.repository_id, i.ownership_verified_at,
                       r.name_with_owner,
                       instr(lower(i.url), '/' || lower(r.name_with_owner) || '/') = 0 AS mismatched
                FROM issues i
                JOIN repositories r ON r.id = i.repository_id
            )
            WHERE mismatched
               OR ownership_verified_at IS NULL
               OR ownership_verified_at < ?
            ORDER BY mismatched DESC, ownership_verified_at IS NOT NULL, ownership_verified_at ASC, id
            LIMIT ?
            "#,
        )
        .bind(to_db_time(verified_before))
        .bind(limit)
        .fetch_all(pool)
        .await?;

        rows.iter()
            .map(|row| {
                let kind: String = row.get("kind");
                Ok(RealignCandidate {
                    id: row.get("id"),
                    kind: ItemKind::from_str(&kind)
                        .ok_or_else(|| SyncError::DatabaseError(format!("Unknown item kind: {}", kind)))?,
                    number: row.get("number"),
                    url: row.get("url"),
                    repository_id: row.get("repository_id"),
                    repository_name_with_owner: row.get("name_with_owner"),
                    mismatched: row.get("mismatched"),
                    ownership_verified_at: opt_from_db_time(row.get("ownership_verified_at"))?,
                })
            })
            .collect()
    }

    /// Other issues sharing a project-board item with `issue_id`.
    pub async fn project_item_siblings(pool: &SqlitePool, issue_id: &str) -> Result<Vec<String>, SyncError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT other.issue_id
            FROM issue_project_items mine
            JOIN issue_project_items other ON other.project_item_id = mine.project_item_id
            WHERE mine.issue_id = ? AND other.issue_id <> mine.issue_id
            ORDER BY other.issue_id
            "#,
        )
        .bind(issue_id)
        .fetch_all(pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("issue_id")).collect())
    }
}

fn issue_from_row(row: &SqliteRow) -> Result<Issue, SyncError> {
    let kind: String = row.get("kind");
    let payload: String = row.get("payload");

    Ok(Issue {
        id: row.get("id"),
        number: row.get("number"),
        repository_id: row.get("repository_id"),
        author_id: row.get("author_id"),
        kind: ItemKind::from_str(&kind)
            .ok_or_else(|| SyncError::DatabaseError(format!("Unknown item kind: {}", kind)))?,
        title: row.get("title"),
        state: row.get("state"),
        url: row.get("url"),
        created_at: from_db_time(row.get("created_at"))?,
        updated_at: from_db_time(row.get("updated_at"))?,
        closed_at: opt_from_db_time(row.get("closed_at"))?,
        payload: serde_json::from_str(&payload)?,
        ownership_verified_at: opt_from_db_time(row.get("ownership_verified_at"))?,
    })
}

fn comment_from_row(row: &SqliteRow) -> Result<Comment, SyncError> {
    let issue_id: Option<String> = row.get("issue_id");
    let pull_request_id: Option<String> = row.get("pull_request_id");
    let payload: String = row.get("payload");

    let parent = match (issue_id, pull_request_id) {
        (Some(id), None) => ParentRef::Issue(id),
        (None, Some(id)) => ParentRef::PullRequest(id),
        _ => {
            return Err(SyncError::DatabaseError(
                "Comment must reference exactly one parent".to_string(),
            ))
        }
    };

    Ok(Comment {
        id: row.get("id"),
        parent,
        review_id: row.get("review_id"),
        author_id: row.get("author_id"),
        body: row.get("body"),
        url: row.get("url"),
        created_at: from_db_time(row.get("created_at"))?,
        updated_at: opt_from_db_time(row.get("updated_at"))?,
        payload: serde_json::from_str(&payload)?,
    })
}
