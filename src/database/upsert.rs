//! Idempotent writes keyed by remote node id.
//!
//! Every upsert overwrites the normalized columns and payload with the latest
//! remote view. Columns that only the engine owns (`ownership_verified_at`,
//! `kind`) survive re-ingestion.

use chrono::{DateTime, Utc};
use sqlx::{Connection, Row, SqliteConnection};
use tracing::debug;

use super::models::*;
use super::{opt_db_time, to_db_time};
use crate::error::SyncError;

pub struct Upserts;

impl Upserts {
    pub async fn upsert_actor(conn: &mut SqliteConnection, actor: &Actor) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO actors (id, login, name, avatar_url, created_at, updated_at, payload, synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                login = excluded.login,
                name = excluded.name,
                avatar_url = excluded.avatar_url,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                payload = excluded.payload,
                synced_at = excluded.synced_at
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.login)
        .bind(&actor.name)
        .bind(&actor.avatar_url)
        .bind(opt_db_time(actor.created_at))
        .bind(opt_db_time(actor.updated_at))
        .bind(actor.payload.to_string())
        .bind(to_db_time(Utc::now()))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn upsert_repository(
        conn: &mut SqliteConnection,
        repository: &Repository,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO repositories (id, name, name_with_owner, owner_id, visibility, is_archived,
                                      url, created_at, updated_at, payload, synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                name_with_owner = excluded.name_with_owner,
                owner_id = excluded.owner_id,
                visibility = excluded.visibility,
                is_archived = excluded.is_archived,
                url = excluded.url,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                payload = excluded.payload,
                synced_at = excluded.synced_at
            "#,
        )
        .bind(&repository.id)
        .bind(&repository.name)
        .bind(&repository.name_with_owner)
        .bind(&repository.owner_id)
        .bind(&repository.visibility)
        .bind(repository.is_archived)
        .bind(&repository.url)
        .bind(opt_db_time(repository.created_at))
        .bind(opt_db_time(repository.updated_at))
        .bind(repository.payload.to_string())
        .bind(to_db_time(Utc::now()))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Upsert an issue or discussion, appending to its status history when the state changes.
    pub async fn upsert_issue(conn: &mut SqliteConnection, issue: &Issue) -> Result<(), SyncError> {
        let previous: Option<String> = sqlx::query("SELECT state FROM issues WHERE id = ?")
            .bind(&issue.id)
            .fetch_optional(&mut *conn)
            .await?
            .map(|row| row.get("state"));

        sqlx::query(
            r#"
            INSERT INTO issues (id, number, repository_id, author_id, kind, title, state, url,
                                created_at, updated_at, closed_at, payload, ownership_verified_at, synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                number = excluded.number,
                repository_id = excluded.repository_id,
                author_id = excluded.author_id,
                title = excluded.title,
                state = excluded.state,
                url = excluded.url,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                closed_at = excluded.closed_at,
                payload = excluded.payload,
                ownership_verified_at = COALESCE(excluded.ownership_verified_at, issues.ownership_verified_at),
                synced_at = excluded.synced_at
            "#,
        )
        .bind(&issue.id)
        .bind(issue.number)
        .bind(&issue.repository_id)
        .bind(&issue.author_id)
        .bind(issue.kind.as_str())
        .bind(&issue.title)
        .bind(&issue.state)
        .bind(&issue.url)
        .bind(to_db_time(issue.created_at))
        .bind(to_db_time(issue.updated_at))
        .bind(opt_db_time(issue.closed_at))
        .bind(issue.payload.to_string())
        .bind(opt_db_time(issue.ownership_verified_at))
        .bind(to_db_time(Utc::now()))
        .execute(&mut *conn)
        .await?;

        if previous.as_deref() != Some(issue.state.as_str()) {
            debug!(issue_id = %issue.id, from = ?previous, to = %issue.state, "Issue state changed");
            sqlx::query(
                "INSERT INTO issue_status_history (issue_id, state, changed_at) VALUES (?, ?, ?)",
            )
            .bind(&issue.id)
            .bind(&issue.state)
            .bind(to_db_time(issue.closed_at.unwrap_or(issue.updated_at)))
            .execute(&mut *conn)
            .await?;
        }

        Ok(())
    }

    pub async fn upsert_pull_request(
        conn: &mut SqliteConnection,
        pull_request: &PullRequest,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO pull_requests (id, number, repository_id, author_id, title, state, merged, url,
                                       created_at, updated_at, closed_at, merged_at, payload, synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                number = excluded.number,
                repository_id = excluded.repository_id,
                author_id = excluded.author_id,
                title = excluded.title,
                state = excluded.state,
                merged = excluded.merged,
                url = excluded.url,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                closed_at = excluded.closed_at,
                merged_at = excluded.merged_at,
                payload = excluded.payload,
                synced_at = excluded.synced_at
            "#,
        )
        .bind(&pull_request.id)
        .bind(pull_request.number)
        .bind(&pull_request.repository_id)
        .bind(&pull_request.author_id)
        .bind(&pull_request.title)
        .bind(&pull_request.state)
        .bind(pull_request.merged)
        .bind(&pull_request.url)
        .bind(to_db_time(pull_request.created_at))
        .bind(to_db_time(pull_request.updated_at))
        .bind(opt_db_time(pull_request.closed_at))
        .bind(opt_db_time(pull_request.merged_at))
        .bind(pull_request.payload.to_string())
        .bind(to_db_time(Utc::now()))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn upsert_review(conn: &mut SqliteConnection, review: &Review) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO reviews (id, pull_request_id, author_id, state, body, submitted_at, payload, synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                pull_request_id = excluded.pull_request_id,
                author_id = excluded.author_id,
                state = excluded.state,
                body = excluded.body,
                submitted_at = excluded.submitted_at,
                payload = excluded.payload,
                synced_at = excluded.synced_at
            "#,
        )
        .bind(&review.id)
        .bind(&review.pull_request_id)
        .bind(&review.author_id)
        .bind(&review.state)
        .bind(&review.body)
        .bind(opt_db_time(review.submitted_at))
        .bind(review.payload.to_string())
        .bind(to_db_time(Utc::now()))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Replace the pending reviewer set of a pull request in one transaction.
    pub async fn replace_review_requests(
        conn: &mut SqliteConnection,
        pull_request_id: &str,
        requests: &[ReviewRequest],
    ) -> Result<(), SyncError> {
        let mut tx = conn.begin().await?;

        sqlx::query("DELETE FROM review_requests WHERE pull_request_id = ?")
            .bind(pull_request_id)
            .execute(&mut *tx)
            .await?;

        for request in requests {
            sqlx::query(
                r#"
                INSERT INTO review_requests (pull_request_id, reviewer_id, requested_at)
                VALUES (?, ?, ?)
                ON CONFLICT(pull_request_id, reviewer_id) DO UPDATE SET
                    requested_at = excluded.requested_at
                "#,
            )
            .bind(pull_request_id)
            .bind(&request.reviewer_id)
            .bind(to_db_time(request.requested_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_comment(conn: &mut SqliteConnection, comment: &Comment) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO comments (id, issue_id, pull_request_id, review_id, author_id, body, url,
                                  created_at, updated_at, payload, synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                issue_id = excluded.issue_id,
                pull_request_id = excluded.pull_request_id,
                review_id = excluded.review_id,
                author_id = excluded.author_id,
                body = excluded.body,
                url = excluded.url,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                payload = excluded.payload,
                synced_at = excluded.synced_at
            "#,
        )
        .bind(&comment.id)
        .bind(comment.parent.issue_id())
        .bind(comment.parent.pull_request_id())
        .bind(&comment.review_id)
        .bind(&comment.author_id)
        .bind(&comment.body)
        .bind(&comment.url)
        .bind(to_db_time(comment.created_at))
        .bind(opt_db_time(comment.updated_at))
        .bind(comment.payload.to_string())
        .bind(to_db_time(Utc::now()))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn upsert_reaction(conn: &mut SqliteConnection, reaction: &Reaction) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO reactions (id, issue_id, pull_request_id, comment_id, actor_id, content, created_at, synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                issue_id = excluded.issue_id,
                pull_request_id = excluded.pull_request_id,
                comment_id = excluded.comment_id,
                actor_id = excluded.actor_id,
                content = excluded.content,
                created_at = excluded.created_at,
                synced_at = excluded.synced_at
            "#,
        )
        .bind(&reaction.id)
        .bind(reaction.parent.issue_id())
        .bind(reaction.parent.pull_request_id())
        .bind(&reaction.comment_id)
        .bind(&reaction.actor_id)
        .bind(&reaction.content)
        .bind(to_db_time(reaction.created_at))
        .bind(to_db_time(Utc::now()))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Replace the project-board item ids linked to an issue.
    pub async fn set_issue_project_items(
        conn: &mut SqliteConnection,
        issue_id: &str,
        project_item_ids: &[String],
    ) -> Result<(), SyncError> {
        let mut tx = conn.begin().await?;

        sqlx::query("DELETE FROM issue_project_items WHERE issue_id = ?")
            .bind(issue_id)
            .execute(&mut *tx)
            .await?;

        for item_id in project_item_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO issue_project_items (issue_id, project_item_id) VALUES (?, ?)",
            )
            .bind(issue_id)
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Replace the issues a pull request closes.
    pub async fn link_pull_request_issues(
        conn: &mut SqliteConnection,
        pull_request_id: &str,
        issue_ids: &[String],
    ) -> Result<(), SyncError> {
        let mut tx = conn.begin().await?;

        sqlx::query("DELETE FROM pull_request_issue_links WHERE pull_request_id = ?")
            .bind(pull_request_id)
            .execute(&mut *tx)
            .await?;

        for issue_id in issue_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO pull_request_issue_links (pull_request_id, issue_id) VALUES (?, ?)",
            )
            .bind(pull_request_id)
            .bind(issue_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn set_project_override(
        conn: &mut SqliteConnection,
        value: &ProjectOverride,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO project_overrides (issue_id, status, priority, target_date, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(issue_id) DO UPDATE SET
                status = excluded.status,
                priority = excluded.priority,
                target_date = excluded.target_date,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&value.issue_id)
        .bind(&value.status)
        .bind(&value.priority)
        .bind(&value.target_date)
        .bind(to_db_time(value.updated_at))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn stamp_ownership_verified(
        conn: &mut SqliteConnection,
        issue_ids: &[String],
        at: DateTime<Utc>,
    ) -> Result<u64, SyncError> {
        let at = to_db_time(at);
        let mut stamped = 0;
        for id in issue_ids {
            stamped += sqlx::query("UPDATE issues SET ownership_verified_at = ? WHERE id = ?")
                .bind(&at)
                .bind(id)
                .execute(&mut *conn)
                .await?
                .rows_affected();
        }
        Ok(stamped)
    }

    /// Recompute derived issue snapshots, for the given ids or for every issue.
    pub async fn refresh_issue_snapshots(
        conn: &mut SqliteConnection,
        issue_ids: Option<&[String]>,
    ) -> Result<u64, SyncError> {
        const SNAPSHOT_SQL: &str = r#"
            INSERT INTO issue_snapshots (issue_id, comment_count, reaction_count, last_activity_at, refreshed_at)
            SELECT i.id,
                   (SELECT COUNT(*) FROM comments c WHERE c.issue_id = i.id),
                   (SELECT COUNT(*) FROM reactions r WHERE r.issue_id = i.id),
                   MAX(i.updated_at, COALESCE((SELECT MAX(c.created_at) FROM comments c WHERE c.issue_id = i.id), i.updated_at)),
                   ?1
            FROM issues i
            WHERE ?2 IS NULL OR i.id = ?2
            ON CONFLICT(issue_id) DO UPDATE SET
                comment_count = excluded.comment_count,
                reaction_count = excluded.reaction_count,
                last_activity_at = excluded.last_activity_at,
                refreshed_at = excluded.refreshed_at
        "#;

        let now = to_db_time(Utc::now());
        let mut tx = conn.begin().await?;
        let mut refreshed = 0;

        match issue_ids {
            Some(ids) => {
                for id in ids {
                    refreshed += sqlx::query(SNAPSHOT_SQL)
                        .bind(&now)
                        .bind(Some(id.as_str()))
                        .execute(&mut *tx)
                        .await?
                        .rows_affected();
                }
            }
            None => {
                refreshed = sqlx::query(SNAPSHOT_SQL)
                    .bind(&now)
                    .bind(None::<&str>)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            }
        }

        tx.commit().await?;
        Ok(refreshed)
    }
}
