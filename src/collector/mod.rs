//! Walks the organization graph and writes every entity it finds.
//!
//! Traversal is strictly sequential: organization repositories, then for each
//! repository its issues, discussions and pull requests, then each item's
//! children. Writes follow the same order so that owners and parents always
//! exist before the rows that reference them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::database::models::{Actor, ItemKind, ParentRef, Reaction, Repository, Resource, Review};
use crate::database::upsert::Upserts;
use crate::database::Database;
use crate::error::SyncError;
use crate::github::convert::{self, ConvertedComment};
use crate::github::queries;
use crate::github::retry::{request_with_retry, RateBudget, RetryPolicy};
use crate::github::types::{connection_at, decode, ReviewThreadNode};
use crate::github::GraphClient;

pub const DEFAULT_PAGE_SIZE: i64 = 50;

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Page size for repository and item connections.
    pub page_size: i64,
    /// Page size for nested connections (comments, reviews, timeline events).
    pub nested_page_size: i64,
    pub retry: RetryPolicy,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            nested_page_size: DEFAULT_PAGE_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityCounts {
    pub repositories: i64,
    pub issues: i64,
    pub discussions: i64,
    pub pull_requests: i64,
    pub reviews: i64,
    pub review_requests: i64,
    pub comments: i64,
    pub reactions: i64,
}

impl EntityCounts {
    /// Items written for `resource`, as recorded on its sync log.
    pub fn for_resource(&self, resource: Resource) -> i64 {
        match resource {
            Resource::Issues => self.issues,
            Resource::Discussions => self.discussions,
            Resource::PullRequests => self.pull_requests,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectSummary {
    pub repositories_processed: i64,
    pub counts: EntityCounts,
    /// Highest `updatedAt` written per resource; absent when nothing was written.
    pub latest_by_resource: BTreeMap<Resource, DateTime<Utc>>,
    /// `endCursor` of the page that yielded each resource's newest item.
    pub cursor_by_resource: BTreeMap<Resource, String>,
    /// Issues and discussions written during the walk.
    pub touched_issue_ids: BTreeSet<String>,
}

impl CollectSummary {
    fn observe(&mut self, resource: Resource, updated_at: DateTime<Utc>, page_cursor: Option<&str>) {
        let newer = self
            .latest_by_resource
            .get(&resource)
            .map_or(true, |latest| updated_at > *latest);
        if !newer {
            return;
        }

        self.latest_by_resource.insert(resource, updated_at);
        match page_cursor {
            Some(cursor) => {
                self.cursor_by_resource.insert(resource, cursor.to_string());
            }
            None => {
                self.cursor_by_resource.remove(&resource);
            }
        }
    }
}

/// True when `at` falls in the half-open window `[since, until)`.
pub fn in_window(at: DateTime<Utc>, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> bool {
    since.map_or(true, |since| at >= since) && until.map_or(true, |until| at < until)
}

pub struct Collector {
    db: Database,
    client: Arc<dyn GraphClient>,
    budget: RateBudget,
    config: CollectorConfig,
}

struct Window {
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
}

impl Collector {
    pub fn new(
        db: Database,
        client: Arc<dyn GraphClient>,
        budget: RateBudget,
        config: CollectorConfig,
    ) -> Self {
        Self {
            db,
            client,
            budget,
            config,
        }
    }

    /// Walk `org`, writing every entity updated at or after its resource's `since`.
    ///
    /// Resources missing from `since_by_resource` are collected from the start
    /// of history. Comments are kept only when created inside `[since, until)`.
    pub async fn collect(
        &self,
        org: &str,
        since_by_resource: &BTreeMap<Resource, DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        run_id: &str,
    ) -> Result<CollectSummary, SyncError> {
        let mut summary = CollectSummary::default();
        let mut after: Option<String> = None;

        info!(run_id, org, ?since_by_resource, ?until, "Starting collection");

        loop {
            let data = self
                .fetch(
                    queries::ORGANIZATION_REPOSITORIES,
                    json!({ "org": org, "first": self.config.page_size, "after": after }),
                )
                .await?;
            let repositories = connection_at(&data, "/organization/repositories")?
                .ok_or_else(|| SyncError::missing_field("organization"))?;

            for raw in repositories.nodes() {
                let repository = self.store_repository(raw, &mut summary).await?;
                debug!(run_id, repository = %repository.name_with_owner, "Collecting repository");

                for resource in Resource::ALL {
                    let window = Window {
                        since: since_by_resource.get(&resource).copied(),
                        until,
                    };
                    self.collect_resource(&repository, resource, &window, &mut summary)
                        .await?;
                }

                summary.repositories_processed += 1;
            }

            match repositories.next_cursor() {
                Some(cursor) => after = Some(cursor.to_string()),
                None => break,
            }
        }

        info!(
            run_id,
            repositories = summary.repositories_processed,
            counts = ?summary.counts,
            "Collection finished"
        );
        Ok(summary)
    }

    async fn fetch(&self, query: &str, variables: Value) -> Result<Value, SyncError> {
        let document = queries::document(query);
        let data = request_with_retry(
            self.client.as_ref(),
            &self.config.retry,
            &self.budget,
            &document,
            &variables,
        )
        .await?;
        Ok(data)
    }

    /// Every node of a nested connection on `node(id)`, starting after `after`.
    async fn fetch_all(
        &self,
        query: &str,
        id: &str,
        pointer: &str,
        mut after: Option<String>,
    ) -> Result<Vec<Value>, SyncError> {
        let mut nodes = Vec::new();

        loop {
            let data = self
                .fetch(
                    query,
                    json!({ "id": id, "first": self.config.nested_page_size, "after": after }),
                )
                .await?;
            let Some(connection) = connection_at(&data, pointer)? else {
                break;
            };
            nodes.extend(connection.nodes().cloned());

            match connection.next_cursor() {
                Some(cursor) => after = Some(cursor.to_string()),
                None => break,
            }
        }

        Ok(nodes)
    }

    async fn store_repository(
        &self,
        raw: &Value,
        summary: &mut CollectSummary,
    ) -> Result<Repository, SyncError> {
        let converted = convert::repository(raw)?;
        let mut conn = self.db.pool().acquire().await?;
        Upserts::upsert_actor(&mut conn, &converted.owner).await?;
        Upserts::upsert_repository(&mut conn, &converted.repository).await?;
        summary.counts.repositories += 1;
        Ok(converted.repository)
    }

    async fn collect_resource(
        &self,
        repository: &Repository,
        resource: Resource,
        window: &Window,
        summary: &mut CollectSummary,
    ) -> Result<(), SyncError> {
        let (owner, name) = repository
            .name_with_owner
            .split_once('/')
            .unwrap_or(("", repository.name.as_str()));
        let (query, pointer) = match resource {
            Resource::Issues => (queries::REPOSITORY_ISSUES, "/repository/issues"),
            Resource::Discussions => (queries::REPOSITORY_DISCUSSIONS, "/repository/discussions"),
            Resource::PullRequests => (queries::REPOSITORY_PULL_REQUESTS, "/repository/pullRequests"),
        };
        let mut after: Option<String> = None;

        loop {
            let mut variables = json!({
                "owner": owner,
                "name": name,
                "first": self.config.page_size,
                "after": after,
            });
            if resource == Resource::Issues {
                variables["since"] = window
                    .since
                    .map(|s| Value::String(s.to_rfc3339_opts(SecondsFormat::Secs, true)))
                    .unwrap_or(Value::Null);
            }

            let data = self.fetch(query, variables).await?;
            let Some(connection) = connection_at(&data, pointer)? else {
                warn!(repository = %repository.name_with_owner, resource = resource.as_str(), "Repository not reachable, skipping");
                return Ok(());
            };

            // Ordered by UPDATED_AT DESC: once an item predates `since`, later pages do too.
            let mut reached_since = false;
            let page_cursor = connection.page_info.end_cursor.as_deref();
            for raw in connection.nodes() {
                let stored = match resource {
                    Resource::Issues | Resource::Discussions => {
                        self.store_item(raw, repository, window, summary).await?
                    }
                    Resource::PullRequests => {
                        self.store_pull_request(raw, repository, window, summary).await?
                    }
                };
                match stored {
                    Some(updated_at) => summary.observe(resource, updated_at, page_cursor),
                    None => reached_since = true,
                }
            }

            match connection.next_cursor() {
                Some(cursor) if !reached_since => after = Some(cursor.to_string()),
                _ => break,
            }
        }

        Ok(())
    }

    /// Write an issue or discussion and its comments; `None` when it predates `since`.
    async fn store_item(
        &self,
        raw: &Value,
        repository: &Repository,
        window: &Window,
        summary: &mut CollectSummary,
    ) -> Result<Option<DateTime<Utc>>, SyncError> {
        let converted = convert::item(raw, &repository.id)?;
        let issue = &converted.issue;
        if window.since.is_some_and(|since| issue.updated_at < since) {
            return Ok(None);
        }

        {
            let mut conn = self.db.pool().acquire().await?;
            if let Some(author) = &converted.author {
                Upserts::upsert_actor(&mut conn, author).await?;
            }
            Upserts::upsert_issue(&mut conn, issue).await?;
            Upserts::set_issue_project_items(&mut conn, &issue.id, &converted.project_item_ids)
                .await?;
            summary.counts.reactions += self.store_reactions(&mut conn, &converted.reactions).await?;
        }

        match issue.kind {
            ItemKind::Issue => summary.counts.issues += 1,
            ItemKind::Discussion => summary.counts.discussions += 1,
        }
        summary.touched_issue_ids.insert(issue.id.clone());

        let comments = self
            .fetch_all(queries::NODE_COMMENTS, &issue.id, "/node/comments", None)
            .await?;
        self.store_comments(&comments, &ParentRef::Issue(issue.id.clone()), window, summary)
            .await?;

        Ok(Some(issue.updated_at))
    }

    async fn store_pull_request(
        &self,
        raw: &Value,
        repository: &Repository,
        window: &Window,
        summary: &mut CollectSummary,
    ) -> Result<Option<DateTime<Utc>>, SyncError> {
        let converted = convert::pull_request(raw, &repository.id)?;
        let pull_request = &converted.pull_request;
        if window.since.is_some_and(|since| pull_request.updated_at < since) {
            return Ok(None);
        }
        let pr_id = pull_request.id.as_str();

        {
            let mut conn = self.db.pool().acquire().await?;
            if let Some(author) = &converted.author {
                Upserts::upsert_actor(&mut conn, author).await?;
            }
            Upserts::upsert_pull_request(&mut conn, pull_request).await?;
            Upserts::link_pull_request_issues(&mut conn, pr_id, &converted.closing_issue_ids)
                .await?;
            summary.counts.reactions += self.store_reactions(&mut conn, &converted.reactions).await?;
        }
        summary.counts.pull_requests += 1;

        let parent = ParentRef::PullRequest(pr_id.to_string());

        let comments = self
            .fetch_all(queries::NODE_COMMENTS, pr_id, "/node/comments", None)
            .await?;
        self.store_comments(&comments, &parent, window, summary).await?;

        let reviews = self.store_reviews(pr_id, summary).await?;

        let events = self
            .fetch_all(
                queries::PULL_REQUEST_REVIEW_REQUESTS,
                pr_id,
                "/node/timelineItems",
                None,
            )
            .await?;
        let pending = convert::pending_review_requests(pr_id, &events, &reviews)?;
        {
            let mut conn = self.db.pool().acquire().await?;
            for (reviewer, _) in &pending {
                Upserts::upsert_actor(&mut conn, reviewer).await?;
            }
            let requests: Vec<_> = pending.into_iter().map(|(_, request)| request).collect();
            Upserts::replace_review_requests(&mut conn, pr_id, &requests).await?;
            summary.counts.review_requests += requests.len() as i64;
        }

        let threads = self
            .fetch_all(
                queries::PULL_REQUEST_REVIEW_THREADS,
                pr_id,
                "/node/reviewThreads",
                None,
            )
            .await?;
        for raw_thread in &threads {
            let thread: ReviewThreadNode = decode(raw_thread, "review thread")?;
            let mut comments: Vec<Value> = thread.comments.nodes().cloned().collect();
            if let Some(cursor) = thread.comments.next_cursor() {
                comments.extend(
                    self.fetch_all(
                        queries::REVIEW_THREAD_COMMENTS,
                        &thread.id,
                        "/node/comments",
                        Some(cursor.to_string()),
                    )
                    .await?,
                );
            }
            self.store_comments(&comments, &parent, window, summary).await?;
        }

        Ok(Some(pull_request.updated_at))
    }

    async fn store_reviews(
        &self,
        pr_id: &str,
        summary: &mut CollectSummary,
    ) -> Result<Vec<Review>, SyncError> {
        let nodes = self
            .fetch_all(queries::PULL_REQUEST_REVIEWS, pr_id, "/node/reviews", None)
            .await?;

        let mut reviews = Vec::with_capacity(nodes.len());
        let mut conn = self.db.pool().acquire().await?;
        for raw in &nodes {
            let (author, review) = convert::review(raw, pr_id)?;
            if let Some(author) = &author {
                Upserts::upsert_actor(&mut conn, author).await?;
            }
            Upserts::upsert_review(&mut conn, &review).await?;
            summary.counts.reviews += 1;
            reviews.push(review);
        }

        Ok(reviews)
    }

    async fn store_comments(
        &self,
        nodes: &[Value],
        parent: &ParentRef,
        window: &Window,
        summary: &mut CollectSummary,
    ) -> Result<(), SyncError> {
        let mut conn = self.db.pool().acquire().await?;

        for raw in nodes {
            let ConvertedComment {
                author,
                comment,
                reactions,
            } = convert::comment(raw, parent)?;
            if !in_window(comment.created_at, window.since, window.until) {
                continue;
            }

            if let Some(author) = &author {
                Upserts::upsert_actor(&mut conn, author).await?;
            }
            Upserts::upsert_comment(&mut conn, &comment).await?;
            summary.counts.comments += 1;
            summary.counts.reactions += self.store_reactions(&mut conn, &reactions).await?;
        }

        Ok(())
    }

    async fn store_reactions(
        &self,
        conn: &mut sqlx::SqliteConnection,
        reactions: &[(Option<Actor>, Reaction)],
    ) -> Result<i64, SyncError> {
        for (user, reaction) in reactions {
            if let Some(user) = user {
                Upserts::upsert_actor(conn, user).await?;
            }
            Upserts::upsert_reaction(conn, reaction).await?;
        }
        Ok(reactions.len() as i64)
    }
}
