//! Repository realignment: re-check stored issues and discussions against the
//! remote and repair stale ownership or identity.
//!
//! Candidates are resolved one at a time, in chunks gated by the rate budget.
//! A candidate that cannot be resolved is skipped; only transport failures
//! abort the pass. Passes are single-flight and hold the engine's write gate,
//! so they never overlap each other or a sync's collection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::database::identity::migrate_issue_identity;
use crate::database::models::{ItemKind, RealignCandidate};
use crate::database::queries::Queries;
use crate::database::upsert::Upserts;
use crate::database::Database;
use crate::error::SyncError;
use crate::github::convert::{self, ItemUrl};
use crate::github::queries;
use crate::github::retry::{request_with_retry, RateBudget, RetryPolicy};
use crate::github::{GraphClient, GraphError};
use crate::sync::SingleFlight;

pub const DEFAULT_FRESHNESS_DAYS: i64 = 7;
pub const DEFAULT_RATE_LIMIT_FLOOR: i64 = 100;
pub const DEFAULT_MAX_REDIRECT_HOPS: usize = 5;

#[derive(Debug, Clone)]
pub struct RealignConfig {
    /// Verified candidates older than this are re-checked.
    pub freshness: chrono::Duration,
    /// Remaining-request level below which a chunk waits or the pass halts.
    pub rate_limit_floor: i64,
    pub max_redirect_hops: usize,
    pub retry: RetryPolicy,
}

impl Default for RealignConfig {
    fn default() -> Self {
        Self {
            freshness: chrono::Duration::days(DEFAULT_FRESHNESS_DAYS),
            rate_limit_floor: DEFAULT_RATE_LIMIT_FLOOR,
            max_redirect_hops: DEFAULT_MAX_REDIRECT_HOPS,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealignOptions {
    pub limit: i64,
    pub chunk_size: usize,
    pub dry_run: bool,
    pub wait_for_rate_limit: bool,
}

impl Default for RealignOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            chunk_size: 25,
            dry_run: false,
            wait_for_rate_limit: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RealignSummary {
    pub candidates: usize,
    pub checked: usize,
    /// Candidates whose repository, URL or id changed (including migrations).
    pub updated: usize,
    /// Candidates whose node id changed.
    pub migrated: usize,
    pub skipped: usize,
    pub halted_early: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Unchanged,
    Updated,
    Migrated,
    Skipped,
}

pub struct Realigner {
    db: Database,
    client: Arc<dyn GraphClient>,
    budget: RateBudget,
    config: RealignConfig,
    flight: SingleFlight<RealignSummary>,
    gate: Arc<Mutex<()>>,
}

impl Realigner {
    pub fn new(
        db: Database,
        client: Arc<dyn GraphClient>,
        budget: RateBudget,
        config: RealignConfig,
    ) -> Self {
        Self {
            db,
            client,
            budget,
            config,
            flight: SingleFlight::new(),
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Lock held for the duration of a pass; syncs hold it while collecting.
    pub fn gate(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.gate)
    }

    pub fn is_running(&self) -> bool {
        self.flight.is_running()
    }

    /// Run a realignment pass, or join the one already in flight.
    ///
    /// A caller that joins receives the in-flight pass's summary, which was
    /// produced with that pass's options rather than its own.
    pub async fn realign(self: &Arc<Self>, options: &RealignOptions) -> Result<RealignSummary, SyncError> {
        let this = Arc::clone(self);
        let options = options.clone();
        self.flight
            .run(move || {
                async move {
                    let _pass = this.gate.lock().await;
                    this.realign_pass(&options).await
                }
                .boxed()
            })
            .await
    }

    async fn realign_pass(&self, options: &RealignOptions) -> Result<RealignSummary, SyncError> {
        let cutoff = Utc::now() - self.config.freshness;
        let candidates =
            Queries::realignment_candidates(self.db.pool(), cutoff, options.limit.max(0)).await?;

        let mut summary = RealignSummary {
            candidates: candidates.len(),
            dry_run: options.dry_run,
            ..Default::default()
        };
        info!(candidates = summary.candidates, dry_run = options.dry_run, "Starting realignment");

        'chunks: for chunk in candidates.chunks(options.chunk_size.max(1)) {
            if !self.wait_for_budget(options).await {
                summary.halted_early = true;
                break;
            }

            let mut verified = Vec::with_capacity(chunk.len());
            for candidate in chunk {
                let (outcome, holder) = match self.realign_candidate(candidate, options.dry_run).await {
                    Ok(resolved) => resolved,
                    Err(e) if e.is_rate_limited() => {
                        warn!(candidate = %candidate.id, error = %e, "Rate limit exhausted, halting realignment");
                        summary.halted_early = true;
                        self.stamp(&verified, options.dry_run).await?;
                        break 'chunks;
                    }
                    Err(SyncError::RemoteError(e)) if e.is_transport() => {
                        return Err(SyncError::RemoteError(e));
                    }
                    Err(e) => {
                        warn!(candidate = %candidate.id, error = %e, "Candidate could not be realigned");
                        (Outcome::Skipped, None)
                    }
                };

                summary.checked += 1;
                match outcome {
                    Outcome::Unchanged => {}
                    Outcome::Updated => summary.updated += 1,
                    Outcome::Migrated => {
                        summary.updated += 1;
                        summary.migrated += 1;
                    }
                    Outcome::Skipped => summary.skipped += 1,
                }
                verified.push(holder.unwrap_or_else(|| candidate.id.clone()));
            }

            self.stamp(&verified, options.dry_run).await?;
        }

        info!(?summary, "Realignment finished");
        Ok(summary)
    }

    /// Wait out a low budget when allowed; false means the pass must halt.
    async fn wait_for_budget(&self, options: &RealignOptions) -> bool {
        let Some(wait) = self
            .budget
            .wait_below(self.config.rate_limit_floor, Utc::now())
        else {
            return true;
        };

        if !options.wait_for_rate_limit || wait > self.config.retry.max_wait {
            warn!(?wait, "Rate budget below floor, halting realignment");
            return false;
        }

        info!(?wait, "Rate budget below floor, waiting for reset");
        if wait > Duration::ZERO {
            tokio::time::sleep(wait).await;
        }
        self.budget.mark_waited();
        true
    }

    async fn stamp(&self, ids: &[String], dry_run: bool) -> Result<(), SyncError> {
        if dry_run || ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.db.pool().acquire().await?;
        Upserts::stamp_ownership_verified(&mut conn, ids, Utc::now()).await?;
        Ok(())
    }

    /// Resolve one candidate and repair it; returns the outcome and the id now holding its data.
    async fn realign_candidate(
        &self,
        candidate: &RealignCandidate,
        dry_run: bool,
    ) -> Result<(Outcome, Option<String>), SyncError> {
        let Some(node) = self.resolve(candidate).await? else {
            warn!(candidate = %candidate.id, url = %candidate.url, "Candidate did not resolve");
            return Ok((Outcome::Skipped, None));
        };

        let typename = node.get("__typename").and_then(Value::as_str).unwrap_or_default();
        if ItemKind::from_typename(typename).is_none() {
            warn!(candidate = %candidate.id, typename, "Resolved to unsupported type, skipping");
            return Ok((Outcome::Skipped, None));
        }
        let Some(raw_repository) = node.get("repository").filter(|r| !r.is_null()) else {
            warn!(candidate = %candidate.id, "Resolved node has no repository, skipping");
            return Ok((Outcome::Skipped, None));
        };

        let repository = convert::repository(raw_repository)?;
        let item = convert::item(&node, &repository.repository.id)?;
        let resolved_id = item.issue.id.clone();

        let outcome = if resolved_id != candidate.id {
            Outcome::Migrated
        } else if item.issue.repository_id != candidate.repository_id || item.issue.url != candidate.url {
            Outcome::Updated
        } else {
            Outcome::Unchanged
        };

        debug!(
            candidate = %candidate.id,
            resolved = %resolved_id,
            repository = %repository.repository.name_with_owner,
            ?outcome,
            "Candidate resolved"
        );

        if dry_run {
            return Ok((outcome, Some(resolved_id)));
        }

        let mut conn = self.db.pool().acquire().await?;
        if outcome == Outcome::Migrated {
            migrate_issue_identity(&mut conn, &candidate.id, &resolved_id).await?;
        }

        Upserts::upsert_actor(&mut conn, &repository.owner).await?;
        Upserts::upsert_repository(&mut conn, &repository.repository).await?;
        if let Some(author) = &item.author {
            Upserts::upsert_actor(&mut conn, author).await?;
        }
        Upserts::upsert_issue(&mut conn, &item.issue).await?;
        if !item.project_item_ids.is_empty() {
            Upserts::set_issue_project_items(&mut conn, &resolved_id, &item.project_item_ids).await?;
        }

        Ok((outcome, Some(resolved_id)))
    }

    /// Re-query by id, then by redirected URL, then through a project-item sibling.
    async fn resolve(&self, candidate: &RealignCandidate) -> Result<Option<Value>, SyncError> {
        if let Some(node) = self.node_by_id(&candidate.id).await? {
            return Ok(Some(node));
        }

        match self
            .client
            .resolve_redirects(&candidate.url, self.config.max_redirect_hops)
            .await
        {
            Ok(resolved) if ItemUrl::parse(&resolved).is_some() => {
                debug!(candidate = %candidate.id, %resolved, "Re-querying by resolved url");
                if let Some(node) = self.node_by_url(&resolved).await? {
                    return Ok(Some(node));
                }
            }
            Ok(resolved) => {
                debug!(candidate = %candidate.id, %resolved, "Redirect left item urls");
            }
            Err(e) if e.is_transport() => return Err(e.into()),
            Err(e) => {
                debug!(candidate = %candidate.id, error = %e, "Redirect resolution failed");
            }
        }

        for sibling in Queries::project_item_siblings(self.db.pool(), &candidate.id).await? {
            if let Some(node) = self.node_by_id(&sibling).await? {
                debug!(candidate = %candidate.id, %sibling, "Resolved through project item sibling");
                return Ok(Some(node));
            }
        }

        Ok(None)
    }

    async fn node_by_id(&self, id: &str) -> Result<Option<Value>, SyncError> {
        self.lookup(queries::ITEM_BY_ID, json!({ "id": id }), "node").await
    }

    async fn node_by_url(&self, url: &str) -> Result<Option<Value>, SyncError> {
        self.lookup(queries::ITEM_BY_URL, json!({ "url": url }), "resource").await
    }

    async fn lookup(&self, query: &str, variables: Value, field: &str) -> Result<Option<Value>, SyncError> {
        let document = queries::document(query);
        match request_with_retry(
            self.client.as_ref(),
            &self.config.retry,
            &self.budget,
            &document,
            &variables,
        )
        .await
        {
            Ok(mut data) => Ok(data
                .get_mut(field)
                .map(Value::take)
                .filter(|node| !node.is_null())),
            // A query-level failure only means this route did not resolve.
            Err(GraphError::Query(messages)) => {
                debug!(?messages, "Lookup returned errors");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
