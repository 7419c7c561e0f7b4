//! Entry point for incremental and backfill syncs.
//!
//! One run at a time: both kinds go through the same [`SingleFlight`], so a
//! caller arriving mid-run receives that run's result. Collection holds the
//! realigner's gate, so it never overlaps a realignment pass. The run's
//! terminal status is written before the follow-up realignment, before
//! refresh hooks fire and before the result is returned.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::hooks::{RefreshHook, RefreshScope};
use super::scheduler::Scheduler;
use super::single_flight::SingleFlight;
use super::tracker::RunTracker;
use super::SyncSummary;
use crate::collector::{CollectSummary, Collector};
use crate::database::models::{Resource, RunType, SyncSettings, SyncStrategy};
use crate::database::sync_state::SyncState;
use crate::database::Database;
use crate::error::SyncError;
use crate::realign::{RealignOptions, RealignSummary, Realigner};

/// Longest accepted automatic sync interval: one week.
pub const MAX_SYNC_INTERVAL_MINUTES: i64 = 7 * 24 * 60;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub organization: String,
    /// Lookback for resources with neither a cursor nor a prior successful run;
    /// `None` collects full history.
    pub initial_lookback_days: Option<i64>,
}

struct RunPlan {
    run_type: RunType,
    strategy: SyncStrategy,
    since_by_resource: BTreeMap<Resource, DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
}

pub struct SyncOrchestrator {
    db: Database,
    collector: Collector,
    config: OrchestratorConfig,
    flight: SingleFlight<SyncSummary>,
    hooks: Vec<Arc<dyn RefreshHook>>,
    scheduler: Scheduler,
    gate: Arc<Mutex<()>>,
    follow_up: Option<(Arc<Realigner>, RealignOptions)>,
}

impl SyncOrchestrator {
    pub fn new(db: Database, collector: Collector, config: OrchestratorConfig) -> Self {
        Self {
            db,
            collector,
            config,
            flight: SingleFlight::new(),
            hooks: Vec::new(),
            scheduler: Scheduler::new(),
            gate: Arc::new(Mutex::new(())),
            follow_up: None,
        }
    }

    /// Serialize collection with `realigner`'s passes, and run one with
    /// `after_sync` options after every successful sync when given.
    #[must_use]
    pub fn with_realigner(mut self, realigner: Arc<Realigner>, after_sync: Option<RealignOptions>) -> Self {
        self.gate = realigner.gate();
        self.follow_up = after_sync.map(|options| (realigner, options));
        self
    }

    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn RefreshHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn organization(&self) -> &str {
        &self.config.organization
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn is_running(&self) -> bool {
        self.flight.is_running()
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduler.is_running()
    }

    pub async fn settings(&self) -> Result<Option<SyncSettings>, SyncError> {
        SyncState::get_settings(self.db.pool(), &self.config.organization).await
    }

    /// Collect everything updated since each resource's high-water mark.
    pub async fn run_incremental_sync(
        self: &Arc<Self>,
        run_type: RunType,
    ) -> Result<SyncSummary, SyncError> {
        let this = Arc::clone(self);
        self.flight
            .run(move || {
                async move {
                    let plan = RunPlan {
                        run_type,
                        strategy: SyncStrategy::Incremental,
                        since_by_resource: this.since_by_resource().await?,
                        until: None,
                    };
                    this.execute(plan).await
                }
                .boxed()
            })
            .await
    }

    /// Collect `[start, end)` for every resource; `end` defaults to now.
    pub async fn run_backfill(
        self: &Arc<Self>,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<SyncSummary, SyncError> {
        let end = end.unwrap_or_else(Utc::now);
        if start >= end {
            return Err(SyncError::ValidationError(format!(
                "Backfill start {} must be before end {}",
                start, end
            )));
        }

        let this = Arc::clone(self);
        self.flight
            .run(move || {
                async move {
                    let plan = RunPlan {
                        run_type: RunType::Backfill,
                        strategy: SyncStrategy::Backfill,
                        since_by_resource: Resource::ALL.into_iter().map(|r| (r, start)).collect(),
                        until: Some(end),
                    };
                    this.execute(plan).await
                }
                .boxed()
            })
            .await
    }

    /// Persist the schedule and start the periodic incremental sync task.
    pub async fn enable_automatic_sync(self: &Arc<Self>, interval_minutes: i64) -> Result<(), SyncError> {
        let period = interval_period(interval_minutes).ok_or_else(|| {
            SyncError::ValidationError(format!(
                "Sync interval must be between 1 and {} minutes, got {}",
                MAX_SYNC_INTERVAL_MINUTES, interval_minutes
            ))
        })?;

        SyncState::set_schedule(
            self.db.pool(),
            &self.config.organization,
            true,
            Some(interval_minutes),
        )
        .await?;

        self.scheduler.start(Arc::downgrade(self), period);
        info!(interval_minutes, "Automatic sync enabled");
        Ok(())
    }

    pub async fn disable_automatic_sync(&self) -> Result<(), SyncError> {
        SyncState::set_schedule(self.db.pool(), &self.config.organization, false, None).await?;
        self.scheduler.stop();
        info!("Automatic sync disabled");
        Ok(())
    }

    /// Restart the periodic task if the stored settings have it enabled.
    pub async fn restore_schedule(self: &Arc<Self>) -> Result<bool, SyncError> {
        let Some(settings) = self.settings().await? else {
            return Ok(false);
        };

        let period = settings.auto_sync_interval_minutes.and_then(interval_period);
        match (settings.auto_sync_enabled, period) {
            (true, Some(period)) => {
                self.scheduler.start(Arc::downgrade(self), period);
                info!(
                    interval_minutes = settings.auto_sync_interval_minutes,
                    "Restored automatic sync schedule"
                );
                Ok(true)
            }
            (true, _) => {
                warn!("Automatic sync enabled without a valid interval, not scheduling");
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    /// Per-resource lower bound: cursor, else last successful sync, else the initial lookback.
    async fn since_by_resource(&self) -> Result<BTreeMap<Resource, DateTime<Utc>>, SyncError> {
        let settings = self.settings().await?;
        let fallback = settings
            .and_then(|s| s.last_successful_at)
            .or_else(|| {
                self.config
                    .initial_lookback_days
                    .map(|days| Utc::now() - chrono::Duration::days(days))
            });

        let mut since = BTreeMap::new();
        for resource in Resource::ALL {
            let cursor = SyncState::get_cursor(self.db.pool(), resource).await?;
            if let Some(at) = cursor.and_then(|c| c.last_item_at).or(fallback) {
                since.insert(resource, at);
            }
        }
        Ok(since)
    }

    async fn execute(&self, plan: RunPlan) -> Result<SyncSummary, SyncError> {
        let org = self.config.organization.as_str();
        let tracker = RunTracker::start(
            self.db.clone(),
            plan.run_type,
            plan.strategy,
            plan.since_by_resource.values().min().copied(),
            plan.until,
        )
        .await?;
        SyncState::mark_started(self.db.pool(), org, tracker.run().started_at).await?;

        let outcome = {
            let _collecting = self.gate.lock().await;
            self.collect_and_advance(&plan, tracker.run_id()).await
        };

        match outcome {
            Ok((collected, successful_at)) => {
                let mut summary = SyncSummary {
                    run_id: tracker.run_id().to_string(),
                    run_type: plan.run_type,
                    strategy: plan.strategy,
                    since_by_resource: plan.since_by_resource,
                    until: plan.until,
                    repositories_processed: collected.repositories_processed,
                    counts: collected.counts.clone(),
                    latest_by_resource: collected.latest_by_resource.clone(),
                    last_successful_at: None,
                    realignment: None,
                };

                tracker
                    .succeed(&collected.counts, &serde_json::to_value(&summary)?)
                    .await?;
                SyncState::mark_completed(self.db.pool(), org, Utc::now(), successful_at).await?;

                summary.last_successful_at = self.settings().await?.and_then(|s| s.last_successful_at);
                summary.realignment = self.realign_after_sync().await;

                let scope = match &summary.realignment {
                    Some(realigned) if realigned.updated > 0 => RefreshScope::Full,
                    _ => RefreshScope::Targeted(collected.touched_issue_ids.into_iter().collect()),
                };
                self.notify(scope).await;
                Ok(summary)
            }
            Err(err) => {
                let message = err.to_string();
                if let Err(e) = tracker.fail(&message).await {
                    warn!(error = %e, "Failed to record run failure");
                }
                if let Err(e) = SyncState::mark_completed(self.db.pool(), org, Utc::now(), None).await {
                    warn!(error = %e, "Failed to stamp run completion");
                }

                self.notify(RefreshScope::Full).await;
                Err(err)
            }
        }
    }

    /// Collect, then advance cursors; returns what was collected and the
    /// organization marker the run earned.
    async fn collect_and_advance(
        &self,
        plan: &RunPlan,
        run_id: &str,
    ) -> Result<(CollectSummary, Option<DateTime<Utc>>), SyncError> {
        let collected = self
            .collector
            .collect(
                &self.config.organization,
                &plan.since_by_resource,
                plan.until,
                run_id,
            )
            .await?;

        let last_successful_at = self.settings().await?.and_then(|s| s.last_successful_at);
        let mut advanced = Vec::new();

        for (resource, latest) in &collected.latest_by_resource {
            let mut mark = *latest;
            let mut page_cursor = collected.cursor_by_resource.get(resource).map(String::as_str);

            if plan.strategy == SyncStrategy::Backfill {
                // A backfill only extends coverage that already reaches back to its start.
                let start = plan.since_by_resource.get(resource).copied();
                let covered_from = SyncState::get_cursor(self.db.pool(), *resource)
                    .await?
                    .and_then(|c| c.last_item_at)
                    .or(last_successful_at);
                let contiguous = match (covered_from, start) {
                    (Some(covered_from), Some(start)) => covered_from >= start,
                    _ => false,
                };
                if !contiguous {
                    debug!(resource = resource.as_str(), "Backfill does not reach existing coverage, cursor left as is");
                    continue;
                }
                // Comments created after `until` were not collected.
                if let Some(until) = plan.until.filter(|until| mark > *until) {
                    mark = until;
                    page_cursor = None;
                }
            }

            SyncState::advance_cursor(self.db.pool(), *resource, page_cursor, mark).await?;
            advanced.push(mark);
        }

        let backfill_is_contiguous = plan.strategy != SyncStrategy::Backfill
            || last_successful_at.is_some_and(|at| {
                plan.since_by_resource.values().all(|start| at >= *start)
            });

        // Never move past the slowest resource that advanced.
        let successful_at = advanced
            .into_iter()
            .min()
            .filter(|_| backfill_is_contiguous);
        Ok((collected, successful_at))
    }

    /// Follow-up realignment pass; its failure does not fail the sync.
    async fn realign_after_sync(&self) -> Option<RealignSummary> {
        let (realigner, options) = self.follow_up.as_ref()?;
        match realigner.realign(options).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(error = %e, "Realignment after sync failed");
                None
            }
        }
    }

    async fn notify(&self, scope: RefreshScope) {
        for hook in &self.hooks {
            if let Err(e) = hook.refresh(&scope).await {
                warn!(hook = hook.name(), error = %e, "Refresh hook failed");
            }
        }
    }
}

/// Scheduler period for `minutes`, if inside the accepted range.
fn interval_period(minutes: i64) -> Option<Duration> {
    if !(1..=MAX_SYNC_INTERVAL_MINUTES).contains(&minutes) {
        return None;
    }
    Some(Duration::from_secs(minutes as u64 * 60))
}
