pub mod hooks;
pub mod orchestrator;
pub mod scheduler;
pub mod single_flight;
pub mod tracker;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::collector::EntityCounts;
use crate::database::models::{Resource, RunType, SyncStrategy};
use crate::realign::RealignSummary;

pub use hooks::{RefreshHook, RefreshScope, SnapshotRefresher};
pub use orchestrator::{OrchestratorConfig, SyncOrchestrator, MAX_SYNC_INTERVAL_MINUTES};
pub use single_flight::SingleFlight;

/// Result of one completed sync run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub run_id: String,
    pub run_type: RunType,
    pub strategy: SyncStrategy,
    pub since_by_resource: BTreeMap<Resource, DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub repositories_processed: i64,
    pub counts: EntityCounts,
    pub latest_by_resource: BTreeMap<Resource, DateTime<Utc>>,
    /// Organization marker after the run; unchanged when no resource advanced.
    pub last_successful_at: Option<DateTime<Utc>>,
    /// Pass that followed the sync, when enabled and it did not fail.
    pub realignment: Option<RealignSummary>,
}
