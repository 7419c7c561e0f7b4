use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{error, info};

use crate::collector::EntityCounts;
use crate::database::models::{Resource, RunStatus, RunType, SyncRun, SyncStrategy};
use crate::database::sync_state::SyncState;
use crate::database::Database;
use crate::error::SyncError;

/// Owns the run row and per-resource log rows of one sync invocation.
pub struct RunTracker {
    db: Database,
    run: SyncRun,
    logs: BTreeMap<Resource, i64>,
}

impl RunTracker {
    /// Insert a `running` run with one `running` log per resource.
    pub async fn start(
        db: Database,
        run_type: RunType,
        strategy: SyncStrategy,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Self, SyncError> {
        let run = SyncState::create_run(db.pool(), run_type, strategy, since, until).await?;

        let mut logs = BTreeMap::new();
        for resource in Resource::ALL {
            let log_id = SyncState::create_log(db.pool(), &run.id, resource).await?;
            logs.insert(resource, log_id);
        }

        info!(
            run_id = %run.id,
            run_type = run_type.as_str(),
            strategy = strategy.as_str(),
            "Sync run started"
        );
        Ok(Self { db, run, logs })
    }

    pub fn run(&self) -> &SyncRun {
        &self.run
    }

    pub fn run_id(&self) -> &str {
        &self.run.id
    }

    pub async fn succeed(self, counts: &EntityCounts, summary: &Value) -> Result<(), SyncError> {
        for (resource, log_id) in &self.logs {
            SyncState::finish_log(
                self.db.pool(),
                *log_id,
                RunStatus::Success,
                counts.for_resource(*resource),
                None,
            )
            .await?;
        }
        SyncState::finish_run(self.db.pool(), &self.run.id, RunStatus::Success, None, Some(summary))
            .await?;

        info!(run_id = %self.run.id, "Sync run succeeded");
        Ok(())
    }

    pub async fn fail(self, message: &str) -> Result<(), SyncError> {
        for log_id in self.logs.values() {
            SyncState::finish_log(self.db.pool(), *log_id, RunStatus::Failed, 0, Some(message))
                .await?;
        }
        SyncState::finish_run(self.db.pool(), &self.run.id, RunStatus::Failed, Some(message), None)
            .await?;

        error!(run_id = %self.run.id, error = message, "Sync run failed");
        Ok(())
    }
}
