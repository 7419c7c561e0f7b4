//! Downstream refresh notifications sent after a run reaches a terminal state.

use async_trait::async_trait;
use tracing::debug;

use crate::database::upsert::Upserts;
use crate::database::Database;
use crate::error::SyncError;

/// Which issues a refresh should cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshScope {
    /// Only these issue ids changed.
    Targeted(Vec<String>),
    /// The change set is unknown; recompute everything.
    Full,
}

#[async_trait]
pub trait RefreshHook: Send + Sync {
    fn name(&self) -> &str;

    async fn refresh(&self, scope: &RefreshScope) -> Result<(), SyncError>;
}

/// Recomputes the `issue_snapshots` cache.
pub struct SnapshotRefresher {
    db: Database,
}

impl SnapshotRefresher {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RefreshHook for SnapshotRefresher {
    fn name(&self) -> &str {
        "issue_snapshots"
    }

    async fn refresh(&self, scope: &RefreshScope) -> Result<(), SyncError> {
        let mut conn = self.db.pool().acquire().await?;
        let refreshed = match scope {
            RefreshScope::Targeted(ids) if ids.is_empty() => 0,
            RefreshScope::Targeted(ids) => {
                Upserts::refresh_issue_snapshots(&mut conn, Some(ids.as_slice())).await?
            }
            RefreshScope::Full => Upserts::refresh_issue_snapshots(&mut conn, None).await?,
        };
        debug!(refreshed, "Issue snapshots refreshed");
        Ok(())
    }
}
