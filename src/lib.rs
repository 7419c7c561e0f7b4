pub mod api;
pub mod collector;
pub mod config;
pub mod database;
pub mod error;
pub mod github;
pub mod realign;
pub mod sync;

use std::sync::Arc;

pub use error::SyncError;

use crate::collector::Collector;
use crate::config::AppConfig;
use crate::database::Database;
use crate::github::{GraphClient, RateBudget};
use crate::realign::Realigner;
use crate::sync::{SnapshotRefresher, SyncOrchestrator};

/// Wire the orchestrator and realigner over one client, one shared rate budget
/// and one write gate.
pub fn build_engine(
    config: &AppConfig,
    db: Database,
    client: Arc<dyn GraphClient>,
) -> (Arc<SyncOrchestrator>, Arc<Realigner>) {
    let budget = RateBudget::new();

    let collector = Collector::new(
        db.clone(),
        client.clone(),
        budget.clone(),
        config.collector_config(),
    );
    let realigner = Arc::new(Realigner::new(
        db.clone(),
        client,
        budget,
        config.realign_config(),
    ));
    let orchestrator = SyncOrchestrator::new(db.clone(), collector, config.orchestrator_config())
        .with_realigner(realigner.clone(), config.realign_after_sync())
        .with_hook(Arc::new(SnapshotRefresher::new(db)));

    (Arc::new(orchestrator), realigner)
}
