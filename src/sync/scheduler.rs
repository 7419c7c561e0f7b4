use std::sync::{Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

use super::orchestrator::SyncOrchestrator;
use crate::database::models::RunType;

/// Owns the periodic automatic-sync task.
#[derive(Default)]
pub struct Scheduler {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any running task with one that syncs every `period`, first tick after one period.
    pub fn start(&self, orchestrator: Weak<SyncOrchestrator>, period: Duration) {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };

                match orchestrator.run_incremental_sync(RunType::Automatic).await {
                    Ok(summary) => info!(run_id = %summary.run_id, "Automatic sync finished"),
                    Err(e) => error!(error = %e, "Automatic sync failed"),
                }
            }
        });

        if let Some(previous) = self.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Abort the task; returns whether one was running.
    pub fn stop(&self) -> bool {
        match self.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
