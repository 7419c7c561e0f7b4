//! Process-local single-flight coordination.
//!
//! At most one operation runs at a time. Callers arriving while it is in
//! flight join it and receive a clone of its result instead of starting a
//! second one.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::error::SyncError;

type SharedRun<T> = Shared<BoxFuture<'static, Result<T, SyncError>>>;

struct Slot<T>
where
    T: Clone + Send + Sync + 'static,
{
    next_generation: u64,
    in_flight: Option<(u64, SharedRun<T>)>,
}

pub struct SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    state: Arc<Mutex<Slot<T>>>,
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(Slot {
                next_generation: 0,
                in_flight: None,
            })),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `start()` unless an operation is already in flight, in which case join it.
    ///
    /// The operation is spawned onto the runtime and releases the slot itself
    /// when it finishes, so it completes and frees the slot even if every
    /// caller stops waiting for it.
    pub async fn run<F>(&self, start: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, SyncError>> + Send,
    {
        let shared = {
            let mut slot = lock(&self.state);
            match slot.in_flight.as_ref() {
                Some((_, in_flight)) => {
                    debug!("Joining in-flight run");
                    in_flight.clone()
                }
                None => {
                    let generation = slot.next_generation;
                    slot.next_generation += 1;

                    let release = ReleaseOnDrop {
                        state: Arc::clone(&self.state),
                        generation,
                    };
                    let operation = start();
                    let handle = tokio::spawn(async move {
                        let _release = release;
                        operation.await
                    });

                    let run = async move {
                        match handle.await {
                            Ok(result) => result,
                            Err(e) => Err(SyncError::TaskError(e.to_string())),
                        }
                    }
                    .boxed()
                    .shared();
                    slot.in_flight = Some((generation, run.clone()));
                    run
                }
            }
        };

        shared.await
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).in_flight.is_some()
    }
}

/// Clears the slot when the spawned operation ends, panics included.
struct ReleaseOnDrop<T>
where
    T: Clone + Send + Sync + 'static,
{
    state: Arc<Mutex<Slot<T>>>,
    generation: u64,
}

impl<T> Drop for ReleaseOnDrop<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let mut slot = lock(&self.state);
        if slot
            .in_flight
            .as_ref()
            .is_some_and(|(generation, _)| *generation == self.generation)
        {
            slot.in_flight = None;
        }
    }
}

fn lock<T>(state: &Mutex<Slot<T>>) -> MutexGuard<'_, Slot<T>>
where
    T: Clone + Send + Sync + 'static,
{
    state.lock().unwrap_or_else(|e| e.into_inner())
}
