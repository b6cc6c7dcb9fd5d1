use super::error::WorkerError;
use super::panic_message;
use super::worker::Worker;
use crate::metrics;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`WorkerManager`].
///
/// `Created → Running → ShuttingDown → Stopped | TimedOut`. `Stopped` and
/// `TimedOut` are terminal; in `TimedOut` some worker tasks may still be
/// executing detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
    TimedOut,
}

/// Serializable information about a registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub name: String,
    pub is_running: bool,
}

/// Owns the registered workers and their tasks.
pub struct WorkerManager {
    /// Registered workers, frozen once started.
    workers: Vec<Arc<dyn Worker>>,

    /// Parent token; each worker receives a child of it.
    shutdown_token: CancellationToken,

    /// One handle per spawned worker task.
    handles: Vec<(String, JoinHandle<()>)>,

    /// Names of workers whose task has not returned yet.
    running: Arc<Mutex<HashSet<String>>>,

    state: ManagerState,

    /// Outcome of the first shutdown, replayed by later calls.
    shutdown_outcome: Option<Result<(), WorkerError>>,
}

impl Default for WorkerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerManager {
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
            shutdown_token: CancellationToken::new(),
            handles: Vec::new(),
            running: Arc::new(Mutex::new(HashSet::new())),
            state: ManagerState::Created,
            shutdown_outcome: None,
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Register a worker. Only allowed before [`start`](Self::start).
    pub fn register(&mut self, worker: Arc<dyn Worker>) -> Result<(), WorkerError> {
        if self.state != ManagerState::Created {
            warn!(
                "Rejected registration of worker {} in state {:?}",
                worker.name(),
                self.state
            );
            return Err(WorkerError::RegistryFrozen);
        }
        if self.workers.iter().any(|w| w.name() == worker.name()) {
            return Err(WorkerError::DuplicateWorker(worker.name().to_string()));
        }

        info!("Registering worker: {}", worker.name());
        self.workers.push(worker);
        Ok(())
    }

    /// Spawn one task per registered worker.
    ///
    /// Must be called from within a Tokio runtime. Can only be called once.
    pub fn start(&mut self) -> Result<(), WorkerError> {
        if self.state != ManagerState::Created {
            return Err(WorkerError::AlreadyStarted);
        }
        self.state = ManagerState::Running;

        for worker in &self.workers {
            let name = worker.name().to_string();
            self.lock_running().insert(name.clone());
            let handle = tokio::spawn(Self::run_worker(
                Arc::clone(worker),
                self.shutdown_token.child_token(),
                Arc::clone(&self.running),
            ));
            self.handles.push((name, handle));
        }

        let names: Vec<&str> = self.workers.iter().map(|w| w.name()).collect();
        info!("Started {} workers: {:?}", names.len(), names);
        Ok(())
    }

    /// Body of a worker task. A panicking worker is contained here so it
    /// still counts as returned and never takes other workers down.
    async fn run_worker(
        worker: Arc<dyn Worker>,
        cancel: CancellationToken,
        running: Arc<Mutex<HashSet<String>>>,
    ) {
        let name = worker.name().to_string();
        info!("Starting worker: {}", name);
        metrics::set_worker_running(&name, true);

        match AssertUnwindSafe(worker.start(cancel)).catch_unwind().await {
            Ok(()) => info!("Worker stopped: {}", name),
            Err(payload) => error!("Worker {} panicked: {}", name, panic_message(&*payload)),
        }

        metrics::set_worker_running(&name, false);
        running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name);
    }

    /// Cancel every worker and wait up to `timeout` for their tasks to return.
    ///
    /// Cancellation is only a request: on timeout the remaining tasks are left
    /// running detached and [`WorkerError::ShutdownTimeout`] names them.
    /// Calling this again returns the outcome of the first call.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<(), WorkerError> {
        if let Some(outcome) = &self.shutdown_outcome {
            debug!("Worker shutdown already performed, returning previous outcome");
            return outcome.clone();
        }

        info!("Initiating worker shutdown...");
        self.state = ManagerState::ShuttingDown;
        self.shutdown_token.cancel();

        let joined = tokio::time::timeout(
            timeout,
            futures::future::join_all(self.handles.iter_mut().map(|(_, handle)| handle)),
        )
        .await;

        let outcome = match joined {
            Ok(results) => {
                for ((name, _), result) in self.handles.iter().zip(results) {
                    if let Err(e) = result {
                        error!("Worker task {} ended abnormally: {}", name, e);
                    }
                }
                info!("All workers stopped gracefully");
                self.state = ManagerState::Stopped;
                Ok(())
            }
            Err(_) => {
                let mut stuck: Vec<String> = self.lock_running().iter().cloned().collect();
                stuck.sort();
                warn!(
                    "Worker shutdown timed out after {:?}, still running: {:?}",
                    timeout, stuck
                );
                self.state = ManagerState::TimedOut;
                Err(WorkerError::ShutdownTimeout { timeout, stuck })
            }
        };

        self.shutdown_outcome = Some(outcome.clone());
        outcome
    }

    /// Get information about all registered workers, sorted by name.
    pub fn list_workers(&self) -> Vec<WorkerInfo> {
        let running = self.lock_running();
        let mut workers: Vec<WorkerInfo> = self
            .workers
            .iter()
            .map(|w| WorkerInfo {
                name: w.name().to_string(),
                is_running: running.contains(w.name()),
            })
            .collect();
        workers.sort_by(|a, b| a.name.cmp(&b.name));
        workers
    }

    pub fn is_worker_running(&self, name: &str) -> bool {
        self.lock_running().contains(name)
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        if self.state == ManagerState::Running {
            debug!("Worker manager dropped while running, cancelling workers");
            self.shutdown_token.cancel();
        }
    }
}
