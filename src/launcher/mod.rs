//! Worker launching
//!
//! Resolves launcher names through the catalog, starts workers through a
//! bounded queue and keeps control over every launched process.

mod catalog;
mod lifecycle;
mod process;
mod queue;

pub use catalog::LauncherCatalog;
pub use lifecycle::{LaunchedWorker, LifecycleSettings};
pub use process::{CommandFactory, ProcessExit, ProcessHandle, WorkerFactory, WorkerProcess};
pub use queue::{BatchSummary, LaunchQueue, LaunchTask};

#[cfg(test)]
pub(crate) use process::fakes;

use futures::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, InboundEvent, ServerEvent};
use crate::models::{IdGenerator, WorkerId, WorkerState};

/// Launch failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("Cannot load browser \"{0}\": it is not registered! Perhaps you are missing some plugin?")]
    NotRegistered(String),

    #[error("Cannot start {name}: {reason}")]
    Spawn { name: String, reason: String },

    #[error("{name} has not captured in {timeout_ms} ms")]
    CaptureTimeout { name: String, timeout_ms: u64 },

    #[error("{name} crashed ({status})")]
    ProcessFailure { name: String, status: String },

    #[error("{name} failed {attempts} times ({last}), giving up")]
    RetriesExhausted {
        name: String,
        attempts: u32,
        last: String,
    },
}

/// Starts and controls worker processes
pub struct Launcher {
    catalog: LauncherCatalog,
    settings: LifecycleSettings,
    base_url: String,
    ids: IdGenerator,
    workers: Mutex<Vec<Arc<LaunchedWorker>>>,
    events: EventBus,
    mailbox: Option<mpsc::UnboundedSender<InboundEvent>>,
    batch_started: Mutex<Option<Instant>>,
}

impl Launcher {
    pub fn new(
        catalog: LauncherCatalog,
        settings: LifecycleSettings,
        base_url: impl Into<String>,
        events: EventBus,
    ) -> Self {
        Self {
            catalog,
            settings,
            base_url: base_url.into(),
            ids: IdGenerator::new(),
            workers: Mutex::new(Vec::new()),
            events,
            mailbox: None,
            batch_started: Mutex::new(None),
        }
    }

    /// Use a fixed id sequence
    pub fn with_ids(mut self, ids: IdGenerator) -> Self {
        self.ids = ids;
        self
    }

    /// Report launch failures to the run coordinator
    pub fn with_mailbox(mut self, mailbox: mpsc::UnboundedSender<InboundEvent>) -> Self {
        self.mailbox = Some(mailbox);
        self
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<Arc<LaunchedWorker>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn workers(&self) -> Vec<Arc<LaunchedWorker>> {
        self.lock_workers().clone()
    }

    pub fn get(&self, id: &WorkerId) -> Option<Arc<LaunchedWorker>> {
        self.lock_workers().iter().find(|w| w.id() == id).cloned()
    }

    /// Launch one worker per name and wait until every launch task has
    /// signalled. Unknown names are reported and skipped.
    pub async fn launch(
        self: &Arc<Self>,
        names: &[String],
        concurrency: Option<usize>,
    ) -> (Vec<WorkerId>, BatchSummary) {
        *self
            .batch_started
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());

        let mut tasks = Vec::new();
        let mut load_errors = Vec::new();

        for name in names {
            let factory = match self.catalog.get(name) {
                Ok(factory) => factory,
                Err(err) => {
                    error!("{}", err);
                    self.events.emit(ServerEvent::LoadError {
                        kind: "launcher".to_string(),
                        name: name.clone(),
                    });
                    load_errors.push(err);
                    continue;
                }
            };

            let worker = Arc::new(LaunchedWorker::new(
                self.ids.next_id(),
                factory,
                &self.base_url,
            ));
            tasks.push(LaunchTask::new(worker.id().clone(), name.clone()));
            self.lock_workers().push(worker);
        }

        let ids: Vec<WorkerId> = tasks.iter().map(|t| t.worker_id.clone()).collect();
        match concurrency {
            Some(limit) => info!("Launching browsers {} with concurrency {}", names.join(", "), limit),
            None => info!("Launching browsers {} with concurrency unlimited", names.join(", ")),
        }

        let queue = LaunchQueue::new(concurrency);
        let mut summary = queue
            .run(tasks, |task| {
                let launcher = Arc::clone(self);
                async move { launcher.start_worker(&task.worker_id).await }
            })
            .await;

        if let Some(err) = load_errors.last() {
            summary.failed += load_errors.len();
            summary.last_error.get_or_insert_with(|| err.to_string());
        }

        match &summary.last_error {
            Some(err) => warn!(
                "Launched {} of {} browsers, last error: {}",
                summary.succeeded,
                summary.total(),
                err
            ),
            None => debug!("All {} browsers launched", summary.succeeded),
        }

        self.events.emit(ServerEvent::LaunchBatchEnd {
            launched: summary.succeeded,
            failed: summary.failed,
            last_error: summary.last_error.clone(),
        });

        (ids, summary)
    }

    async fn start_worker(&self, id: &WorkerId) -> Result<(), LaunchError> {
        let worker = self
            .get(id)
            .ok_or_else(|| LaunchError::NotRegistered(id.to_string()))?;

        let result = worker.start(&self.settings).await;
        if result.is_err() {
            self.report_failure(&worker);
        }
        result
    }

    fn report_failure(&self, worker: &LaunchedWorker) {
        self.events.emit(ServerEvent::ProcessFailure {
            id: worker.id().clone(),
            name: worker.name().to_string(),
        });
        if let Some(mailbox) = &self.mailbox {
            let _ = mailbox.send(InboundEvent::ProcessFailure {
                id: worker.id().clone(),
                name: worker.name().to_string(),
            });
        }
    }

    /// Kill one worker. Unknown ids resolve to false.
    pub async fn kill(&self, id: &WorkerId) -> bool {
        match self.get(id) {
            Some(worker) => {
                worker.force_kill().await;
                true
            }
            None => false,
        }
    }

    /// Ask every launched worker to terminate
    pub async fn kill_all(&self) {
        let workers = self.workers();
        if workers.is_empty() {
            return;
        }
        debug!("Killing {} browsers", workers.len());
        join_all(workers.iter().map(|worker| worker.force_kill())).await;
    }

    /// Kill a worker and start it again through its lifecycle
    pub async fn restart(self: &Arc<Self>, id: &WorkerId) -> bool {
        let Some(worker) = self.get(id) else {
            return false;
        };

        if worker.request_restart().await {
            return true;
        }

        info!("Restarting {}", worker);
        worker.force_kill().await;
        worker.reset_for_restart();

        let launcher = Arc::clone(self);
        let id = id.clone();
        tokio::spawn(async move {
            let _ = launcher.start_worker(&id).await;
        });
        true
    }

    /// Record that a launched worker registered. Returns false for ids this
    /// launcher did not start.
    pub fn mark_captured(&self, id: &WorkerId) -> bool {
        let Some(worker) = self.get(id) else {
            return false;
        };
        worker.mark_captured();

        let started = *self
            .batch_started
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(started) = started {
            debug!(
                "{} has been captured in {} ms.",
                worker,
                started.elapsed().as_millis()
            );
        }
        true
    }

    /// Every worker that has not failed for good is captured
    pub fn are_all_captured(&self) -> bool {
        self.lock_workers()
            .iter()
            .filter(|w| w.state() != WorkerState::Failed)
            .all(|w| w.is_captured())
    }

    /// Some launched worker is still starting or has captured
    pub fn has_live_workers(&self) -> bool {
        self.lock_workers()
            .iter()
            .any(|w| w.state() != WorkerState::Failed)
    }
}
