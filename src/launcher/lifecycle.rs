//! Per-worker launch lifecycle
//!
//! Policies wrap the base spawn, outermost first: process supervision, retry,
//! capture timeout, then the spawn itself.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::models::{WorkerId, WorkerState};

use super::process::{ProcessExit, ProcessHandle, WorkerFactory};
use super::LaunchError;

/// Timing and retry budget shared by every launched worker
#[derive(Clone, Debug)]
pub struct LifecycleSettings {
    pub capture_timeout: Duration,
    pub retry_limit: u32,
    pub kill_timeout: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            capture_timeout: Duration::from_millis(60_000),
            retry_limit: 2,
            kill_timeout: Duration::from_millis(2_000),
        }
    }
}

/// How one spawn attempt ended
enum Attempt {
    Captured,
    /// Stopped by kill(); not a failure
    Killed,
    /// Restart requested while starting; relaunch without using the budget
    Restart,
    Failed(LaunchError),
}

/// A worker process started by the launcher
pub struct LaunchedWorker {
    id: WorkerId,
    name: String,
    url: String,
    factory: Arc<dyn WorkerFactory>,
    state: Mutex<WorkerState>,
    spawns: AtomicU32,
    killed: AtomicBool,
    restart_requested: AtomicBool,
    captured: watch::Sender<bool>,
    process: Mutex<Option<ProcessHandle>>,
}

impl LaunchedWorker {
    pub fn new(id: WorkerId, factory: Arc<dyn WorkerFactory>, base_url: &str) -> Self {
        let url = format!("{base_url}?id={id}");
        let (captured, _) = watch::channel(false);
        Self {
            name: factory.display_name().to_string(),
            id,
            url,
            factory,
            state: Mutex::new(WorkerState::Created),
            spawns: AtomicU32::new(0),
            killed: AtomicBool::new(false),
            restart_requested: AtomicBool::new(false),
            captured,
            process: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> WorkerState {
        *self.lock_state()
    }

    pub fn is_captured(&self) -> bool {
        *self.captured.borrow()
    }

    /// Number of times the process was spawned
    pub fn spawn_count(&self) -> u32 {
        self.spawns.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_process(&self) -> MutexGuard<'_, Option<ProcessHandle>> {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = self.lock_state();
        if *state == next {
            return;
        }
        if state.can_transition_to(next) {
            debug!("{} {} -> {}", self, *state, next);
            *state = next;
        } else {
            debug!("{} ignoring transition {} -> {}", self, *state, next);
        }
    }

    /// Called when the worker registered over the transport
    pub fn mark_captured(&self) {
        self.captured.send_replace(true);
    }

    /// Spawn the process and wait for capture, relaunching on failure until
    /// the retry budget is spent.
    pub async fn start(&self, settings: &LifecycleSettings) -> Result<(), LaunchError> {
        self.killed.store(false, Ordering::SeqCst);
        let mut retries = 0;

        loop {
            match self.attempt(settings).await {
                Attempt::Captured => {
                    self.set_state(WorkerState::Captured);
                    return Ok(());
                }
                Attempt::Killed => {
                    debug!("{} was killed while starting", self);
                    return Ok(());
                }
                Attempt::Restart => {
                    self.set_state(WorkerState::Restarting);
                    info!("Restarting {}", self);
                }
                Attempt::Failed(err) => {
                    error!("{}", err);
                    self.kill_current().await;

                    if retries >= settings.retry_limit {
                        self.set_state(WorkerState::Failed);
                        error!("{} failed {} times. Giving up.", self, retries + 1);
                        return Err(LaunchError::RetriesExhausted {
                            name: self.to_string(),
                            attempts: retries + 1,
                            last: err.to_string(),
                        });
                    }

                    retries += 1;
                    self.set_state(WorkerState::Restarting);
                    info!(
                        "Trying to start {} again ({}/{}).",
                        self, retries, settings.retry_limit
                    );
                }
            }
        }
    }

    async fn attempt(&self, settings: &LifecycleSettings) -> Attempt {
        self.captured.send_replace(false);
        self.restart_requested.store(false, Ordering::SeqCst);
        self.set_state(WorkerState::Starting);
        self.spawns.fetch_add(1, Ordering::SeqCst);

        info!("Starting browser {}", self.name);
        let process = match self.factory.spawn(&self.id, &self.url) {
            Ok(process) => process,
            Err(err) => return Attempt::Failed(err),
        };

        let mut handle = ProcessHandle::supervise(process, settings.kill_timeout, self.to_string());
        *self.lock_process() = Some(handle.clone());

        // kill() may have run before the handle was stored
        if self.killed.load(Ordering::SeqCst) {
            handle.force_kill().await;
            return Attempt::Killed;
        }

        let mut captured = self.captured.subscribe();

        tokio::select! {
            ok = async { captured.wait_for(|c| *c).await.is_ok() } => {
                if ok {
                    Attempt::Captured
                } else {
                    Attempt::Failed(self.crash(ProcessExit::Killed))
                }
            }
            exit = handle.exited() => {
                if self.killed.load(Ordering::SeqCst) {
                    Attempt::Killed
                } else if self.restart_requested.swap(false, Ordering::SeqCst) {
                    Attempt::Restart
                } else if self.is_captured() {
                    Attempt::Captured
                } else {
                    Attempt::Failed(self.crash(exit))
                }
            }
            _ = sleep(settings.capture_timeout) => {
                warn!(
                    "{} has not captured in {} ms, killing.",
                    self,
                    settings.capture_timeout.as_millis()
                );
                Attempt::Failed(LaunchError::CaptureTimeout {
                    name: self.to_string(),
                    timeout_ms: settings.capture_timeout.as_millis() as u64,
                })
            }
        }
    }

    fn crash(&self, exit: ProcessExit) -> LaunchError {
        LaunchError::ProcessFailure {
            name: self.to_string(),
            status: exit.to_string(),
        }
    }

    async fn kill_current(&self) {
        let handle = self.lock_process().clone();
        if let Some(handle) = handle {
            handle.force_kill().await;
        }
    }

    /// Terminate the process. Resolves once it was asked to stop, and at once
    /// when there is nothing to kill.
    pub async fn force_kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.kill_current().await;
    }

    /// Kill the current process so the running lifecycle relaunches it.
    /// Returns false when no launch is in flight.
    pub async fn request_restart(&self) -> bool {
        if !matches!(
            self.state(),
            WorkerState::Starting | WorkerState::Restarting
        ) {
            return false;
        }
        self.restart_requested.store(true, Ordering::SeqCst);
        self.kill_current().await;
        true
    }

    /// Prepare a captured or stopped worker for a fresh lifecycle run
    pub fn reset_for_restart(&self) {
        self.killed.store(false, Ordering::SeqCst);
        self.captured.send_replace(false);
        self.set_state(WorkerState::Restarting);
    }
}

impl fmt::Display for LaunchedWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (id {})", self.name, self.id)
    }
}
