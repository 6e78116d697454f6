//! Run coordinator
//!
//! Gates execution on every registered worker being ready, counts down
//! per-worker completions and emits exactly one `run_complete` per run. All
//! state changes happen in [`RunCoordinator::dispatch`], one event at a time.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{ClientOptions, OrchestratorConfig};
use crate::events::{EventBus, InboundEvent, ServerEvent};
use crate::launcher::Launcher;
use crate::models::{TestOutcome, Worker, WorkerId, WorkerState};
use crate::registry::{RegistrySnapshot, WorkerRegistry};
use crate::transport::Transport;

use super::ExitCodePolicy;

/// Options the coordinator reads from the configuration
#[derive(Clone, Debug)]
pub struct CoordinatorSettings {
    /// Address printed when no worker is connected
    pub server_url: String,
    pub client: ClientOptions,
    pub policy: ExitCodePolicy,
    pub single_run: bool,
    pub disconnect_timeout: Duration,
    pub disconnect_tolerance: u32,
    /// Zero disables the inactivity check
    pub no_activity_timeout: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            server_url: config.server_url(),
            client: config.client.clone(),
            policy: ExitCodePolicy::new(
                config.fail_on_empty_test_suite,
                config.fail_on_failing_test_suite,
            ),
            single_run: config.single_run,
            disconnect_timeout: config.disconnect_timeout(),
            disconnect_tolerance: config.browser_disconnect_tolerance,
            no_activity_timeout: config.no_activity_timeout(),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

/// Work postponed until the current event has been fully handled
#[derive(Debug)]
enum Deferred {
    RunComplete,
}

/// Run currently in flight
struct ActiveRun {
    workers: RegistrySnapshot,
    pending: usize,
    completed: HashSet<WorkerId>,
}

impl ActiveRun {
    fn is_pending(&self, id: &WorkerId) -> bool {
        self.workers.contains(id) && !self.completed.contains(id)
    }
}

pub struct RunCoordinator {
    registry: WorkerRegistry,
    events: EventBus,
    transport: Arc<dyn Transport>,
    launcher: Option<Arc<Launcher>>,
    settings: CoordinatorSettings,
    /// Mailbox timer events are delivered to; no timers without it
    timers: Option<mpsc::UnboundedSender<InboundEvent>>,
    execution_scheduled: bool,
    run: Option<ActiveRun>,
    deferred: VecDeque<Deferred>,
    single_run_not_captured: bool,
    runs_started: usize,
}

impl RunCoordinator {
    pub fn new(settings: CoordinatorSettings, events: EventBus, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry: WorkerRegistry::new(events.clone()),
            events,
            transport,
            launcher: None,
            settings,
            timers: None,
            execution_scheduled: false,
            run: None,
            deferred: VecDeque::new(),
            single_run_not_captured: false,
            runs_started: 0,
        }
    }

    /// Mark launched workers as captured when they register
    pub fn with_launcher(mut self, launcher: Arc<Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    pub fn is_execution_scheduled(&self) -> bool {
        self.execution_scheduled
    }

    pub fn pending(&self) -> usize {
        self.run.as_ref().map_or(0, |run| run.pending)
    }

    pub fn single_run_not_captured(&self) -> bool {
        self.single_run_not_captured
    }

    /// Handle one event, then everything it deferred
    pub fn dispatch(&mut self, event: InboundEvent) {
        self.handle(event);
        self.drain_deferred();
    }

    fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    fn drain_deferred(&mut self) {
        while let Some(work) = self.deferred.pop_front() {
            match work {
                Deferred::RunComplete => self.emit_run_complete(),
            }
        }
    }

    fn handle(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::WorkerRegister { id, name } => self.on_register(id, name),
            InboundEvent::WorkerDisconnect { id } => self.on_disconnect(&id),
            InboundEvent::WorkerStart { id, total } => {
                if let Some(worker) = self.active_worker(&id) {
                    worker.set_total(total);
                    self.keep_alive(&worker);
                }
            }
            InboundEvent::WorkerResult { id, outcome } => self.on_result(&id, &outcome),
            InboundEvent::WorkerError { id, message } => self.on_error(&id, message),
            InboundEvent::WorkerComplete { id } => self.on_worker_complete(&id),
            InboundEvent::ProcessFailure { id, name } => self.on_process_failure(&id, &name),
            InboundEvent::ScheduleRequested => {
                self.schedule();
            }
            InboundEvent::DisconnectDeadline { id, epoch } => {
                if let Some(worker) = self.current(&id, epoch) {
                    if worker.state() == WorkerState::Disconnected {
                        warn!(
                            "{} failed to reconnect within {} ms",
                            worker,
                            self.settings.disconnect_timeout.as_millis()
                        );
                        self.lose_worker(&worker);
                    }
                }
            }
            InboundEvent::ActivityCheck { id, epoch } => {
                if let Some(worker) = self.current(&id, epoch) {
                    if worker.state() == WorkerState::Executing {
                        warn!(
                            "{} has not sent any message in {} ms, disconnecting",
                            worker,
                            self.settings.no_activity_timeout.as_millis()
                        );
                        self.lose_worker(&worker);
                    }
                }
            }
        }
    }

    /// Start a run if every worker is ready.
    ///
    /// Returns true when the run was started. Otherwise the request is
    /// remembered and retried after the current run completes.
    pub fn schedule(&mut self) -> bool {
        if self.registry.is_empty() {
            warn!(
                "No captured browser, open {}",
                self.settings.server_url
            );
            return false;
        }

        if self.run.is_some() || !self.registry.all_ready() {
            let not_ready: Vec<String> = self
                .registry
                .not_ready()
                .iter()
                .map(|w| w.to_string())
                .collect();
            info!(
                "Delaying execution, these browsers are not ready: {}",
                not_ready.join(", ")
            );
            self.execution_scheduled = true;
            return false;
        }

        debug!("All browsers are ready, executing");
        debug!("Captured {} browsers", self.registry.len());

        self.execution_scheduled = false;
        self.registry.clear_results();
        let workers = self.registry.snapshot();

        for worker in workers.iter() {
            if let Err(e) = worker.transition(WorkerState::Executing) {
                warn!("{}", e);
            }
            self.keep_alive(worker);
        }

        self.run = Some(ActiveRun {
            pending: workers.len(),
            workers: workers.clone(),
            completed: HashSet::new(),
        });
        self.runs_started += 1;

        self.events.emit(ServerEvent::RunStart {
            workers: workers.clone(),
        });
        self.transport.execute(&workers.ids(), &self.settings.client);
        true
    }

    fn on_register(&mut self, id: WorkerId, name: String) {
        if let Some(launcher) = &self.launcher {
            launcher.mark_captured(&id);
        }

        if let Some(worker) = self.registry.get_by_id(&id) {
            self.on_reconnect(&worker);
            return;
        }

        let worker = Arc::new(Worker::connected(id.clone(), name.clone()));
        info!("Connected on socket {}", worker);
        self.registry.add(worker);
        self.events.emit(ServerEvent::BrowserRegister { id, name });

        let launched_ready = self
            .launcher
            .as_ref()
            .map_or(true, |launcher| launcher.are_all_captured());
        if launched_ready && (!self.settings.single_run || self.runs_started == 0) {
            self.schedule();
        }
    }

    fn on_reconnect(&mut self, worker: &Arc<Worker>) {
        let pending = self
            .run
            .as_ref()
            .is_some_and(|run| run.is_pending(worker.id()));

        if worker.state() != WorkerState::Disconnected {
            debug!("{} registered again", worker);
            return;
        }

        let next = if pending {
            WorkerState::Executing
        } else {
            WorkerState::Connected
        };
        match worker.transition(next) {
            Ok(_) => {
                info!("{} reconnected", worker);
                if pending {
                    self.keep_alive(worker);
                } else {
                    worker.bump_epoch();
                }
            }
            Err(e) => warn!("{}", e),
        }
    }

    fn on_disconnect(&mut self, id: &WorkerId) {
        let Some(worker) = self.registry.get_by_id(id) else {
            debug!("Disconnect from unknown worker {}", id);
            return;
        };

        let pending = self.run.as_ref().is_some_and(|run| run.is_pending(id));
        if !pending {
            info!("Disconnected {}", worker);
            worker.bump_epoch();
            if let Err(e) = worker.transition(WorkerState::Disconnected) {
                debug!("{}", e);
            }
            self.registry.remove(id);
            return;
        }

        let disconnects = worker.count_disconnect();
        if disconnects > self.settings.disconnect_tolerance {
            warn!(
                "{} disconnected {} times, tolerance is {}",
                worker, disconnects, self.settings.disconnect_tolerance
            );
            self.lose_worker(&worker);
            return;
        }

        if let Err(e) = worker.transition(WorkerState::Disconnected) {
            warn!("{}", e);
        }
        warn!(
            "{} disconnected ({} of {} tolerated), waiting {} ms to reconnect",
            worker,
            disconnects,
            self.settings.disconnect_tolerance,
            self.settings.disconnect_timeout.as_millis()
        );
        let epoch = worker.bump_epoch();
        self.arm(
            self.settings.disconnect_timeout,
            InboundEvent::DisconnectDeadline {
                id: id.clone(),
                epoch,
            },
        );
    }

    fn on_result(&mut self, id: &WorkerId, outcome: &TestOutcome) {
        let Some(worker) = self.active_worker(id) else {
            debug!("Result from {} outside of a run", id);
            return;
        };
        worker.record(outcome);
        self.keep_alive(&worker);
    }

    fn on_error(&mut self, id: &WorkerId, message: String) {
        let Some(worker) = self.registry.get_by_id(id) else {
            return;
        };
        error!("{} ERROR {}", worker, message);
        worker.mark_error();
        if worker.state() == WorkerState::Executing {
            self.keep_alive(&worker);
        }
        self.events.emit(ServerEvent::BrowserError {
            id: id.clone(),
            name: worker.name().to_string(),
            message,
        });
    }

    /// A worker finished its part of the run
    pub fn on_worker_complete(&mut self, id: &WorkerId) {
        let Some(worker) = self.pending_worker(id) else {
            debug!("Ignoring completion of {} outside of a run", id);
            return;
        };
        worker.finish_result();
        worker.bump_epoch();
        if let Err(e) = worker.transition(WorkerState::Completed) {
            warn!("{}", e);
        }
        self.complete(&worker);
    }

    fn on_process_failure(&mut self, id: &WorkerId, name: &str) {
        error!("{} (id {}) failed to start", name, id);

        if let Some(worker) = self.pending_worker(id) {
            worker.mark_error();
            worker.finish_result();
            worker.bump_epoch();
            let _ = worker.transition(WorkerState::Failed);
            self.registry.remove(id);
            self.complete(&worker);
            return;
        }

        if self.registry.remove(id) {
            debug!("Removed failed worker {} from the registry", id);
        }

        if !self.settings.single_run {
            return;
        }
        self.single_run_not_captured = true;
        if self.run.is_some() || self.runs_started > 0 {
            return;
        }

        // Captured workers that already left the registry will not come back
        let live = match &self.launcher {
            Some(launcher) => {
                launcher.has_live_workers()
                    && !(launcher.are_all_captured() && self.registry.is_empty())
            }
            None => !self.registry.is_empty(),
        };
        if !live {
            // Nothing will complete; finish the single run now
            self.run = Some(ActiveRun {
                workers: self.registry.snapshot(),
                pending: 0,
                completed: HashSet::new(),
            });
            self.deferred.push_back(Deferred::RunComplete);
            return;
        }

        // The failed worker may have been the last one holding the run back
        let launched_ready = self
            .launcher
            .as_ref()
            .map_or(true, |launcher| launcher.are_all_captured());
        if launched_ready && !self.registry.is_empty() {
            self.schedule();
        }
    }

    /// Count a worker as done for this run, with `disconnected` set
    fn lose_worker(&mut self, worker: &Arc<Worker>) {
        worker.mark_disconnected();
        worker.bump_epoch();
        if let Err(e) = worker.transition(WorkerState::Disconnected) {
            debug!("{}", e);
        }
        self.events.emit(ServerEvent::BrowserError {
            id: worker.id().clone(),
            name: worker.name().to_string(),
            message: "Disconnected".to_string(),
        });
        self.registry.remove(worker.id());

        if self
            .run
            .as_ref()
            .is_some_and(|run| run.is_pending(worker.id()))
        {
            self.complete(worker);
        }
    }

    fn complete(&mut self, worker: &Arc<Worker>) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if !run.completed.insert(worker.id().clone()) {
            return;
        }

        self.events.emit(ServerEvent::BrowserComplete {
            id: worker.id().clone(),
            name: worker.name().to_string(),
            result: worker.last_result(),
        });

        run.pending = run.pending.saturating_sub(1);
        if run.pending == 0 {
            self.deferred.push_back(Deferred::RunComplete);
        }
    }

    fn emit_run_complete(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };

        let aggregate = run
            .workers
            .aggregate(self.single_run_not_captured, self.settings.policy);
        info!(
            "Executed {} tests: {} success, {} failed{}{}",
            aggregate.executed(),
            aggregate.success,
            aggregate.failed,
            if aggregate.error { ", error" } else { "" },
            if aggregate.disconnected { ", disconnected" } else { "" }
        );

        self.events.emit(ServerEvent::RunComplete {
            workers: run.workers,
            aggregate,
        });
        self.on_run_complete();
    }

    fn on_run_complete(&mut self) {
        if self.execution_scheduled {
            self.schedule();
        }
    }

    /// Registry member that is executing or otherwise taking part in a run
    fn active_worker(&self, id: &WorkerId) -> Option<Arc<Worker>> {
        self.registry.get_by_id(id)
    }

    /// Member of the current run that has not completed yet
    fn pending_worker(&self, id: &WorkerId) -> Option<Arc<Worker>> {
        let run = self.run.as_ref()?;
        if !run.is_pending(id) {
            return None;
        }
        run.workers.iter().find(|w| w.id() == id).cloned()
    }

    /// Worker still in the registry whose timers have not been invalidated
    fn current(&self, id: &WorkerId, epoch: u64) -> Option<Arc<Worker>> {
        self.registry
            .get_by_id(id)
            .filter(|worker| worker.epoch() == epoch)
    }

    fn keep_alive(&self, worker: &Worker) {
        worker.touch();
        let epoch = worker.bump_epoch();
        if self.settings.no_activity_timeout.is_zero() {
            return;
        }
        self.arm(
            self.settings.no_activity_timeout,
            InboundEvent::ActivityCheck {
                id: worker.id().clone(),
                epoch,
            },
        );
    }

    fn arm(&self, after: Duration, event: InboundEvent) {
        let Some(timers) = &self.timers else {
            return;
        };
        let timers = timers.clone();
        tokio::spawn(async move {
            sleep(after).await;
            let _ = timers.send(event);
        });
    }
}

/// Drives a [`RunCoordinator`] from its mailbox on a dedicated task
pub struct CoordinatorHandle {
    mailbox: mpsc::UnboundedSender<InboundEvent>,
    task: JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Spawn the mailbox loop. `mailbox` must be the sender of `inbox`.
    pub fn spawn(
        mut coordinator: RunCoordinator,
        mailbox: mpsc::UnboundedSender<InboundEvent>,
        mut inbox: mpsc::UnboundedReceiver<InboundEvent>,
    ) -> Self {
        coordinator.timers = Some(mailbox.clone());

        let task = tokio::spawn(async move {
            while let Some(event) = inbox.recv().await {
                coordinator.handle(event);
                if coordinator.has_deferred() {
                    // Let observers of this event run before anything it deferred
                    tokio::task::yield_now().await;
                    coordinator.drain_deferred();
                }
            }
            debug!("Coordinator mailbox closed");
        });

        Self { mailbox, task }
    }

    pub fn mailbox(&self) -> mpsc::UnboundedSender<InboundEvent> {
        self.mailbox.clone()
    }

    pub fn send(&self, event: InboundEvent) {
        if self.mailbox.send(event).is_err() {
            debug!("Coordinator is gone, dropping event");
        }
    }

    pub fn stop(self) {
        self.task.abort();
    }
}
