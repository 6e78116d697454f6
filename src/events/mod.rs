//! Orchestrator events
//!
//! Inbound events are delivered to the run coordinator's mailbox and handled
//! one at a time. Outbound events are broadcast to observers (reporters, CLI)
//! in emission order.

use tokio::sync::broadcast;
use tracing::trace;

use crate::executor::RunAggregate;
use crate::models::{TestOutcome, WorkerId, WorkerResult};
use crate::registry::RegistrySnapshot;

/// Default capacity of the observer channel
const EVENT_CAPACITY: usize = 1024;

/// Events consumed by the run coordinator
#[derive(Clone, Debug, PartialEq)]
pub enum InboundEvent {
    /// A worker connected and identified itself
    WorkerRegister { id: WorkerId, name: String },
    /// A worker's connection dropped
    WorkerDisconnect { id: WorkerId },
    /// A worker announced how many test cases it is about to run
    WorkerStart { id: WorkerId, total: u32 },
    /// One test case finished on a worker
    WorkerResult { id: WorkerId, outcome: TestOutcome },
    /// A worker reported an error outside of a test case
    WorkerError { id: WorkerId, message: String },
    /// A worker finished executing the current run
    WorkerComplete { id: WorkerId },
    /// A launched worker process failed for good
    ProcessFailure { id: WorkerId, name: String },
    /// Request a run (file change, manual trigger, initial run)
    ScheduleRequested,
    /// Reconnect grace window for a disconnected worker elapsed
    DisconnectDeadline { id: WorkerId, epoch: u64 },
    /// Time to check a worker for inactivity
    ActivityCheck { id: WorkerId, epoch: u64 },
}

/// Events emitted for observers
#[derive(Clone, Debug)]
pub enum ServerEvent {
    /// Live registry membership changed
    BrowsersChange { workers: RegistrySnapshot },
    BrowserRegister { id: WorkerId, name: String },
    BrowserError { id: WorkerId, name: String, message: String },
    BrowserComplete {
        id: WorkerId,
        name: String,
        result: WorkerResult,
    },
    RunStart { workers: RegistrySnapshot },
    RunComplete {
        workers: RegistrySnapshot,
        aggregate: RunAggregate,
    },
    /// A launcher or plugin could not be loaded
    LoadError { kind: String, name: String },
    ProcessFailure { id: WorkerId, name: String },
    /// All queued launch tasks have signalled
    LaunchBatchEnd {
        launched: usize,
        failed: usize,
        last_error: Option<String>,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::BrowsersChange { .. } => "browsers_change",
            ServerEvent::BrowserRegister { .. } => "browser_register",
            ServerEvent::BrowserError { .. } => "browser_error",
            ServerEvent::BrowserComplete { .. } => "browser_complete",
            ServerEvent::RunStart { .. } => "run_start",
            ServerEvent::RunComplete { .. } => "run_complete",
            ServerEvent::LoadError { .. } => "load_error",
            ServerEvent::ProcessFailure { .. } => "browser_process_failure",
            ServerEvent::LaunchBatchEnd { .. } => "launch_batch_end",
        }
    }
}

/// Broadcast bus for [`ServerEvent`]s
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Emit to every current subscriber. Having none is not an error.
    pub fn emit(&self, event: ServerEvent) {
        trace!("Emitting {}", event.name());
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
