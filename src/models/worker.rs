//! Worker lifecycle state and the shared worker record

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use thiserror::Error;

use super::{TestOutcome, WorkerId, WorkerResult};

/// Lifecycle state of a worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Created,
    Starting,
    Connected,
    Captured,
    Executing,
    Completed,
    Restarting,
    Disconnected,
    Failed,
}

impl WorkerState {
    /// Whether `next` is reachable from this state in one step.
    ///
    /// States only move forward, except for the restart branch, a worker
    /// starting its next run after `Completed`, and reconnection after
    /// `Disconnected`.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, next),
            (Created, Starting | Failed)
                | (Starting, Connected | Captured | Restarting | Failed)
                | (Connected, Captured | Executing | Restarting | Disconnected | Failed)
                | (Captured, Executing | Restarting | Disconnected | Failed)
                | (Executing, Completed | Restarting | Disconnected | Failed)
                | (Completed, Executing | Restarting | Disconnected | Failed)
                | (Restarting, Starting | Failed)
                | (Disconnected, Connected | Executing | Failed)
        )
    }

    /// Idle and able to accept an execute command
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            WorkerState::Connected | WorkerState::Captured | WorkerState::Completed
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Failed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkerState::Created => "created",
            WorkerState::Starting => "starting",
            WorkerState::Connected => "connected",
            WorkerState::Captured => "captured",
            WorkerState::Executing => "executing",
            WorkerState::Completed => "completed",
            WorkerState::Restarting => "restarting",
            WorkerState::Disconnected => "disconnected",
            WorkerState::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Worker state errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum StateError {
    #[error("Invalid state transition for {worker}: {from} -> {to}")]
    InvalidTransition {
        worker: String,
        from: WorkerState,
        to: WorkerState,
    },
}

#[derive(Debug)]
struct WorkerInner {
    state: WorkerState,
    last_result: WorkerResult,
    disconnects: u32,
    last_activity: Instant,
    /// Bumped whenever a pending deadline for this worker becomes stale
    epoch: u64,
}

/// A worker known to the registry.
///
/// Shared between the live registry and run snapshots, so mutable fields sit
/// behind a lock.
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    name: String,
    inner: Mutex<WorkerInner>,
}

impl Worker {
    pub fn new(id: WorkerId, name: impl Into<String>) -> Self {
        Self::with_state(id, name, WorkerState::Created)
    }

    /// A worker that has just registered over the transport
    pub fn connected(id: WorkerId, name: impl Into<String>) -> Self {
        Self::with_state(id, name, WorkerState::Connected)
    }

    fn with_state(id: WorkerId, name: impl Into<String>, state: WorkerState) -> Self {
        Self {
            id,
            name: name.into(),
            inner: Mutex::new(WorkerInner {
                state,
                last_result: WorkerResult::new(),
                disconnects: 0,
                last_activity: Instant::now(),
                epoch: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Move to `next`, rejecting transitions outside the lifecycle graph
    pub fn transition(&self, next: WorkerState) -> Result<WorkerState, StateError> {
        let mut inner = self.lock();
        let from = inner.state;
        if from == next {
            return Ok(from);
        }
        if !from.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                worker: self.to_string(),
                from,
                to: next,
            });
        }
        inner.state = next;
        Ok(from)
    }

    pub fn last_result(&self) -> WorkerResult {
        self.lock().last_result.clone()
    }

    /// Replace the current result with a fresh one
    pub fn clear_result(&self) {
        let mut inner = self.lock();
        inner.last_result = WorkerResult::new();
        inner.disconnects = 0;
    }

    pub fn set_total(&self, total: u32) {
        self.lock().last_result.total = total;
    }

    pub fn record(&self, outcome: &TestOutcome) {
        let mut inner = self.lock();
        inner.last_result.add(outcome);
        inner.last_activity = Instant::now();
    }

    pub fn mark_error(&self) {
        let mut inner = self.lock();
        inner.last_result.error = true;
        inner.last_activity = Instant::now();
    }

    pub fn mark_disconnected(&self) {
        let mut inner = self.lock();
        inner.last_result.disconnected = true;
        inner.last_result.finish();
    }

    pub fn finish_result(&self) {
        self.lock().last_result.finish();
    }

    pub fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.lock().last_activity
    }

    /// Count a dropped connection, returning the running total for this run
    pub fn count_disconnect(&self) -> u32 {
        let mut inner = self.lock();
        inner.disconnects += 1;
        inner.disconnects
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Invalidate pending deadlines, returning the new epoch
    pub fn bump_epoch(&self) -> u64 {
        let mut inner = self.lock();
        inner.epoch += 1;
        inner.epoch
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (id {})", self.name, self.id)
    }
}
