//! Worker registry
//!
//! The authoritative set of connected workers plus immutable per-run
//! snapshots of it.

#![allow(dead_code)]

use std::sync::Arc;
use tracing::warn;

use crate::events::{EventBus, ServerEvent};
use crate::executor::{ExitCodePolicy, RunAggregate};
use crate::models::{Worker, WorkerId, WorkerResult};

/// Live set of known workers. Every membership change is announced with a
/// `browsers_change` event.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: Vec<Arc<Worker>>,
    events: EventBus,
}

impl WorkerRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            workers: Vec::new(),
            events,
        }
    }

    /// Append a worker. A worker whose id is already present is rejected.
    pub fn add(&mut self, worker: Arc<Worker>) -> bool {
        if self.get_by_id(worker.id()).is_some() {
            warn!("Worker {} is already registered", worker);
            return false;
        }

        self.workers.push(worker);
        self.notify();
        true
    }

    /// Remove a worker, returning whether it was a member
    pub fn remove(&mut self, id: &WorkerId) -> bool {
        let before = self.workers.len();
        self.workers.retain(|w| w.id() != id);

        if self.workers.len() == before {
            return false;
        }

        self.notify();
        true
    }

    pub fn get_by_id(&self, id: &WorkerId) -> Option<Arc<Worker>> {
        self.workers.iter().find(|w| w.id() == id).cloned()
    }

    /// True iff every member is idle and connected (vacuously true when empty)
    pub fn all_ready(&self) -> bool {
        self.workers.iter().all(|w| w.is_ready())
    }

    /// Members that are not ready, for diagnostics
    pub fn not_ready(&self) -> Vec<Arc<Worker>> {
        self.workers
            .iter()
            .filter(|w| !w.is_ready())
            .cloned()
            .collect()
    }

    /// Independent copy of the membership that shares the worker records
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            workers: self.workers.clone(),
        }
    }

    /// Give every member a fresh result. Only called at run start.
    pub fn clear_results(&self) {
        for worker in &self.workers {
            worker.clear_result();
        }
    }

    pub fn aggregate(&self, single_run_not_captured: bool, policy: ExitCodePolicy) -> RunAggregate {
        aggregate_workers(&self.workers, single_run_not_captured, policy)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Worker>> {
        self.workers.iter()
    }

    fn notify(&self) {
        self.events.emit(ServerEvent::BrowsersChange {
            workers: self.snapshot(),
        });
    }
}

/// Membership of the registry frozen at one point in time.
///
/// Later edits to the live registry do not affect a snapshot, but results
/// recorded on the shared workers are visible through it.
#[derive(Clone, Debug, Default)]
pub struct RegistrySnapshot {
    workers: Vec<Arc<Worker>>,
}

impl RegistrySnapshot {
    pub fn aggregate(&self, single_run_not_captured: bool, policy: ExitCodePolicy) -> RunAggregate {
        aggregate_workers(&self.workers, single_run_not_captured, policy)
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.workers.iter().any(|w| w.id() == id)
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|w| w.id().clone()).collect()
    }

    /// `(name, id, result)` for each worker, in registration order
    pub fn results(&self) -> Vec<(String, WorkerId, WorkerResult)> {
        self.workers
            .iter()
            .map(|w| (w.name().to_string(), w.id().clone(), w.last_result()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Worker>> {
        self.workers.iter()
    }
}

fn aggregate_workers(
    workers: &[Arc<Worker>],
    single_run_not_captured: bool,
    policy: ExitCodePolicy,
) -> RunAggregate {
    let mut aggregate = RunAggregate::default();

    for worker in workers {
        let result = worker.last_result();
        aggregate.success += result.success;
        aggregate.failed += result.failed;
        aggregate.error |= result.error;
        aggregate.disconnected |= result.disconnected;
    }

    aggregate.exit_code = policy.exit_code(&aggregate, single_run_not_captured);
    aggregate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TestOutcome, WorkerState};

    fn worker(id: &str, name: &str) -> Arc<Worker> {
        Arc::new(Worker::connected(WorkerId::new(id), name))
    }

    fn count_changes(rx: &mut tokio::sync::broadcast::Receiver<ServerEvent>) -> usize {
        let mut n = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ServerEvent::BrowsersChange { .. }) {
                n += 1;
            }
        }
        n
    }

    #[test]
    fn test_add_and_remove_notify() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let mut registry = WorkerRegistry::new(events);

        assert!(registry.add(worker("1", "Chrome")));
        assert!(registry.add(worker("2", "Firefox")));
        assert!(registry.remove(&WorkerId::new("1")));
        assert!(!registry.remove(&WorkerId::new("1")));

        assert_eq!(registry.len(), 1);
        assert_eq!(count_changes(&mut rx), 3);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut registry = WorkerRegistry::new(EventBus::new());
        assert!(registry.add(worker("1", "Chrome")));
        assert!(!registry.add(worker("1", "Chrome again")));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_by_id(&WorkerId::new("1")).unwrap().name(), "Chrome");
    }

    #[test]
    fn test_readiness() {
        let mut registry = WorkerRegistry::new(EventBus::new());
        let chrome = worker("1", "Chrome");
        registry.add(chrome.clone());
        registry.add(worker("2", "Firefox"));
        assert!(registry.all_ready());

        chrome.transition(WorkerState::Executing).unwrap();
        assert!(!registry.all_ready());

        let not_ready = registry.not_ready();
        assert_eq!(not_ready.len(), 1);
        assert_eq!(not_ready[0].name(), "Chrome");
    }

    #[test]
    fn test_clear_results_then_aggregate_is_zero() {
        let mut registry = WorkerRegistry::new(EventBus::new());
        let chrome = worker("1", "Chrome");
        registry.add(chrome.clone());
        chrome.record(&TestOutcome::passed(1));
        chrome.record(&TestOutcome::failed(1));
        chrome.mark_error();
        chrome.mark_disconnected();

        registry.clear_results();
        let aggregate = registry.aggregate(false, ExitCodePolicy::default());
        assert_eq!(aggregate.success, 0);
        assert_eq!(aggregate.failed, 0);
        assert!(!aggregate.error);
        assert!(!aggregate.disconnected);
    }

    #[test]
    fn test_aggregate_sums_members() {
        let mut registry = WorkerRegistry::new(EventBus::new());
        let chrome = worker("1", "Chrome");
        let firefox = worker("2", "Firefox");
        registry.add(chrome.clone());
        registry.add(firefox.clone());

        chrome.record(&TestOutcome::passed(1));
        chrome.record(&TestOutcome::passed(1));
        firefox.record(&TestOutcome::failed(1));
        firefox.mark_disconnected();

        let aggregate = registry.aggregate(false, ExitCodePolicy::default());
        assert_eq!(aggregate.success, 2);
        assert_eq!(aggregate.failed, 1);
        assert!(aggregate.disconnected);
        assert_eq!(aggregate.exit_code, 1);
    }

    #[test]
    fn test_snapshot_survives_removal() {
        let mut registry = WorkerRegistry::new(EventBus::new());
        let chrome = worker("1", "Chrome");
        registry.add(chrome.clone());
        registry.add(worker("2", "Firefox"));

        let snapshot = registry.snapshot();
        chrome.record(&TestOutcome::passed(3));
        registry.remove(&WorkerId::new("1"));

        assert_eq!(registry.len(), 1);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains(&WorkerId::new("1")));

        let aggregate = snapshot.aggregate(false, ExitCodePolicy::default());
        assert_eq!(aggregate.success, 1);
        assert_eq!(registry.aggregate(false, ExitCodePolicy::default()).success, 0);
    }
}
