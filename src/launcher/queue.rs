//! Bounded-concurrency launch queue
//!
//! Tasks start in submission order with at most `concurrency` in flight.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error};

use crate::models::WorkerId;

use super::LaunchError;

/// One worker to launch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchTask {
    pub worker_id: WorkerId,
    pub target_name: String,
}

impl LaunchTask {
    pub fn new(worker_id: WorkerId, target_name: impl Into<String>) -> Self {
        Self {
            worker_id,
            target_name: target_name.into(),
        }
    }
}

/// Outcome of a whole batch
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub last_error: Option<String>,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Runs launch tasks with an optional concurrency bound
#[derive(Clone, Debug, Default)]
pub struct LaunchQueue {
    concurrency: Option<usize>,
}

impl LaunchQueue {
    /// `None` means unbounded
    pub fn new(concurrency: Option<usize>) -> Self {
        Self { concurrency }
    }

    pub fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    /// Run every task and resolve once all of them have finished, failures
    /// included. A failing task never stops its siblings.
    pub async fn run<F, Fut>(&self, tasks: Vec<LaunchTask>, launch: F) -> BatchSummary
    where
        F: Fn(LaunchTask) -> Fut,
        Fut: Future<Output = Result<(), LaunchError>> + Send + 'static,
    {
        let permits = self
            .concurrency
            .unwrap_or(Semaphore::MAX_PERMITS)
            .clamp(1, Semaphore::MAX_PERMITS);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut handles = Vec::with_capacity(tasks.len());

        for task in tasks {
            // Acquiring here keeps start order equal to submission order
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            debug!("Launching {} as {}", task.target_name, task.worker_id);
            let fut = launch(task);
            handles.push(tokio::spawn(async move {
                let result = fut.await;
                drop(permit);
                result
            }));
        }

        let mut summary = BatchSummary::default();
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(())) => summary.succeeded += 1,
                Ok(Err(err)) => {
                    summary.failed += 1;
                    summary.last_error = Some(err.to_string());
                }
                Err(err) => {
                    error!("Launch task panicked: {}", err);
                    summary.failed += 1;
                    summary.last_error = Some(err.to_string());
                }
            }
        }

        summary
    }
}
