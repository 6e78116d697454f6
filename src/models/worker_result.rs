//! Per-worker result accumulator
//!
//! A fresh [`WorkerResult`] is created for every run and replaced, never
//! reset in place, when results are cleared.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Outcome of a single test case as reported by a worker
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub skipped: bool,
    /// Execution time in milliseconds
    #[serde(default)]
    pub time: u64,
}

impl TestOutcome {
    pub fn passed(time: u64) -> Self {
        Self {
            success: true,
            time,
            ..Default::default()
        }
    }

    pub fn failed(time: u64) -> Self {
        Self {
            time,
            ..Default::default()
        }
    }

    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// Counters and timing for one worker over one run
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    #[serde(skip)]
    started: Instant,
    pub start_time: DateTime<Utc>,
    pub total: u32,
    pub skipped: u32,
    pub success: u32,
    pub failed: u32,
    pub net_time: u64,
    pub total_time: u64,
    pub disconnected: bool,
    pub error: bool,
}

impl WorkerResult {
    pub fn new() -> Self {
        Self::with_total(0)
    }

    /// Create a result expecting `total` test cases
    pub fn with_total(total: u32) -> Self {
        Self {
            started: Instant::now(),
            start_time: Utc::now(),
            total,
            skipped: 0,
            success: 0,
            failed: 0,
            net_time: 0,
            total_time: 0,
            disconnected: false,
            error: false,
        }
    }

    /// Count one test case outcome
    pub fn add(&mut self, outcome: &TestOutcome) {
        if outcome.skipped {
            self.skipped += 1;
        } else if outcome.success {
            self.success += 1;
        } else {
            self.failed += 1;
        }

        self.net_time += outcome.time;
    }

    /// Freeze total time as the wall time elapsed since creation
    pub fn finish(&mut self) {
        self.total_time = self.started.elapsed().as_millis() as u64;
    }

    pub fn executed(&self) -> u32 {
        self.success + self.failed
    }
}

impl Default for WorkerResult {
    fn default() -> Self {
        Self::new()
    }
}
