//! Data models for worker orchestration
//!
//! Worker identities, lifecycle states and per-run result accumulators.

mod ids;
mod worker;
mod worker_result;

pub use ids::{IdGenerator, WorkerId};
pub use worker::{StateError, Worker, WorkerState};
pub use worker_result::{TestOutcome, WorkerResult};
