//! Run execution
//!
//! Barrier coordination of runs across workers and the exit code policy.

mod coordinator;
mod exit_code;

pub use coordinator::{CoordinatorHandle, CoordinatorSettings, RunCoordinator};
pub use exit_code::{ExitCodePolicy, RunAggregate};
