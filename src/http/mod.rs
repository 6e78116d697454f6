//! HTTP client module
//!
//! Talks to a running orchestrator over HTTP.

mod stop;

pub use stop::{stop, StopClient, StopError};
