//! Utility functions and helpers

pub mod logger;
