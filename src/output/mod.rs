//! Output formatting module
//!
//! Renders run results for the terminal or a file.

mod formatter;

pub use formatter::{write_report_to_file, OutputFormat, ResultFormatter, RunReport, WorkerRow};
