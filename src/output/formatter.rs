//! Output formatters for run results
//!
//! Provides Table, JSON, CSV, and summary output formats.

use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

use crate::executor::RunAggregate;
use crate::models::WorkerResult;
use crate::registry::RegistrySnapshot;

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Csv,
    Summary,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "table" => Some(OutputFormat::Table),
            "json" => Some(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Some(OutputFormat::JsonPretty),
            "csv" => Some(OutputFormat::Csv),
            "summary" => Some(OutputFormat::Summary),
            _ => None,
        }
    }
}

/// One worker's line in a report
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRow {
    pub name: String,
    pub id: String,
    #[serde(flatten)]
    pub result: WorkerResult,
}

/// Results of one finished run
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub workers: Vec<WorkerRow>,
    pub aggregate: RunAggregate,
}

impl RunReport {
    pub fn new(snapshot: &RegistrySnapshot, aggregate: RunAggregate) -> Self {
        let workers = snapshot
            .results()
            .into_iter()
            .map(|(name, id, result)| WorkerRow {
                name,
                id: id.to_string(),
                result,
            })
            .collect();
        Self { workers, aggregate }
    }

    pub fn skipped(&self) -> u32 {
        self.workers.iter().map(|w| w.result.skipped).sum()
    }
}

/// Result formatter
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    pub fn format_report(&self, report: &RunReport) -> Result<String> {
        match self.format {
            OutputFormat::Table => Ok(self.format_table(report)),
            OutputFormat::Json => Ok(serde_json::to_string(report)?),
            OutputFormat::JsonPretty => Ok(serde_json::to_string_pretty(report)?),
            OutputFormat::Csv => format_csv(report),
            OutputFormat::Summary => Ok(self.format_summary(report)),
        }
    }

    fn paint(&self, text: String, color: &str) -> String {
        if self.colorize {
            format!("\x1b[{color}m{text}\x1b[0m")
        } else {
            text
        }
    }

    fn status(&self, result: &WorkerResult) -> String {
        if result.disconnected {
            self.paint("DISCONNECTED".to_string(), "31")
        } else if result.error {
            self.paint("ERROR".to_string(), "31")
        } else if result.failed > 0 {
            self.paint("FAILED".to_string(), "31")
        } else {
            self.paint("SUCCESS".to_string(), "32")
        }
    }

    fn format_table(&self, report: &RunReport) -> String {
        let mut output = String::new();

        output.push_str(
            "\n┌──────────────────────────────┬─────────┬────────┬─────────┬───────────┬─────────────┐\n",
        );
        output.push_str(
            "│ Browser                      │ Success │ Failed │ Skipped │  Net (ms) │ Status      │\n",
        );
        output.push_str(
            "├──────────────────────────────┼─────────┼────────┼─────────┼───────────┼─────────────┤\n",
        );

        for row in &report.workers {
            let label = format!("{} ({})", row.name, row.id);
            output.push_str(&format!(
                "│ {:28} │ {:7} │ {:6} │ {:7} │ {:9} │ {:11} │\n",
                truncate(&label, 28),
                row.result.success,
                row.result.failed,
                row.result.skipped,
                row.result.net_time,
                self.status(&row.result)
            ));
        }

        output.push_str(
            "└──────────────────────────────┴─────────┴────────┴─────────┴───────────┴─────────────┘\n",
        );
        output.push_str(&self.format_summary(report));
        output.push('\n');
        output
    }

    fn format_summary(&self, report: &RunReport) -> String {
        let aggregate = &report.aggregate;
        let mut flags = Vec::new();
        if aggregate.error {
            flags.push("error");
        }
        if aggregate.disconnected {
            flags.push("disconnected");
        }

        let failed = if aggregate.failed > 0 {
            self.paint(format!("{} FAILED", aggregate.failed), "31")
        } else {
            "0 failed".to_string()
        };

        let mut line = format!(
            "Executed {} tests on {} browsers: {} SUCCESS, {}, {} skipped",
            aggregate.executed(),
            report.workers.len(),
            aggregate.success,
            failed,
            report.skipped()
        );
        if !flags.is_empty() {
            line.push_str(&format!(" ({})", flags.join(", ")));
        }
        line.push_str(&format!(" - exit code {}", aggregate.exit_code));
        line
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}

fn format_csv(report: &RunReport) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "browser",
        "id",
        "total",
        "success",
        "failed",
        "skipped",
        "net_time_ms",
        "total_time_ms",
        "error",
        "disconnected",
    ])?;

    for row in &report.workers {
        writer.write_record([
            row.name.clone(),
            row.id.clone(),
            row.result.total.to_string(),
            row.result.success.to_string(),
            row.result.failed.to_string(),
            row.result.skipped.to_string(),
            row.result.net_time.to_string(),
            row.result.total_time.to_string(),
            row.result.error.to_string(),
            row.result.disconnected.to_string(),
        ])?;
    }

    let bytes = writer.into_inner().context("Failed to flush CSV output")?;
    String::from_utf8(bytes).context("CSV output is not UTF-8")
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let cut: String = text.chars().take(width.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}

/// Write a report to a file
pub fn write_report_to_file(path: &Path, report: &RunReport, format: OutputFormat) -> Result<()> {
    let content = ResultFormatter::new(format).no_color().format_report(report)?;

    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(content.as_bytes())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TestOutcome, Worker, WorkerId};
    use crate::registry::WorkerRegistry;
    use crate::events::EventBus;
    use crate::executor::ExitCodePolicy;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn report() -> RunReport {
        let mut registry = WorkerRegistry::new(EventBus::new());
        let chrome = Arc::new(Worker::connected(WorkerId::new("1"), "Chrome, 120"));
        chrome.record(&TestOutcome::passed(4));
        chrome.record(&TestOutcome::failed(6));
        let firefox = Arc::new(Worker::connected(WorkerId::new("2"), "Firefox"));
        firefox.record(&TestOutcome::skipped());
        registry.add(chrome);
        registry.add(firefox);

        let snapshot = registry.snapshot();
        let aggregate = snapshot.aggregate(false, ExitCodePolicy::default());
        RunReport::new(&snapshot, aggregate)
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!(OutputFormat::parse("json"), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::parse("TABLE"), Some(OutputFormat::Table));
        assert_eq!(OutputFormat::parse("unknown"), None);
    }

    #[test]
    fn test_summary_line() {
        let output = ResultFormatter::new(OutputFormat::Summary)
            .no_color()
            .format_report(&report())
            .unwrap();
        assert_eq!(
            output,
            "Executed 2 tests on 2 browsers: 1 SUCCESS, 1 FAILED, 1 skipped - exit code 1"
        );
    }

    #[test]
    fn test_table_lists_every_worker() {
        let output = ResultFormatter::new(OutputFormat::Table)
            .no_color()
            .format_report(&report())
            .unwrap();
        assert!(output.contains("Chrome, 120 (1)"));
        assert!(output.contains("Firefox (2)"));
        assert!(output.contains("FAILED"));
    }

    #[test]
    fn test_json_flattens_results() {
        let output = ResultFormatter::new(OutputFormat::Json)
            .format_report(&report())
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(json["workers"][0]["name"], "Chrome, 120");
        assert_eq!(json["workers"][0]["netTime"], 10);
        assert_eq!(json["aggregate"]["exitCode"], 1);
    }

    #[test]
    fn test_csv_quotes_names() {
        let output = ResultFormatter::new(OutputFormat::Csv)
            .format_report(&report())
            .unwrap();
        let mut lines = output.lines();
        assert!(lines.next().unwrap().starts_with("browser,id,total"));
        assert!(lines.next().unwrap().starts_with("\"Chrome, 120\",1,"));
    }

    #[test]
    fn test_write_report_to_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_report_to_file(&path, &report(), OutputFormat::JsonPretty).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"exitCode\": 1"));
    }
}
