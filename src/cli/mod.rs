//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Test fleet orchestrator
#[derive(Parser, Debug)]
#[command(name = "testfleet")]
#[command(author = "hephaex@gmail.com")]
#[command(version = "0.1.0")]
#[command(about = "Launch test workers, run the suite on all of them and report")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, disable)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the orchestrator and launch workers
    Start(StartArgs),

    /// Ask a running orchestrator to stop
    Stop(StopArgs),

    /// Manage configuration
    Config(ConfigArgs),

    /// List registered launcher types
    Launchers(LaunchersArgs),
}

/// Arguments for start command
#[derive(Parser, Debug)]
pub struct StartArgs {
    /// Configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run once and exit with the run's exit code
    #[arg(long)]
    pub single_run: bool,

    /// Keep running and rerun on request
    #[arg(long, conflicts_with = "single_run")]
    pub no_single_run: bool,

    /// Launchers to start (comma-separated)
    #[arg(short, long, value_delimiter = ',')]
    pub browsers: Option<Vec<String>>,

    /// Maximum number of workers launching at once
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Port workers connect to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Milliseconds a worker has to get captured
    #[arg(long)]
    pub capture_timeout: Option<u64>,

    /// Output format (table, json, json-pretty, csv, summary)
    #[arg(short, long, default_value = "table")]
    pub format: String,

    /// Save results to file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for stop command
#[derive(Parser, Debug)]
pub struct StopArgs {
    /// Configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port of the running server
    #[arg(short, long)]
    pub port: Option<u16>,
}

/// Arguments for config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Create a configuration file with the defaults
    Init {
        /// Output file path
        #[arg(short, long, default_value = "./testfleet.yaml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Show the normalized configuration
    Show {
        /// Configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output format (yaml, json)
        #[arg(short, long, default_value = "yaml")]
        format: String,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show environment variable help
    Env,
}

/// Arguments for launchers command
#[derive(Parser, Debug)]
pub struct LaunchersArgs {
    /// Configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_args() {
        let args = Args::parse_from([
            "testfleet",
            "start",
            "--single-run",
            "--browsers",
            "Chromium,Firefox",
            "--concurrency",
            "2",
        ]);
        match args.command {
            Command::Start(start) => {
                assert!(start.single_run);
                assert_eq!(
                    start.browsers,
                    Some(vec!["Chromium".to_string(), "Firefox".to_string()])
                );
                assert_eq!(start.concurrency, Some(2));
                assert_eq!(start.format, "table");
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_single_run_flags_conflict() {
        let result = Args::try_parse_from(["testfleet", "start", "--single-run", "--no-single-run"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags() {
        let args = Args::parse_from(["testfleet", "stop", "--port", "9877", "--log-level", "disable"]);
        assert_eq!(args.log_level.as_deref(), Some("disable"));
        match args.command {
            Command::Stop(stop) => assert_eq!(stop.port, Some(9877)),
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_config_show() {
        let args = Args::parse_from(["testfleet", "-v", "config", "show", "--format", "json"]);
        assert!(args.verbose);
        match args.command {
            Command::Config(ConfigArgs {
                action: ConfigAction::Show { format, config },
            }) => {
                assert_eq!(format, "json");
                assert!(config.is_none());
            }
            _ => panic!("Expected Config show"),
        }
    }
}
