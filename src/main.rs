//! testfleet - launch test workers and run a suite across all of them
//!
//! Launches worker processes (browsers or any program speaking the worker
//! protocol), waits until every worker is captured, runs the suite on all of
//! them at once and turns the combined results into an exit code.
//!
//! ## Features
//!
//! - Bounded-concurrency launching with capture timeout and crash retry
//! - Run barrier with exactly one completion per run
//! - Disconnect tolerance and inactivity detection
//! - Multiple output formats (Table, JSON, CSV)
//!
//! ## Usage
//!
//! ```bash
//! # Launch two workers, run once and exit with the result
//! testfleet start --single-run --browsers ChromiumHeadless,Firefox
//!
//! # Stop a running orchestrator
//! testfleet stop --port 9876
//!
//! # Show the normalized configuration
//! testfleet config show
//!
//! # List launcher types from the configuration
//! testfleet launchers
//! ```

use anyhow::Result;
use clap::Parser;
use std::path::Path;

mod cli;
mod config;
mod events;
mod executor;
mod http;
mod launcher;
mod models;
mod orchestrator;
mod output;
mod registry;
mod transport;
mod utils;

use cli::Args;
use config::{EnvConfig, OrchestratorConfig};
use orchestrator::{Overrides, ReportOptions};
use output::OutputFormat;
use utils::logger::{init_logger, LogLevel};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let env = EnvConfig::load();

    // Initialize logging
    let level = LogLevel::resolve(
        args.verbose,
        &[args.log_level.as_deref(), env.log_level.as_deref()],
    );
    init_logger(level);

    let code = match args.command {
        cli::Command::Start(start_args) => run_start(start_args, &env).await?,
        cli::Command::Stop(stop_args) => run_stop(stop_args, &env).await?,
        cli::Command::Config(config_args) => manage_config(config_args, &env)?,
        cli::Command::Launchers(launcher_args) => list_launchers(launcher_args, &env)?,
    };

    std::process::exit(code);
}

async fn run_start(args: cli::StartArgs, env: &EnvConfig) -> Result<i32> {
    let single_run = match (args.single_run, args.no_single_run) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    };
    let overrides = Overrides {
        single_run,
        browsers: args.browsers,
        concurrency: args.concurrency,
        port: args.port,
        capture_timeout: args.capture_timeout,
    };

    let config = orchestrator::resolve_config(args.config.as_deref(), env, &overrides)?;
    let format = OutputFormat::parse(&args.format)
        .ok_or_else(|| anyhow::anyhow!("Unknown output format: {}", args.format))?;

    orchestrator::start(
        config,
        ReportOptions {
            format,
            output: args.output,
            colorize: true,
        },
    )
    .await
}

async fn run_stop(args: cli::StopArgs, env: &EnvConfig) -> Result<i32> {
    let overrides = Overrides {
        port: args.port,
        ..Default::default()
    };
    let config = orchestrator::resolve_config(args.config.as_deref(), env, &overrides)?;
    http::stop(&config).await
}

fn manage_config(args: cli::ConfigArgs, env: &EnvConfig) -> Result<i32> {
    match args.action {
        cli::ConfigAction::Init { output, force } => {
            if output.exists() && !force {
                anyhow::bail!(
                    "Configuration file already exists: {}. Use --force to overwrite.",
                    output.display()
                );
            }

            OrchestratorConfig::default().save(&output)?;
            println!("✓ Configuration file created: {}", output.display());
            println!("\nEdit the file to customize your settings.");
        }

        cli::ConfigAction::Show { config, format } => {
            let config =
                orchestrator::resolve_config(config.as_deref(), env, &Overrides::default())?;
            let output = if format == "json" {
                serde_json::to_string_pretty(&config)?
            } else {
                serde_yaml::to_string(&config)?
            };
            println!("{output}");
        }

        cli::ConfigAction::Validate { config } => {
            let path = config.or_else(OrchestratorConfig::find);
            let label = path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(defaults)".to_string());

            let result = orchestrator::resolve_config(path.as_deref(), env, &Overrides::default())
                .and_then(|config| orchestrator::catalog(&config, None).map(|_| ()));
            match result {
                Ok(()) => println!("✓ Configuration is valid: {label}"),
                Err(e) => {
                    println!("✗ Configuration is invalid: {label}");
                    println!("  Error: {e:#}");
                    return Ok(1);
                }
            }
        }

        cli::ConfigAction::Env => {
            config::print_env_help();
        }
    }

    Ok(0)
}

fn list_launchers(args: cli::LaunchersArgs, env: &EnvConfig) -> Result<i32> {
    let config = orchestrator::resolve_config(args.config.as_deref(), env, &Overrides::default())?;
    let catalog = orchestrator::catalog(&config, None)?;

    println!("Registered launchers:");
    println!("{:-<60}", "");
    for name in catalog.names() {
        let display = catalog
            .get(&name)
            .map(|factory| factory.display_name().to_string())
            .unwrap_or_default();
        println!("  {:24} - {}", name, display);
    }
    println!();
    println!("  Any path containing '/' runs as a script worker.");

    print_config_source(args.config.as_deref());
    Ok(0)
}

fn print_config_source(path: Option<&Path>) {
    match path.map(Path::to_path_buf).or_else(OrchestratorConfig::find) {
        Some(path) => println!("\nConfiguration: {}", path.display()),
        None => println!("\nConfiguration: built-in defaults"),
    }
}
