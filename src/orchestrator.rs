//! Start command wiring
//!
//! Builds the launcher, transport and run coordinator from the configuration,
//! launches the configured workers and reports every finished run.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::{normalize, EnvConfig, OrchestratorConfig};
use crate::events::{EventBus, InboundEvent, ServerEvent};
use crate::executor::{CoordinatorHandle, CoordinatorSettings, RunCoordinator};
use crate::launcher::{Launcher, LauncherCatalog, LifecycleSettings};
use crate::output::{write_report_to_file, OutputFormat, ResultFormatter, RunReport};
use crate::transport::StdioTransport;

/// Command-line overrides, applied over file and environment settings
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub single_run: Option<bool>,
    pub browsers: Option<Vec<String>>,
    pub concurrency: Option<usize>,
    pub port: Option<u16>,
    pub capture_timeout: Option<u64>,
}

impl Overrides {
    fn apply(&self, config: &mut OrchestratorConfig) {
        if let Some(single_run) = self.single_run {
            config.single_run = single_run;
        }
        if let Some(browsers) = &self.browsers {
            config.browsers = browsers.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = Some(concurrency);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(timeout) = self.capture_timeout {
            config.capture_timeout = timeout;
        }
    }
}

/// Load, merge and normalize the configuration.
///
/// Precedence: defaults < file < environment < command line.
pub fn resolve_config(
    path: Option<&Path>,
    env: &EnvConfig,
    overrides: &Overrides,
) -> Result<OrchestratorConfig> {
    let env_path = env.config_file.as_ref().map(PathBuf::from);
    let path = path.or(env_path.as_deref());

    let mut config = OrchestratorConfig::load_or_default(path)?;
    config.apply_env(env);
    overrides.apply(&mut config);

    let config = normalize(config)?;
    debug!("Using configuration: {:?}", config);
    Ok(config)
}

/// Build the launcher catalog, reporting launcher definition errors early
pub fn catalog(config: &OrchestratorConfig, transport: Option<StdioTransport>) -> Result<LauncherCatalog> {
    let catalog = LauncherCatalog::from_definitions(&config.custom_launchers, transport)?;
    Ok(catalog)
}

/// How finished runs are reported
#[derive(Clone, Debug)]
pub struct ReportOptions {
    pub format: OutputFormat,
    pub output: Option<PathBuf>,
    pub colorize: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Table,
            output: None,
            colorize: true,
        }
    }
}

/// Run the orchestrator until the single run finishes or the process is
/// interrupted. Returns the process exit code.
pub async fn start(config: OrchestratorConfig, report: ReportOptions) -> Result<i32> {
    let events = EventBus::new();
    let mut observer = events.subscribe();

    let (mailbox, inbox) = mpsc::unbounded_channel();
    let transport = StdioTransport::new(mailbox.clone(), config.socket_timeout());

    let settings = LifecycleSettings {
        capture_timeout: config.capture_timeout(),
        retry_limit: config.retry_limit,
        kill_timeout: config.process_kill_timeout(),
    };
    let launcher = Arc::new(
        Launcher::new(
            catalog(&config, Some(transport.clone()))?,
            settings,
            config.target_url(),
            events.clone(),
        )
        .with_mailbox(mailbox.clone()),
    );

    let coordinator = RunCoordinator::new(
        CoordinatorSettings::from_config(&config),
        events.clone(),
        Arc::new(transport),
    )
    .with_launcher(launcher.clone());
    let coordinator = CoordinatorHandle::spawn(coordinator, mailbox, inbox);

    if config.browsers.is_empty() {
        coordinator.send(InboundEvent::ScheduleRequested);
        if config.single_run {
            error!("No browsers to launch in single run mode");
            coordinator.stop();
            return Ok(1);
        }
    }

    let batch = {
        let launcher = launcher.clone();
        let names = config.browsers.clone();
        let concurrency = config.concurrency;
        tokio::spawn(async move { launcher.launch(&names, concurrency).await })
    };

    let exit_code = observe(&config, &report, &mut observer, &coordinator).await;

    launcher.kill_all().await;
    batch.abort();
    coordinator.stop();

    exit_code
}

async fn observe(
    config: &OrchestratorConfig,
    report: &ReportOptions,
    observer: &mut broadcast::Receiver<ServerEvent>,
    coordinator: &CoordinatorHandle,
) -> Result<i32> {
    let mut last_exit_code = 0;

    loop {
        let event = tokio::select! {
            event = observer.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                return Ok(if config.single_run { 1 } else { last_exit_code });
            }
        };

        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Reporter fell behind, skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(last_exit_code),
        };

        match event {
            ServerEvent::RunComplete { workers, aggregate } => {
                last_exit_code = aggregate.exit_code;
                print_report(report, RunReport::new(&workers, aggregate))?;
                if config.single_run {
                    return Ok(last_exit_code);
                }
            }
            ServerEvent::LaunchBatchEnd { launched, failed, .. } => {
                debug!("Launch batch finished: {} launched, {} failed", launched, failed);
                // Some workers will never be captured; run on the ones that were
                if !config.single_run && failed > 0 && launched > 0 {
                    coordinator.send(InboundEvent::ScheduleRequested);
                }
            }
            ServerEvent::BrowserComplete { name, id, result } => {
                debug!(
                    "{} (id {}) completed: {} success, {} failed",
                    name, id, result.success, result.failed
                );
            }
            other => debug!("Event {}", other.name()),
        }
    }
}

fn print_report(options: &ReportOptions, report: RunReport) -> Result<()> {
    let mut formatter = ResultFormatter::new(options.format);
    if !options.colorize {
        formatter = formatter.no_color();
    }
    println!("{}", formatter.format_report(&report)?);

    if let Some(path) = &options.output {
        write_report_to_file(path, &report, options.format)
            .with_context(|| format!("Failed to save results to {}", path.display()))?;
        info!("Results saved to {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LauncherDefinition;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn report() -> ReportOptions {
        ReportOptions {
            format: OutputFormat::Summary,
            output: None,
            colorize: false,
        }
    }

    #[test]
    fn test_resolve_config_precedence() {
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(file, "port: 9000\nbrowsers: [Chromium]\nurlRoot: fleet\nretryLimit: 5").unwrap();

        let env = EnvConfig {
            port: Some(9100),
            retry_limit: Some(1),
            ..Default::default()
        };
        let overrides = Overrides {
            port: Some(9200),
            ..Default::default()
        };

        let config = resolve_config(Some(file.path()), &env, &overrides).unwrap();
        assert_eq!(config.port, 9200);
        assert_eq!(config.retry_limit, 1);
        assert_eq!(config.browsers, vec!["Chromium"]);
        assert_eq!(config.url_root, "/fleet/");
    }

    #[test]
    fn test_invalid_config_names_option() {
        let overrides = Overrides {
            concurrency: Some(0),
            ..Default::default()
        };
        let err = resolve_config(None, &EnvConfig::default(), &overrides).unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[tokio::test]
    async fn test_single_run_without_browsers_fails() {
        let config = OrchestratorConfig {
            single_run: true,
            ..Default::default()
        };
        assert_eq!(start(config, report()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_single_run_all_failed_to_start() {
        let mut config = OrchestratorConfig {
            single_run: true,
            retry_limit: 0,
            browsers: vec!["Missing".to_string()],
            ..Default::default()
        };
        config.custom_launchers.insert(
            "Missing".to_string(),
            LauncherDefinition {
                command: Some("/nonexistent/testfleet-worker".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(start(config, report()).await.unwrap(), 1);
    }

    #[cfg(unix)]
    fn script_worker(script: &str) -> OrchestratorConfig {
        let mut config = OrchestratorConfig {
            single_run: true,
            browsers: vec!["Shell".to_string()],
            process_kill_timeout: 200,
            ..Default::default()
        };
        config.custom_launchers.insert(
            "Shell".to_string(),
            LauncherDefinition {
                command: Some("sh".to_string()),
                args: vec!["-c".to_string(), script.to_string(), "{url}".to_string()],
                ..Default::default()
            },
        );
        config
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_single_run_with_script_worker() {
        let script = r#"
echo '{"type":"register"}'
read command
echo '{"type":"start","total":2}'
echo '{"type":"result","success":true,"time":1}'
echo '{"type":"result","success":false,"time":2}'
echo '{"type":"complete"}'
exec sleep 30
"#;
        assert_eq!(start(script_worker(script), report()).await.unwrap(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_single_run_runs_healthy_worker_next_to_failed_one() {
        let script = r#"
echo '{"type":"register"}'
read command
echo '{"type":"result","success":true,"time":1}'
echo '{"type":"complete"}'
exec sleep 30
"#;
        let mut config = script_worker(script);
        config.retry_limit = 0;
        config.browsers.push("Missing".to_string());
        config.custom_launchers.insert(
            "Missing".to_string(),
            LauncherDefinition {
                command: Some("/nonexistent/testfleet-worker".to_string()),
                ..Default::default()
            },
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = ReportOptions {
            format: OutputFormat::Json,
            output: Some(path.clone()),
            colorize: false,
        };

        assert_eq!(start(config, report).await.unwrap(), 1);

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let workers = saved["workers"].as_array().unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0]["success"], 1);
        assert_eq!(saved["aggregate"]["exitCode"], 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_single_run_passing_suite_exits_zero() {
        let script = r#"
echo '{"type":"register","name":"sh worker"}'
read command
echo '{"type":"result","success":true,"time":1}'
echo '{"type":"complete"}'
exec sleep 30
"#;
        assert_eq!(start(script_worker(script), report()).await.unwrap(), 0);
    }
}
