//! Configuration module
//!
//! Loads the orchestrator configuration from YAML or JSON, layers environment
//! and command-line overrides on top, then normalizes and validates it once.

#![allow(dead_code)]

mod env;
mod normalize;

pub use env::{print_env_help, EnvConfig};
pub use normalize::{normalize, ConfigError};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration file locations (in order of precedence)
const CONFIG_LOCATIONS: &[&str] = &[
    "./testfleet.yaml",
    "./testfleet.yml",
    "./.testfleet.yaml",
    "~/.config/testfleet/config.yaml",
];

pub const DEFAULT_PORT: u16 = 9876;
pub const DEFAULT_HOSTNAME: &str = "localhost";
pub const DEFAULT_PROXY_PORT: u16 = 9875;

/// Orchestrator configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Protocol workers use to reach the server, always ending with ':'
    pub protocol: String,
    pub hostname: String,
    pub port: u16,
    pub url_root: String,
    pub upstream_proxy: Option<UpstreamProxy>,

    /// Launcher names to start
    pub browsers: Vec<String>,
    /// Maximum simultaneously launching workers, unbounded when unset
    pub concurrency: Option<usize>,

    /// Milliseconds a launched worker has to get captured
    pub capture_timeout: u64,
    /// Relaunch attempts after a failure before capture
    pub retry_limit: u32,
    /// Milliseconds between a graceful termination request and a hard kill
    pub process_kill_timeout: u64,
    /// Milliseconds a disconnected worker has to reconnect mid-run
    pub browser_disconnect_timeout: u64,
    /// Disconnects tolerated per run before the worker counts as lost
    pub browser_disconnect_tolerance: u32,
    /// Milliseconds without any message from an executing worker
    pub browser_no_activity_timeout: u64,
    /// Milliseconds allowed for a transport write to a worker
    pub browser_socket_timeout: u64,

    pub single_run: bool,
    pub fail_on_empty_test_suite: bool,
    pub fail_on_failing_test_suite: bool,

    /// Options sent to workers with every execute command
    pub client: ClientOptions,
    /// User-defined launcher types
    pub custom_launchers: BTreeMap<String, LauncherDefinition>,

    pub log_level: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            protocol: "http:".to_string(),
            hostname: DEFAULT_HOSTNAME.to_string(),
            port: DEFAULT_PORT,
            url_root: "/".to_string(),
            upstream_proxy: None,
            browsers: Vec::new(),
            concurrency: None,
            capture_timeout: 60_000,
            retry_limit: 2,
            process_kill_timeout: 2_000,
            browser_disconnect_timeout: 2_000,
            browser_disconnect_tolerance: 0,
            browser_no_activity_timeout: 30_000,
            browser_socket_timeout: 20_000,
            single_run: false,
            fail_on_empty_test_suite: true,
            fail_on_failing_test_suite: true,
            client: ClientOptions::default(),
            custom_launchers: BTreeMap::new(),
            log_level: None,
        }
    }
}

impl OrchestratorConfig {
    /// Find configuration file in standard locations
    pub fn find() -> Option<PathBuf> {
        CONFIG_LOCATIONS
            .iter()
            .map(|location| expand_path(location))
            .find(|path| path.exists())
    }

    /// Load from an explicit path, a standard location, or fall back to defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::find() {
                Some(found) => Self::load(&found),
                None => Ok(Self::default()),
            },
        }
    }

    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?
        };

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self, env: &EnvConfig) {
        if let Some(hostname) = &env.hostname {
            self.hostname = hostname.clone();
        }
        if let Some(port) = env.port {
            self.port = port;
        }
        if let Some(browsers) = &env.browsers {
            self.browsers = browsers.clone();
        }
        if let Some(concurrency) = env.concurrency {
            self.concurrency = Some(concurrency);
        }
        if let Some(single_run) = env.single_run {
            self.single_run = single_run;
        }
        if let Some(timeout) = env.capture_timeout {
            self.capture_timeout = timeout;
        }
        if let Some(limit) = env.retry_limit {
            self.retry_limit = limit;
        }
        if let Some(level) = &env.log_level {
            self.log_level = Some(level.clone());
        }
    }

    /// Address workers are pointed at, rewritten through the upstream proxy
    /// when one is configured
    pub fn target_url(&self) -> String {
        match &self.upstream_proxy {
            Some(proxy) => format!(
                "{}//{}:{}{}{}",
                proxy.protocol,
                proxy.hostname,
                proxy.port,
                proxy.path,
                self.url_root.strip_prefix('/').unwrap_or(&self.url_root)
            ),
            None => format!(
                "{}//{}:{}{}",
                self.protocol, self.hostname, self.port, self.url_root
            ),
        }
    }

    /// Address of the server itself, ignoring any proxy
    pub fn server_url(&self) -> String {
        format!(
            "{}//{}:{}{}",
            self.protocol, self.hostname, self.port, self.url_root
        )
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout)
    }

    pub fn process_kill_timeout(&self) -> Duration {
        Duration::from_millis(self.process_kill_timeout)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.browser_disconnect_timeout)
    }

    pub fn no_activity_timeout(&self) -> Duration {
        Duration::from_millis(self.browser_no_activity_timeout)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.browser_socket_timeout)
    }
}

/// Upstream proxy the workers connect through
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamProxy {
    #[serde(default = "default_proxy_protocol")]
    pub protocol: String,
    #[serde(default = "default_proxy_hostname")]
    pub hostname: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default = "default_proxy_path")]
    pub path: String,
}

fn default_proxy_protocol() -> String {
    "http:".to_string()
}

fn default_proxy_hostname() -> String {
    DEFAULT_HOSTNAME.to_string()
}

fn default_proxy_port() -> u16 {
    DEFAULT_PROXY_PORT
}

fn default_proxy_path() -> String {
    "/".to_string()
}

impl Default for UpstreamProxy {
    fn default() -> Self {
        Self {
            protocol: default_proxy_protocol(),
            hostname: default_proxy_hostname(),
            port: default_proxy_port(),
            path: default_proxy_path(),
        }
    }
}

/// Options forwarded to workers with the execute command.
///
/// Keys missing from the configuration keep their defaults; unknown keys are
/// passed through untouched for the test framework running in the worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientOptions {
    pub args: Vec<String>,
    pub use_iframe: bool,
    pub run_in_parent: bool,
    pub capture_console: bool,
    pub clear_context: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            use_iframe: true,
            run_in_parent: false,
            capture_console: true,
            clear_context: true,
            extra: BTreeMap::new(),
        }
    }
}

/// A user-defined launcher type
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LauncherDefinition {
    /// Launcher this one derives from
    pub base: Option<String>,
    /// Program to run
    pub command: Option<String>,
    /// Extra arguments; `{url}` is replaced with the target address
    pub args: Vec<String>,
    pub display_name: Option<String>,
}

/// Expand ~ in path
fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.port, 9876);
        assert_eq!(config.capture_timeout, 60_000);
        assert_eq!(config.retry_limit, 2);
        assert!(config.concurrency.is_none());
        assert!(config.fail_on_empty_test_suite);
        assert!(config.client.use_iframe);
    }

    #[test]
    fn test_target_url() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.target_url(), "http://localhost:9876/");
    }

    #[test]
    fn test_target_url_through_proxy() {
        let config = OrchestratorConfig {
            url_root: "/__runner__/".to_string(),
            upstream_proxy: Some(UpstreamProxy {
                protocol: "https:".to_string(),
                hostname: "proxy.internal".to_string(),
                port: 8443,
                path: "/tests/".to_string(),
            }),
            ..Default::default()
        };
        assert_eq!(
            config.target_url(),
            "https://proxy.internal:8443/tests/__runner__/"
        );
        assert_eq!(config.server_url(), "http://localhost:9876/__runner__/");
    }

    #[test]
    fn test_load_partial_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("testfleet.yaml");
        std::fs::write(
            &path,
            "browsers: [Chrome, Firefox]\nconcurrency: 2\nclient:\n  runInParent: true\n  jasmine:\n    random: false\n",
        )
        .unwrap();

        let config = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(config.browsers, vec!["Chrome", "Firefox"]);
        assert_eq!(config.concurrency, Some(2));
        assert!(config.client.run_in_parent);
        assert!(config.client.capture_console);
        assert!(config.client.extra.contains_key("jasmine"));
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_save_and_load_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("testfleet.json");
        let config = OrchestratorConfig {
            single_run: true,
            retry_limit: 5,
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let result = OrchestratorConfig::load("/nonexistent/testfleet.yaml");
        assert!(result.is_err());
    }
}
