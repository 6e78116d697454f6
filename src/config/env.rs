//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;

/// Environment variable prefix
const ENV_PREFIX: &str = "TESTFLEET";

/// Overrides read from TESTFLEET_* environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Hostname from TESTFLEET_HOSTNAME
    pub hostname: Option<String>,
    /// Port from TESTFLEET_PORT
    pub port: Option<u16>,
    /// Comma-separated launcher names from TESTFLEET_BROWSERS
    pub browsers: Option<Vec<String>>,
    /// Launch concurrency from TESTFLEET_CONCURRENCY
    pub concurrency: Option<usize>,
    /// Single run from TESTFLEET_SINGLE_RUN
    pub single_run: Option<bool>,
    /// Capture timeout (ms) from TESTFLEET_CAPTURE_TIMEOUT
    pub capture_timeout: Option<u64>,
    /// Retry limit from TESTFLEET_RETRY_LIMIT
    pub retry_limit: Option<u32>,
    /// Log level from TESTFLEET_LOG_LEVEL
    pub log_level: Option<String>,
    /// Config file from TESTFLEET_CONFIG
    pub config_file: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            hostname: get_env("HOSTNAME"),
            port: get_env_parse("PORT"),
            browsers: get_env("BROWSERS").map(|v| split_list(&v)),
            concurrency: get_env_parse("CONCURRENCY"),
            single_run: get_env_bool("SINGLE_RUN"),
            capture_timeout: get_env_parse("CAPTURE_TIMEOUT"),
            retry_limit: get_env_parse("RETRY_LIMIT"),
            log_level: get_env("LOG_LEVEL"),
            config_file: get_env("CONFIG"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.hostname.is_some()
            || self.port.is_some()
            || self.browsers.is_some()
            || self.concurrency.is_some()
            || self.single_run.is_some()
            || self.capture_timeout.is_some()
            || self.retry_limit.is_some()
            || self.log_level.is_some()
            || self.config_file.is_some()
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Split a comma-separated list, dropping empty entries
pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Print all TESTFLEET environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_HOSTNAME         Hostname workers connect to");
    println!("  {ENV_PREFIX}_PORT             Server port");
    println!("  {ENV_PREFIX}_BROWSERS         Launchers to start (comma-separated)");
    println!("  {ENV_PREFIX}_CONCURRENCY      Maximum simultaneously launching workers");
    println!("  {ENV_PREFIX}_SINGLE_RUN       Run once and exit (true/false)");
    println!("  {ENV_PREFIX}_CAPTURE_TIMEOUT  Capture timeout in milliseconds");
    println!("  {ENV_PREFIX}_RETRY_LIMIT      Relaunch attempts before a worker fails");
    println!("  {ENV_PREFIX}_LOG_LEVEL        Log level (trace, debug, info, warn, error)");
    println!("  {ENV_PREFIX}_CONFIG           Path to configuration file");
}
