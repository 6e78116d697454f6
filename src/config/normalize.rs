//! Configuration normalization and validation
//!
//! Applied once to the merged configuration, before any worker is launched.

use thiserror::Error;
use tracing::{debug, warn};

use super::OrchestratorConfig;

/// Fatal configuration problems. Each names the offending option.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {option} {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },

    #[error("Invalid configuration: customLaunchers.{name} {reason}")]
    InvalidLauncher { name: String, reason: String },
}

impl ConfigError {
    fn option(option: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidOption {
            option,
            reason: reason.into(),
        }
    }
}

/// Normalize paths and protocols, apply the coupled client defaults, then
/// validate.
pub fn normalize(mut config: OrchestratorConfig) -> Result<OrchestratorConfig, ConfigError> {
    let url_root = normalize_url(&config.url_root);
    if url_root != config.url_root {
        warn!("urlRoot normalized to \"{}\"", url_root);
        config.url_root = url_root;
    }

    config.protocol = normalize_protocol(&config.protocol, "protocol");

    if let Some(proxy) = config.upstream_proxy.as_mut() {
        let path = normalize_url(&proxy.path);
        if path != proxy.path {
            warn!("proxyPath normalized to \"{}\"", path);
            proxy.path = path;
        }
        proxy.protocol = normalize_protocol(&proxy.protocol, "upstream proxy protocol");
    }

    if config.client.run_in_parent {
        debug!("useIframe set to false, because using runInParent");
        config.client.use_iframe = false;
    }

    if !config.single_run && !config.client.use_iframe && config.client.run_in_parent {
        debug!("singleRun set to true, because using runInParent");
        config.single_run = true;
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &OrchestratorConfig) -> Result<(), ConfigError> {
    if config.concurrency == Some(0) {
        return Err(ConfigError::option("concurrency", "must be at least 1"));
    }
    if config.capture_timeout == 0 {
        return Err(ConfigError::option("captureTimeout", "must be a positive number"));
    }
    if config.process_kill_timeout == 0 {
        return Err(ConfigError::option(
            "processKillTimeout",
            "must be a positive number",
        ));
    }
    if config.browser_socket_timeout == 0 {
        return Err(ConfigError::option(
            "browserSocketTimeout",
            "must be a positive number",
        ));
    }
    if config.browsers.iter().any(|name| name.trim().is_empty()) {
        return Err(ConfigError::option(
            "browsers",
            "must not contain empty names",
        ));
    }

    for (name, definition) in &config.custom_launchers {
        match (&definition.base, &definition.command) {
            (None, None) => {
                return Err(ConfigError::InvalidLauncher {
                    name: name.clone(),
                    reason: "needs a base launcher or a command".to_string(),
                })
            }
            (Some(base), _) if base == name => {
                return Err(ConfigError::InvalidLauncher {
                    name: name.clone(),
                    reason: "cannot use itself as base".to_string(),
                })
            }
            _ => {}
        }
    }

    Ok(())
}

/// Ensure a leading and trailing slash
fn normalize_url(url: &str) -> String {
    let mut url = url.to_string();
    if !url.starts_with('/') {
        url.insert(0, '/');
    }
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

/// Force a trailing ':' and fall back to http for anything unsupported
fn normalize_protocol(protocol: &str, label: &str) -> String {
    let scheme = protocol.split(':').next().unwrap_or_default();
    let scheme = if scheme.is_empty() { "http" } else { scheme };

    match scheme {
        "http" | "https" => format!("{scheme}:"),
        other => {
            warn!(
                "\"{}:\" is not a supported {}, defaulting to \"http:\"",
                other, label
            );
            "http:".to_string()
        }
    }
}
