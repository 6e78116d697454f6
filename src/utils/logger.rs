//! Logging utilities
//!
//! Provides logging configuration and helpers.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Log level configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    /// No output at all
    Disable,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Trace => Some(Level::TRACE),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Disable => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            "disable" | "off" => Some(LogLevel::Disable),
            _ => None,
        }
    }

    /// Pick the level from the command line, then the environment or
    /// configuration, falling back to `info`. `--verbose` wins.
    pub fn resolve(verbose: bool, candidates: &[Option<&str>]) -> Self {
        if verbose {
            return LogLevel::Debug;
        }
        candidates
            .iter()
            .flatten()
            .find_map(|s| LogLevel::parse(s))
            .unwrap_or(LogLevel::Info)
    }

    fn directive(self) -> String {
        match self.to_tracing_level() {
            Some(level) => format!("testfleet={level}"),
            None => "off".to_string(),
        }
    }
}

/// Initialize the logger with specified level
pub fn init_logger(level: LogLevel) {
    let filter = EnvFilter::new(level.directive());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("disable"), Some(LogLevel::Disable));
        assert_eq!(LogLevel::parse("unknown"), None);
    }

    #[test]
    fn test_resolve_precedence() {
        assert_eq!(LogLevel::resolve(true, &[Some("error")]), LogLevel::Debug);
        assert_eq!(
            LogLevel::resolve(false, &[None, Some("warn"), Some("error")]),
            LogLevel::Warn
        );
        assert_eq!(LogLevel::resolve(false, &[Some("bogus")]), LogLevel::Info);
        assert_eq!(LogLevel::resolve(false, &[]), LogLevel::Info);
    }

    #[test]
    fn test_directive() {
        assert_eq!(LogLevel::Warn.directive(), "testfleet=WARN");
        assert_eq!(LogLevel::Disable.directive(), "off");
    }
}
