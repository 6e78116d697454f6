//! Launcher catalog
//!
//! Maps launcher names to factories. Populated once at startup and queried by
//! name at launch time.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::config::{ConfigError, LauncherDefinition};
use crate::transport::StdioTransport;

use super::process::{CommandFactory, WorkerFactory};
use super::LaunchError;

/// Launcher used for names that look like a path
pub const SCRIPT_LAUNCHER: &str = "Script";

/// Fully resolved launcher definition
#[derive(Clone, Debug, PartialEq, Eq)]
struct Resolved {
    command: String,
    args: Vec<String>,
}

/// Registered launcher factories
#[derive(Clone, Default)]
pub struct LauncherCatalog {
    factories: BTreeMap<String, Arc<dyn WorkerFactory>>,
    transport: Option<StdioTransport>,
}

impl LauncherCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the catalog from `customLaunchers`, resolving `base` chains
    pub fn from_definitions(
        definitions: &BTreeMap<String, LauncherDefinition>,
        transport: Option<StdioTransport>,
    ) -> Result<Self, ConfigError> {
        let mut catalog = Self {
            factories: BTreeMap::new(),
            transport,
        };

        for (name, definition) in definitions {
            let resolved = resolve(name, definitions, &mut HashSet::new())?;
            let display_name = definition
                .display_name
                .clone()
                .unwrap_or_else(|| name.clone());
            debug!(
                "Registering launcher {} ({} {})",
                name,
                resolved.command,
                resolved.args.join(" ")
            );

            let factory = catalog.command_factory(display_name, resolved.command, resolved.args);
            catalog.register(name.clone(), Arc::new(factory));
        }

        Ok(catalog)
    }

    fn command_factory(&self, display_name: String, command: String, args: Vec<String>) -> CommandFactory {
        let factory = CommandFactory::new(display_name, command).args(args);
        match &self.transport {
            Some(transport) => factory.with_transport(transport.clone()),
            None => factory,
        }
    }

    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn WorkerFactory>) {
        self.factories.insert(name.into(), factory);
    }

    /// Look up a launcher. Names containing `/` run the named script.
    pub fn get(&self, name: &str) -> Result<Arc<dyn WorkerFactory>, LaunchError> {
        if let Some(factory) = self.factories.get(name) {
            return Ok(factory.clone());
        }
        if name.contains('/') {
            debug!("Using {} launcher for {}", SCRIPT_LAUNCHER, name);
            let factory = self.command_factory(name.to_string(), name.to_string(), Vec::new());
            return Ok(Arc::new(factory));
        }
        Err(LaunchError::NotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name) || name.contains('/')
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

fn resolve(
    name: &str,
    definitions: &BTreeMap<String, LauncherDefinition>,
    visiting: &mut HashSet<String>,
) -> Result<Resolved, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidLauncher {
        name: name.to_string(),
        reason,
    };

    if !visiting.insert(name.to_string()) {
        return Err(invalid("has a circular base".to_string()));
    }

    let definition = definitions
        .get(name)
        .ok_or_else(|| invalid("is not defined".to_string()))?;

    let mut resolved = match &definition.base {
        Some(base) if definitions.contains_key(base) => resolve(base, definitions, visiting)?,
        Some(base) => {
            return Err(invalid(format!("extends unknown launcher \"{base}\"")));
        }
        None => Resolved {
            command: String::new(),
            args: Vec::new(),
        },
    };

    if let Some(command) = &definition.command {
        resolved.command = command.clone();
    }
    resolved.args.extend(definition.args.iter().cloned());

    if resolved.command.is_empty() {
        return Err(invalid("has no command".to_string()));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkerId;

    fn definition(base: Option<&str>, command: Option<&str>, args: &[&str]) -> LauncherDefinition {
        LauncherDefinition {
            base: base.map(str::to_string),
            command: command.map(str::to_string),
            args: args.iter().map(|a| a.to_string()).collect(),
            display_name: None,
        }
    }

    #[test]
    fn test_base_chain_inherits_command_and_args() {
        let mut definitions = BTreeMap::new();
        definitions.insert(
            "Chromium".to_string(),
            definition(None, Some("chromium"), &["--no-first-run"]),
        );
        definitions.insert(
            "ChromiumHeadless".to_string(),
            definition(Some("Chromium"), None, &["--headless"]),
        );

        let resolved = resolve("ChromiumHeadless", &definitions, &mut HashSet::new()).unwrap();
        assert_eq!(resolved.command, "chromium");
        assert_eq!(resolved.args, vec!["--no-first-run", "--headless"]);

        let catalog = LauncherCatalog::from_definitions(&definitions, None).unwrap();
        assert_eq!(catalog.names(), vec!["Chromium", "ChromiumHeadless"]);
        assert_eq!(
            catalog.get("ChromiumHeadless").unwrap().display_name(),
            "ChromiumHeadless"
        );
    }

    #[test]
    fn test_display_name_override() {
        let mut definitions = BTreeMap::new();
        let mut node = definition(None, Some("node"), &["runner.js"]);
        node.display_name = Some("Node Runner".to_string());
        definitions.insert("Node".to_string(), node);

        let catalog = LauncherCatalog::from_definitions(&definitions, None).unwrap();
        assert_eq!(catalog.get("Node").unwrap().display_name(), "Node Runner");
    }

    #[test]
    fn test_circular_base_rejected() {
        let mut definitions = BTreeMap::new();
        definitions.insert("A".to_string(), definition(Some("B"), None, &[]));
        definitions.insert("B".to_string(), definition(Some("A"), None, &[]));

        let err = LauncherCatalog::from_definitions(&definitions, None).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidLauncher { .. }));
        assert!(err.to_string().contains("circular"));
    }

    #[test]
    fn test_unknown_base_rejected() {
        let mut definitions = BTreeMap::new();
        definitions.insert("A".to_string(), definition(Some("Opera"), None, &[]));

        let err = LauncherCatalog::from_definitions(&definitions, None).err().unwrap();
        assert!(err.to_string().contains("Opera"));
    }

    #[test]
    fn test_unknown_name_is_not_registered() {
        let catalog = LauncherCatalog::new();
        let err = catalog.get("IE").err().unwrap();
        assert_eq!(err, LaunchError::NotRegistered("IE".to_string()));
        assert!(!catalog.contains("IE"));
    }

    #[test]
    fn test_path_uses_script_launcher() {
        let catalog = LauncherCatalog::new();
        assert!(catalog.contains("./bin/worker.sh"));
        let factory = catalog.get("./bin/worker.sh").unwrap();
        assert_eq!(factory.display_name(), "./bin/worker.sh");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_launcher_spawns_path() {
        let catalog = LauncherCatalog::new();
        let factory = catalog.get("/bin/true").unwrap();
        let mut process = factory
            .spawn(&WorkerId::new("1"), "http://localhost:9876/?id=1")
            .unwrap();
        assert!(!process.wait().await.is_abnormal());
    }
}
