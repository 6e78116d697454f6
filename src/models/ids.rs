//! Worker identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque worker identifier, unique within the orchestrator's lifetime
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Generates worker ids.
///
/// Starts from a random offset so ids from consecutive orchestrator processes
/// are unlikely to collide, then counts upward so an id is never handed out
/// twice by the same generator.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        let seed = u64::from(rand::random::<u32>() % 100_000_000);
        Self {
            next: AtomicU64::new(seed),
        }
    }

    /// Create a generator with a fixed starting point
    pub fn starting_at(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed),
        }
    }

    pub fn next_id(&self) -> WorkerId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        WorkerId(n.to_string())
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_ids_are_unique() {
        let generator = IdGenerator::new();
        let ids: HashSet<WorkerId> = (0..1000).map(|_| generator.next_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_seeded_generator() {
        let generator = IdGenerator::starting_at(41);
        assert_eq!(generator.next_id().as_str(), "41");
        assert_eq!(generator.next_id().as_str(), "42");
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = WorkerId::new("1234");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"1234\"");
    }
}
