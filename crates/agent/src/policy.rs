//! Per-tool autonomy policy store.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use dashmap::DashMap;
use proto::{AutonomyLevel, ConfigError};
use tracing::{debug, info};

/// Tracks how much trust each tool has been granted.
///
/// Lookups resolve an explicit entry first, then the caller-supplied default
/// for that tool, then [`AutonomyLevel::Ask`]. Writes are visible to every
/// subsequent lookup, from any task.
#[derive(Debug, Default)]
pub struct AutonomyPolicy {
    explicit: DashMap<String, AutonomyLevel>,
    defaults: HashMap<String, AutonomyLevel>,
}

impl AutonomyPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a policy with per-tool fallback levels.
    pub fn with_defaults(defaults: HashMap<String, AutonomyLevel>) -> Self {
        Self {
            explicit: DashMap::new(),
            defaults,
        }
    }

    /// Effective level for a tool.
    pub fn get_policy(&self, tool_name: &str) -> AutonomyLevel {
        if let Some(level) = self.explicit.get(tool_name) {
            return *level;
        }
        self.defaults
            .get(tool_name)
            .copied()
            .unwrap_or(AutonomyLevel::Ask)
    }

    /// Records an explicit level; last write wins.
    pub fn set_policy(&self, tool_name: &str, level: AutonomyLevel) {
        debug!(tool = %tool_name, level = %level, "Setting autonomy level");
        self.explicit.insert(tool_name.to_string(), level);
    }

    /// Explicit entries, sorted by tool name.
    pub fn snapshot(&self) -> BTreeMap<String, AutonomyLevel> {
        self.explicit
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Caller-supplied defaults.
    pub fn defaults(&self) -> &HashMap<String, AutonomyLevel> {
        &self.defaults
    }

    /// Loads explicit entries from a JSON file written by [`save`](Self::save).
    /// A missing file leaves the policy unchanged.
    pub fn load(&self, path: &Path) -> Result<usize, ConfigError> {
        if !path.exists() {
            return Ok(0);
        }
        let raw = std::fs::read_to_string(path)?;
        let entries: BTreeMap<String, AutonomyLevel> =
            serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
                field: path.display().to_string(),
                reason: e.to_string(),
            })?;
        let count = entries.len();
        for (tool, level) in entries {
            self.explicit.insert(tool, level);
        }
        info!(path = %path.display(), count, "Loaded autonomy policy");
        Ok(count)
    }

    /// Writes explicit entries as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.snapshot()).map_err(|e| {
            ConfigError::InvalidValue {
                field: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
