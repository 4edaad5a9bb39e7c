//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SchedulerError};

/// Top-level scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Size of the shared worker pool. Must be at least 1.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// How long `stop()` waits for in-flight tasks before force-cancelling.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Optional directory for task-registry snapshots. When set, the registry
    /// is saved on shutdown and rehydrated on start.
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
}

fn default_max_workers() -> usize {
    4
}
fn default_shutdown_grace_secs() -> u64 {
    5
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            store_dir: None,
        }
    }
}

impl SchedulerConfig {
    /// Load config from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SchedulerError::Validation(format!("failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| SchedulerError::Validation(format!("failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Shutdown grace period as a `Duration`.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Default snapshot directory (~/.taskflow/scheduler).
    pub fn default_store_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskflow")
            .join("scheduler")
    }
}
