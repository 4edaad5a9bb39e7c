//! File-based snapshot store for the task registry.
//! Snapshots are JSON — human-readable, only written on save, never on tick.
//! Callables are not serializable; snapshots carry metadata only and are
//! re-bound to callables through a resolver at rehydration time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};
use crate::tasks::{Task, TaskArgs, TaskConfig, TaskStatus};

/// Serializable view of a task, sufficient to rehydrate it as `pending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    pub args: TaskArgs,
    pub config: TaskConfig,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            args: task.args.clone(),
            config: task.config.clone(),
            status: task.status,
            retry_count: task.retry_count,
            created_at: task.created_at,
        }
    }
}

/// File-based task snapshot store.
pub struct TaskStore {
    path: PathBuf,
}

impl TaskStore {
    /// Open a store directory, failing fast if it cannot be written.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| SchedulerError::Store(format!("cannot create {}: {e}", dir.display())))?;
        let probe = dir.join(".probe");
        std::fs::write(&probe, b"")
            .map_err(|e| SchedulerError::Store(format!("{} not writable: {e}", dir.display())))?;
        std::fs::remove_file(&probe).ok();
        Ok(Self {
            path: dir.to_path_buf(),
        })
    }

    /// Save all snapshots to disk.
    pub fn save(&self, snapshots: &[TaskSnapshot]) -> Result<()> {
        let file = self.path.join("tasks.json");
        let json = serde_json::to_string_pretty(snapshots)
            .map_err(|e| SchedulerError::Store(format!("serialize: {e}")))?;
        std::fs::write(&file, &json)
            .map_err(|e| SchedulerError::Store(format!("write: {e}")))?;
        tracing::debug!("💾 Saved {} task snapshots to {}", snapshots.len(), file.display());
        Ok(())
    }

    /// Load snapshots from disk. Missing or unreadable files load as empty.
    pub fn load(&self) -> Vec<TaskSnapshot> {
        let file = self.path.join("tasks.json");
        if !file.exists() {
            return Vec::new();
        }
        match std::fs::read_to_string(&file) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("⚠️ Failed to parse tasks.json: {e}");
                Vec::new()
            }),
            Err(e) => {
                tracing::warn!("⚠️ Failed to read tasks.json: {e}");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskFn;
    use serde_json::json;

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join("taskflow-store-test");
        let store = TaskStore::open(&dir).unwrap();

        let task = Task::new(
            "nightly-report",
            TaskFn::blocking(|_| Ok(json!(null))),
            json!({"day": "monday"}),
            TaskConfig::default(),
        );
        store.save(&[TaskSnapshot::from(&task)]).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "nightly-report");
        assert_eq!(loaded[0].args, json!({"day": "monday"}));
        assert_eq!(loaded[0].status, TaskStatus::Pending);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = std::env::temp_dir().join("taskflow-store-empty");
        let store = TaskStore::open(&dir).unwrap();
        assert!(store.load().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }
}
