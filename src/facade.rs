//! Scheduler facade — one construction-and-lifecycle surface over the task
//! manager, cron engine, and workflow engine.
//!
//! The facade owns no scheduling logic. It wires the subsystems to one shared
//! worker pool, drives start/stop ordering, and aggregates status, metrics,
//! and health from subsystem reads.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::Serialize;

use crate::config::SchedulerConfig;
use crate::engine::{CronEngine, CronStats};
use crate::error::Result;
use crate::manager::{TaskManager, TaskStats};
use crate::store::TaskStore;
use crate::tasks::TaskFn;
use crate::workflow::{WorkflowEngine, WorkflowStats};

/// Maps a task name back to its callable when rehydrating snapshots.
pub type TaskResolver = Arc<dyn Fn(&str) -> Option<TaskFn> + Send + Sync>;

/// Coarse lifecycle view, cheap enough to poll.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub accepting: bool,
    pub cron_running: bool,
    pub max_workers: usize,
    pub active_workers: usize,
    pub uptime_secs: u64,
}

/// Point-in-time metrics aggregated from every subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetrics {
    pub tasks: TaskStats,
    pub cron: CronStats,
    pub workflows: WorkflowStats,
}

/// Health verdict with per-component detail.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub manager_accepting: bool,
    pub cron_running: bool,
    pub workers_saturated: bool,
}

/// The scheduler facade.
pub struct Scheduler {
    config: SchedulerConfig,
    manager: Arc<TaskManager>,
    cron: Arc<CronEngine>,
    workflows: Arc<WorkflowEngine>,
    store: Option<TaskStore>,
    resolver: RwLock<Option<TaskResolver>>,
    started_at: Instant,
}

impl Scheduler {
    /// Build a scheduler from configuration. Fails fast on a zero-sized
    /// worker pool or an unwritable store directory; nothing starts running
    /// until `start()`.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let manager = Arc::new(TaskManager::new(config.max_workers)?);
        let cron = Arc::new(CronEngine::new(manager.clone()));
        let workflows = Arc::new(WorkflowEngine::new(manager.clone()));
        let store = match &config.store_dir {
            Some(dir) => Some(TaskStore::open(dir)?),
            None => None,
        };
        tracing::info!(
            "🗓️ Scheduler configured: {} workers, snapshots {}",
            config.max_workers,
            if store.is_some() { "on" } else { "off" }
        );
        Ok(Self {
            config,
            manager,
            cron,
            workflows,
            store,
            resolver: RwLock::new(None),
            started_at: Instant::now(),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(SchedulerConfig::default())
    }

    pub fn manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    pub fn cron(&self) -> &Arc<CronEngine> {
        &self.cron
    }

    pub fn workflows(&self) -> &Arc<WorkflowEngine> {
        &self.workflows
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register the resolver used to re-bind snapshotted tasks to callables.
    /// Must be set before `start()` for rehydration to restore anything.
    pub fn set_task_resolver(&self, resolver: TaskResolver) {
        if let Ok(mut slot) = self.resolver.write() {
            *slot = Some(resolver);
        }
    }

    /// Start accepting work: open the manager, rehydrate persisted tasks if a
    /// store and resolver are present, then launch the cron coordinator.
    pub async fn start(&self) -> Result<()> {
        self.manager.start();
        if let Some(store) = &self.store {
            let resolver = self
                .resolver
                .read()
                .ok()
                .and_then(|slot| slot.clone());
            match resolver {
                Some(resolver) => {
                    let snapshots = store.load();
                    self.manager.rehydrate(snapshots, resolver.as_ref()).await;
                }
                None => {
                    tracing::warn!("⚠️ Snapshot store configured but no task resolver set, skipping rehydration");
                }
            }
        }
        self.cron.start().await;
        tracing::info!("✅ Scheduler started");
        Ok(())
    }

    /// Stop in reverse order: silence the cron coordinator first so nothing
    /// new is dispatched, snapshot the registry, then drain the manager.
    pub async fn stop(&self) -> Result<()> {
        self.cron.stop().await;
        if let Some(store) = &self.store {
            let snapshots = self.manager.snapshot().await;
            if let Err(e) = store.save(&snapshots) {
                tracing::warn!("⚠️ Failed to save task snapshots: {e}");
            }
        }
        self.manager.stop(self.config.shutdown_grace()).await;
        tracing::info!("🛑 Scheduler stopped");
        Ok(())
    }

    pub fn get_status(&self) -> SchedulerStatus {
        SchedulerStatus {
            accepting: self.manager.is_accepting(),
            cron_running: self.cron.is_running(),
            max_workers: self.manager.max_workers(),
            active_workers: self.manager.active_workers(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    pub async fn get_metrics(&self) -> SchedulerMetrics {
        SchedulerMetrics {
            tasks: self.manager.get_task_stats().await,
            cron: self.cron.get_statistics().await,
            workflows: self.workflows.get_workflow_statistics().await,
        }
    }

    /// Healthy means the manager accepts work and the worker pool has a free
    /// slot. A stopped cron engine is reported but does not fail health on
    /// its own; schedulers without scheduled entries run that way normally.
    pub fn health_check(&self) -> HealthReport {
        let accepting = self.manager.is_accepting();
        let saturated = self.manager.active_workers() >= self.manager.max_workers();
        HealthReport {
            healthy: accepting && !saturated,
            manager_accepting: accepting,
            cron_running: self.cron.is_running(),
            workers_saturated: saturated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerError;
    use crate::tasks::TaskConfig;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lifecycle_and_status() {
        let scheduler = Scheduler::with_defaults().unwrap();
        scheduler.start().await.unwrap();

        let status = scheduler.get_status();
        assert!(status.accepting);
        assert!(status.cron_running);
        assert_eq!(status.max_workers, 4);

        scheduler.stop().await.unwrap();
        let status = scheduler.get_status();
        assert!(!status.accepting);
        assert!(!status.cron_running);
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let config = SchedulerConfig {
            max_workers: 0,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            Scheduler::new(config),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_metrics_aggregate_all_subsystems() {
        let scheduler = Scheduler::with_defaults().unwrap();
        scheduler.start().await.unwrap();

        let id = scheduler
            .manager()
            .create_task(
                "ping",
                TaskFn::new_async(|_| async { Ok(json!("pong")) }),
                json!(null),
                TaskConfig::default(),
            )
            .await
            .unwrap();
        scheduler.manager().run_task(&id).await.unwrap();

        let wf = scheduler.workflows().create_workflow("noop", "").await;
        scheduler
            .workflows()
            .execute_workflow(&wf, HashMap::new())
            .await
            .unwrap();

        let metrics = scheduler.get_metrics().await;
        assert_eq!(metrics.tasks.succeeded, 1);
        assert_eq!(metrics.workflows.total, 1);
        assert!(metrics.cron.entries.is_empty());

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_reflects_shutdown() {
        let scheduler = Scheduler::with_defaults().unwrap();
        scheduler.start().await.unwrap();
        assert!(scheduler.health_check().healthy);

        scheduler.stop().await.unwrap();
        let health = scheduler.health_check();
        assert!(!health.healthy);
        assert!(!health.manager_accepting);
    }

    #[tokio::test]
    async fn test_snapshot_persists_across_instances() {
        let dir = std::env::temp_dir().join("taskflow-facade-store-test");
        std::fs::remove_dir_all(&dir).ok();
        let config = SchedulerConfig {
            store_dir: Some(dir.clone()),
            ..SchedulerConfig::default()
        };

        let resolver: TaskResolver = Arc::new(|name| {
            (name == "recurring-sync").then(|| TaskFn::new_async(|_| async { Ok(json!(null)) }))
        });

        {
            let scheduler = Scheduler::new(config.clone()).unwrap();
            scheduler.set_task_resolver(resolver.clone());
            scheduler.start().await.unwrap();
            scheduler
                .manager()
                .create_task(
                    "recurring-sync",
                    TaskFn::new_async(|_| async { Ok(json!(null)) }),
                    json!({"source": "s3"}),
                    TaskConfig::default().with_retries(2, Duration::from_millis(10)),
                )
                .await
                .unwrap();
            scheduler.stop().await.unwrap();
        }

        let scheduler = Scheduler::new(config).unwrap();
        scheduler.set_task_resolver(resolver);
        scheduler.start().await.unwrap();

        let tasks = scheduler.manager().get_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].name, "recurring-sync");
        assert_eq!(tasks[0].args, json!({"source": "s3"}));

        scheduler.stop().await.unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }
}
