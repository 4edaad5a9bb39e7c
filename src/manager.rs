//! Task Manager — owns the canonical task registry and runs callables on a
//! bounded worker pool with retry and timeout enforcement.
//!
//! One mutex guards the registry: the cron coordinator, workflow rounds, and
//! worker completions all mutate task status through it. One semaphore bounds
//! concurrency; a permit is held per attempt, so a task sleeping between
//! retries does not occupy a worker slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{Result, SchedulerError};
use crate::store::TaskSnapshot;
use crate::tasks::{
    Task, TaskArgs, TaskConfig, TaskError, TaskFn, TaskId, TaskResult, TaskStatus,
};

/// Aggregated task counts, returned by `get_task_stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_dispatched: u64,
}

/// The task manager.
pub struct TaskManager {
    tasks: Arc<Mutex<HashMap<TaskId, Task>>>,
    workers: Arc<Semaphore>,
    max_workers: usize,
    accepting: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    dispatched: Arc<AtomicU64>,
    handles: Arc<Mutex<HashMap<TaskId, JoinHandle<()>>>>,
}

impl TaskManager {
    /// Create a manager with a worker pool of `max_workers` slots.
    /// Fails fast on a zero-sized pool.
    pub fn new(max_workers: usize) -> Result<Self> {
        if max_workers == 0 {
            return Err(SchedulerError::Validation(
                "max_workers must be at least 1".into(),
            ));
        }
        Ok(Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            accepting: Arc::new(AtomicBool::new(true)),
            active: Arc::new(AtomicUsize::new(0)),
            dispatched: Arc::new(AtomicU64::new(0)),
            handles: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Register a task in `pending` state. Does not start execution.
    pub async fn create_task(
        &self,
        name: &str,
        func: TaskFn,
        args: TaskArgs,
        config: TaskConfig,
    ) -> Result<TaskId> {
        config.validate()?;
        let task = Task::new(name, func, args, config);
        let id = task.id.clone();
        self.tasks.lock().await.insert(id.clone(), task);
        tracing::debug!("📝 Task created: '{name}' ({id})");
        Ok(id)
    }

    /// Transition `pending → running` and submit to the worker pool.
    /// Execution errors never propagate here — they land in the task's
    /// `last_error`.
    pub async fn start_task(&self, id: &str) -> Result<()> {
        let worker = self.prepare(id).await?;
        let handles = self.handles.clone();
        let id = id.to_string();
        // The lock is held across spawn and insert so a fast worker's
        // self-removal serializes after the insert instead of racing it and
        // leaving a finished handle in the map.
        let mut map = self.handles.lock().await;
        let handle = tokio::spawn({
            let id = id.clone();
            async move {
                worker.await;
                handles.lock().await.remove(&id);
            }
        });
        map.insert(id, handle);
        Ok(())
    }

    /// Like `start_task` but awaited inline. Used by the workflow engine so
    /// step execution shares the same pool and bookkeeping.
    pub async fn run_task(&self, id: &str) -> Result<()> {
        let worker = self.prepare(id).await?;
        worker.await;
        Ok(())
    }

    /// Validate the transition and build the attempt-loop future.
    async fn prepare(&self, id: &str) -> Result<BoxFuture<'static, ()>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SchedulerError::InvalidState(
                "task manager is stopped".into(),
            ));
        }
        let (func, args, config) = {
            let mut tasks = self.tasks.lock().await;
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| SchedulerError::NotFound(format!("task {id}")))?;
            if task.status != TaskStatus::Pending {
                return Err(SchedulerError::InvalidState(format!(
                    "task {id} is {}, expected pending",
                    task.status
                )));
            }
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            (task.func.clone(), task.args.clone(), task.config.clone())
        };
        self.dispatched.fetch_add(1, Ordering::SeqCst);

        let tasks = self.tasks.clone();
        let workers = self.workers.clone();
        let active = self.active.clone();
        let id = id.to_string();
        Ok(Box::pin(async move {
            active.fetch_add(1, Ordering::SeqCst);
            run_attempts(tasks, workers, id, func, args, config).await;
            active.fetch_sub(1, Ordering::SeqCst);
        }))
    }

    /// Read-only snapshot of one task.
    pub async fn get_task(&self, id: &str) -> Result<Task> {
        self.tasks
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("task {id}")))
    }

    /// Read-only snapshot of every task.
    pub async fn get_tasks(&self) -> Vec<Task> {
        self.tasks.lock().await.values().cloned().collect()
    }

    /// Aggregated counts by status.
    pub async fn get_task_stats(&self) -> TaskStats {
        let tasks = self.tasks.lock().await;
        let mut stats = TaskStats {
            total: tasks.len(),
            total_dispatched: self.dispatched.load(Ordering::SeqCst),
            ..TaskStats::default()
        };
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Retrying => stats.retrying += 1,
                TaskStatus::Succeeded => stats.succeeded += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Cancel a non-terminal task, aborting its worker if one is running.
    pub async fn cancel_task(&self, id: &str) -> Result<()> {
        {
            let mut tasks = self.tasks.lock().await;
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| SchedulerError::NotFound(format!("task {id}")))?;
            if task.status.is_terminal() {
                return Err(SchedulerError::InvalidState(format!(
                    "task {id} is already {}",
                    task.status
                )));
            }
            task.status = TaskStatus::Cancelled;
            task.last_error = Some(TaskError::cancelled());
            tracing::info!("🚫 Task '{}' cancelled ({id})", task.name);
        }
        if let Some(handle) = self.handles.lock().await.remove(id) {
            handle.abort();
        }
        Ok(())
    }

    /// Resume accepting submissions after a `stop`.
    pub fn start(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Number of attempt loops currently in flight.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Refuse new submissions, wait up to `grace` for in-flight work, then
    /// abort stragglers and mark them `cancelled`.
    pub async fn stop(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + grace;
        while self.active.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut handles = self.handles.lock().await;
        for (_, handle) in handles.drain() {
            handle.abort();
        }
        drop(handles);

        let mut tasks = self.tasks.lock().await;
        let mut forced = 0;
        for task in tasks.values_mut() {
            if matches!(task.status, TaskStatus::Running | TaskStatus::Retrying) {
                task.status = TaskStatus::Cancelled;
                task.last_error = Some(TaskError::cancelled());
                forced += 1;
            }
        }
        if forced > 0 {
            tracing::warn!("⚠️ Force-cancelled {forced} in-flight tasks on shutdown");
        }
        tracing::info!("🛑 Task manager stopped");
    }

    /// Serializable view of the registry for the snapshot store.
    pub async fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.tasks
            .lock()
            .await
            .values()
            .map(TaskSnapshot::from)
            .collect()
    }

    /// Re-register snapshotted tasks as `pending`, binding callables back via
    /// the resolver (keyed by task name). Terminal snapshots and tasks the
    /// resolver cannot map are skipped. Returns the number restored.
    pub async fn rehydrate(
        &self,
        snapshots: Vec<TaskSnapshot>,
        resolver: &(dyn Fn(&str) -> Option<TaskFn> + Send + Sync),
    ) -> usize {
        let mut restored = 0;
        let mut tasks = self.tasks.lock().await;
        for snap in snapshots {
            if snap.status.is_terminal() {
                continue;
            }
            let Some(func) = resolver(&snap.name) else {
                tracing::warn!("⚠️ No callable registered for task '{}', skipping", snap.name);
                continue;
            };
            let task = Task {
                id: snap.id.clone(),
                name: snap.name,
                func,
                args: snap.args,
                config: snap.config,
                // Never silently resumed mid-execution.
                status: TaskStatus::Pending,
                retry_count: snap.retry_count,
                last_error: None,
                result: None,
                created_at: snap.created_at,
                started_at: None,
            };
            tasks.insert(snap.id, task);
            restored += 1;
        }
        if restored > 0 {
            tracing::info!("♻️ Rehydrated {restored} tasks as pending");
        }
        restored
    }
}

/// The per-task attempt loop: invoke, enforce timeout, retry per config.
async fn run_attempts(
    tasks: Arc<Mutex<HashMap<TaskId, Task>>>,
    workers: Arc<Semaphore>,
    id: TaskId,
    func: TaskFn,
    args: TaskArgs,
    config: TaskConfig,
) {
    loop {
        let permit = match workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let attempt = match config.timeout {
            Some(limit) => match tokio::time::timeout(limit, func.invoke(args.clone())).await {
                Ok(result) => result.map_err(TaskError::execution),
                Err(_) => Err(TaskError::timeout(limit)),
            },
            None => func.invoke(args.clone()).await.map_err(TaskError::execution),
        };
        drop(permit);

        match attempt {
            Ok(value) => {
                let mut map = tasks.lock().await;
                if let Some(task) = map.get_mut(&id) {
                    if task.status == TaskStatus::Cancelled {
                        return;
                    }
                    task.status = TaskStatus::Succeeded;
                    task.result = Some(TaskResult {
                        value,
                        completed_at: Utc::now(),
                    });
                    tracing::info!("✅ Task '{}' succeeded ({id})", task.name);
                }
                return;
            }
            Err(err) => {
                let delay = {
                    let mut map = tasks.lock().await;
                    let Some(task) = map.get_mut(&id) else { return };
                    if task.status == TaskStatus::Cancelled {
                        return;
                    }
                    if config.auto_retry && task.retry_count < config.max_retries {
                        task.retry_count += 1;
                        task.status = TaskStatus::Retrying;
                        task.last_error = Some(err);
                        let delay = config
                            .backoff
                            .delay_for(task.retry_count, config.retry_delay);
                        tracing::warn!(
                            "🔁 Task '{}' failed, retry {}/{} in {:?}",
                            task.name,
                            task.retry_count,
                            config.max_retries,
                            delay
                        );
                        Some(delay)
                    } else {
                        let final_error = if config.auto_retry && config.max_retries > 0 {
                            TaskError::retry_exhausted(task.retry_count, &err.message)
                        } else {
                            err
                        };
                        tracing::warn!(
                            "❌ Task '{}' failed ({id}): {}",
                            task.name,
                            final_error.message
                        );
                        task.status = TaskStatus::Failed;
                        task.last_error = Some(final_error);
                        None
                    }
                };
                match delay {
                    Some(delay) => {
                        tokio::time::sleep(delay).await;
                        let mut map = tasks.lock().await;
                        match map.get_mut(&id) {
                            // retrying → running, retry budget already spent
                            Some(task) if task.status == TaskStatus::Retrying => {
                                task.status = TaskStatus::Running;
                            }
                            // cancelled mid-delay
                            _ => return,
                        }
                    }
                    None => return,
                }
            }
        }
    }
}
