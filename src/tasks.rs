//! Task definitions — the core data model for schedulable work.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SchedulerError};

pub type TaskId = String;
/// Task arguments travel as JSON so the engine never interprets them.
pub type TaskArgs = serde_json::Value;
pub type TaskOutput = serde_json::Value;

/// Uniform invocation contract over synchronous and asynchronous callables.
///
/// Both kinds satisfy one `invoke(args)` call: async callables are awaited on
/// the runtime, blocking ones run on the blocking pool so they never starve
/// the scheduling coordinator. The manager never branches on callable type.
#[derive(Clone)]
pub enum TaskFn {
    Async(Arc<dyn Fn(TaskArgs) -> BoxFuture<'static, std::result::Result<TaskOutput, String>> + Send + Sync>),
    Blocking(Arc<dyn Fn(TaskArgs) -> std::result::Result<TaskOutput, String> + Send + Sync>),
}

impl TaskFn {
    /// Wrap an async callable.
    pub fn new_async<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<TaskOutput, String>> + Send + 'static,
    {
        TaskFn::Async(Arc::new(move |args| Box::pin(f(args))))
    }

    /// Wrap a synchronous, possibly blocking callable.
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(TaskArgs) -> std::result::Result<TaskOutput, String> + Send + Sync + 'static,
    {
        TaskFn::Blocking(Arc::new(f))
    }

    /// Invoke the callable with the given arguments.
    ///
    /// Blocking callables are not cancellable at a timeout deadline: dropping
    /// this future abandons the `spawn_blocking` handle, but the closure runs
    /// to completion on its blocking thread.
    pub async fn invoke(&self, args: TaskArgs) -> std::result::Result<TaskOutput, String> {
        match self {
            TaskFn::Async(f) => f(args).await,
            TaskFn::Blocking(f) => {
                let f = f.clone();
                tokio::task::spawn_blocking(move || f(args))
                    .await
                    .map_err(|e| format!("worker panicked: {e}"))?
            }
        }
    }
}

impl fmt::Debug for TaskFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFn::Async(_) => write!(f, "TaskFn::Async"),
            TaskFn::Blocking(_) => write!(f, "TaskFn::Blocking"),
        }
    }
}

/// Dispatch priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Retry delay policy. Fixed delay is the baseline contract; exponential
/// backoff is opt-in, never a hidden default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BackoffPolicy {
    #[default]
    Fixed,
    Exponential {
        #[serde(default = "default_backoff_cap_secs")]
        cap_secs: u64,
    },
}

fn default_backoff_cap_secs() -> u64 {
    3600
}

impl BackoffPolicy {
    /// Delay before retry attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, base: Duration) -> Duration {
        match self {
            BackoffPolicy::Fixed => base,
            BackoffPolicy::Exponential { cap_secs } => {
                let shift = attempt.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << shift)
                    .min(Duration::from_secs(*cap_secs))
            }
        }
    }
}

/// Per-task execution configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskConfig {
    #[serde(default)]
    pub max_retries: u32,
    /// Wall-clock limit per attempt. Must be positive when set.
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub auto_retry: bool,
    #[serde(default)]
    pub retry_delay: Duration,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl TaskConfig {
    /// Enable retries with a fixed delay.
    pub fn with_retries(mut self, max_retries: u32, delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = delay;
        self.auto_retry = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if let Some(timeout) = self.timeout
            && timeout.is_zero()
        {
            return Err(SchedulerError::Validation(
                "timeout must be a positive duration or unset".into(),
            ));
        }
        Ok(())
    }
}

/// Task lifecycle: `pending → running → {succeeded, failed}`, with `retrying`
/// between failed attempts and `cancelled` via explicit cancel or shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// What kind of failure a task last saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    Execution,
    Timeout,
    RetryExhausted,
    Cancelled,
}

/// Structured error captured into task state. Never propagated to the caller
/// of `start_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl TaskError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Execution,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self {
            kind: TaskErrorKind::Timeout,
            message: format!("execution exceeded timeout of {limit:?}"),
            at: Utc::now(),
        }
    }

    pub fn retry_exhausted(attempts: u32, last: &str) -> Self {
        Self {
            kind: TaskErrorKind::RetryExhausted,
            message: format!("retries exhausted after {attempts} attempts: {last}"),
            at: Utc::now(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: TaskErrorKind::Cancelled,
            message: "task cancelled".into(),
            at: Utc::now(),
        }
    }
}

/// Successful task output plus completion timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub value: TaskOutput,
    pub completed_at: DateTime<Utc>,
}

/// One schedulable, retryable unit of work wrapping a callable.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub func: TaskFn,
    pub args: TaskArgs,
    pub config: TaskConfig,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub last_error: Option<TaskError>,
    pub result: Option<TaskResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(name: &str, func: TaskFn, args: TaskArgs, config: TaskConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            func,
            args,
            config,
            status: TaskStatus::Pending,
            retry_count: 0,
            last_error: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
        }
    }
}
