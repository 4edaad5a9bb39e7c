//! Error types for the scheduler engine.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// All errors surfaced by the public scheduler API.
///
/// Registration-time problems (bad cron expression, cyclic dependencies,
/// invalid config) are returned synchronously. Execution failures never reach
/// the caller of `start_task` — they are captured into the task's `last_error`
/// and read back via polling or callbacks.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("task execution failed: {0}")]
    Execution(String),

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: String },

    #[error("dependency failed: {0}")]
    Dependency(String),

    #[error("store error: {0}")]
    Store(String),
}
