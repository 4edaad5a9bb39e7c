//! # Taskflow
//!
//! Async task scheduling and workflow orchestration engine.
//! Optimized for in-memory state and a single shared worker pool.
//!
//! ## Design Principles
//! - No external services (no Redis, no message broker)
//! - JSON snapshot persistence — the registry survives restarts
//! - Tokio timers only — the cron coordinator sleeps until the next fire
//! - Bounded concurrency — one semaphore caps every dispatch path
//! - Workflow engine — DAG steps with dependency-driven parallelism
//!
//! ## Architecture
//! ```text
//! Scheduler (facade)
//!   ├── TaskManager: registry + worker pool
//!   │     └── task lifecycle: pending → running → {succeeded, failed}
//!   │            with retrying between attempts, cancelled on demand
//!   ├── CronEngine: "0 30 9 * * 1-5" → fire task every weekday 09:30
//!   │     └── coordinator sleeps to next fire, wakes on entry changes
//!   ├── WorkflowEngine: extract → [t1 | t2 | t3] → aggregate
//!   │     └── outputs thread through a shared context, keyed by step
//!   └── TaskStore: JSON snapshots, rehydrated through a name resolver
//! ```

pub mod config;
pub mod cron;
pub mod engine;
pub mod error;
pub mod facade;
pub mod manager;
pub mod store;
pub mod tasks;
pub mod workflow;

pub use config::SchedulerConfig;
pub use cron::CronSchedule;
pub use engine::{CronEngine, CronStats, ScheduledTaskStats};
pub use error::{Result, SchedulerError};
pub use facade::{HealthReport, Scheduler, SchedulerMetrics, SchedulerStatus, TaskResolver};
pub use manager::{TaskManager, TaskStats};
pub use store::{TaskSnapshot, TaskStore};
pub use tasks::{
    BackoffPolicy, Task, TaskConfig, TaskError, TaskErrorKind, TaskFn, TaskPriority, TaskResult,
    TaskStatus,
};
pub use workflow::{
    StepKind, StepStatus, Workflow, WorkflowEngine, WorkflowStats, WorkflowStatus, WorkflowStep,
};
