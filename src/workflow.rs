//! Workflow Engine — DAG automation over the task manager.
//!
//! ## Architecture
//! ```text
//! create_workflow → add_task_step / add_parallel_steps
//!   → set_dependencies (cycle check + topological layering)
//!     → execute_workflow
//!       → round loop: ready set = steps with all prerequisites succeeded
//!         → whole ready set dispatched concurrently via the task manager
//!         → outputs land in the shared context, keyed by step id
//!         → a failed step skips its transitive dependents
//! ```
//!
//! Each workflow lives behind its own lock, so independent workflows execute
//! fully in parallel; only the shared worker pool bounds them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::error::{Result, SchedulerError};
use crate::manager::TaskManager;
use crate::tasks::{TaskArgs, TaskConfig, TaskFn, TaskStatus};

/// Step position in the DAG: standalone, or member of a parallel group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    Single,
    ParallelMember { group: String },
}

/// Runtime status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// One node in a workflow DAG. Position is immutable after creation; only the
/// runtime fields mutate during execution.
#[derive(Debug, Clone)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub kind: StepKind,
    pub func: TaskFn,
    pub args: TaskArgs,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
}

/// Overall workflow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Running,
    Succeeded,
    Failed,
}

/// A DAG of steps with a shared execution context.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub steps: HashMap<String, WorkflowStep>,
    /// step id → prerequisite step ids
    pub deps: HashMap<String, Vec<String>>,
    /// Topological layering computed when dependencies are set; layer N only
    /// depends on layers < N.
    pub layers: Vec<Vec<String>>,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
}

/// Mutable key-value store threaded through one `execute_workflow` call.
/// Seeded by the caller, extended with each completed step's output keyed by
/// step id. Not persisted.
#[derive(Debug, Clone, Default)]
pub struct WorkflowContext {
    pub workflow_id: String,
    pub vars: HashMap<String, Value>,
}

/// Per-workflow summary for statistics.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub steps: usize,
    pub succeeded_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
}

/// Global workflow statistics.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStats {
    pub workflows: Vec<WorkflowSummary>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub type StepCallback = Arc<dyn Fn(&Workflow, &WorkflowStep) + Send + Sync>;
pub type WorkflowCallback = Arc<dyn Fn(&Workflow) + Send + Sync>;

#[derive(Default)]
struct CallbackRegistry {
    step_completed: Vec<StepCallback>,
    workflow_completed: Vec<WorkflowCallback>,
}

/// The workflow engine.
pub struct WorkflowEngine {
    manager: Arc<TaskManager>,
    workflows: Mutex<HashMap<String, Arc<Mutex<Workflow>>>>,
    callbacks: RwLock<CallbackRegistry>,
}

impl WorkflowEngine {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self {
            manager,
            workflows: Mutex::new(HashMap::new()),
            callbacks: RwLock::new(CallbackRegistry::default()),
        }
    }

    /// Register an empty workflow.
    pub async fn create_workflow(&self, name: &str, description: &str) -> String {
        let workflow = Workflow {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            steps: HashMap::new(),
            deps: HashMap::new(),
            layers: Vec::new(),
            status: WorkflowStatus::Created,
            created_at: Utc::now(),
        };
        let id = workflow.id.clone();
        self.workflows
            .lock()
            .await
            .insert(id.clone(), Arc::new(Mutex::new(workflow)));
        tracing::info!("🧩 Workflow created: '{name}' ({id})");
        id
    }

    async fn workflow(&self, id: &str) -> Result<Arc<Mutex<Workflow>>> {
        self.workflows
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("workflow {id}")))
    }

    /// Add a single step.
    pub async fn add_task_step(
        &self,
        workflow_id: &str,
        name: &str,
        func: TaskFn,
        args: TaskArgs,
    ) -> Result<String> {
        self.add_step(workflow_id, name, func, args, StepKind::Single)
            .await
    }

    /// Add a group of steps sharing one dependency set, intended for
    /// concurrent dispatch. Returns the new step ids in input order.
    pub async fn add_parallel_steps(
        &self,
        workflow_id: &str,
        steps: Vec<(String, TaskFn, TaskArgs)>,
        group: &str,
    ) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(steps.len());
        for (name, func, args) in steps {
            let kind = StepKind::ParallelMember {
                group: group.to_string(),
            };
            ids.push(self.add_step(workflow_id, &name, func, args, kind).await?);
        }
        Ok(ids)
    }

    async fn add_step(
        &self,
        workflow_id: &str,
        name: &str,
        func: TaskFn,
        args: TaskArgs,
        kind: StepKind,
    ) -> Result<String> {
        let workflow = self.workflow(workflow_id).await?;
        let mut workflow = workflow.lock().await;
        if workflow.status == WorkflowStatus::Running {
            return Err(SchedulerError::InvalidState(
                "cannot add steps while the workflow is running".into(),
            ));
        }
        let step = WorkflowStep {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            kind,
            func,
            args,
            status: StepStatus::Pending,
            output: None,
            error: None,
        };
        let id = step.id.clone();
        workflow.steps.insert(id.clone(), step);
        Ok(id)
    }

    /// Set the dependency mapping (step id → prerequisite step ids).
    /// Rejects unknown step references and cycles before committing.
    pub async fn set_dependencies(
        &self,
        workflow_id: &str,
        mapping: HashMap<String, Vec<String>>,
    ) -> Result<()> {
        let workflow = self.workflow(workflow_id).await?;
        let mut workflow = workflow.lock().await;
        if workflow.status == WorkflowStatus::Running {
            return Err(SchedulerError::InvalidState(
                "cannot change dependencies while the workflow is running".into(),
            ));
        }

        for (step, prereqs) in &mapping {
            if !workflow.steps.contains_key(step) {
                return Err(SchedulerError::Validation(format!(
                    "dependency mapping references unknown step '{step}'"
                )));
            }
            for prereq in prereqs {
                if !workflow.steps.contains_key(prereq) {
                    return Err(SchedulerError::Validation(format!(
                        "step '{step}' depends on unknown step '{prereq}'"
                    )));
                }
            }
        }
        detect_cycle(&mapping)?;

        let step_ids: Vec<String> = workflow.steps.keys().cloned().collect();
        workflow.layers = topo_layers(&step_ids, &mapping);
        workflow.deps = mapping;
        Ok(())
    }

    /// Register a listener fired synchronously as each step reaches a
    /// terminal succeeded/failed status, in registration order.
    pub fn on_step_completed(&self, callback: StepCallback) {
        if let Ok(mut registry) = self.callbacks.write() {
            registry.step_completed.push(callback);
        }
    }

    /// Register a listener fired synchronously when a workflow finishes.
    pub fn on_workflow_completed(&self, callback: WorkflowCallback) {
        if let Ok(mut registry) = self.callbacks.write() {
            registry.workflow_completed.push(callback);
        }
    }

    fn step_callbacks(&self) -> Vec<StepCallback> {
        self.callbacks
            .read()
            .map(|r| r.step_completed.clone())
            .unwrap_or_default()
    }

    fn workflow_callbacks(&self) -> Vec<WorkflowCallback> {
        self.callbacks
            .read()
            .map(|r| r.workflow_completed.clone())
            .unwrap_or_default()
    }

    /// Execute the workflow to completion. Returns `Ok(true)` iff every
    /// dispatched step succeeded; step failures do not surface as errors.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        seed: HashMap<String, Value>,
    ) -> Result<bool> {
        if !self.manager.is_accepting() {
            return Err(SchedulerError::InvalidState(
                "task manager is stopped".into(),
            ));
        }
        let workflow_arc = self.workflow(workflow_id).await?;
        {
            let mut workflow = workflow_arc.lock().await;
            if workflow.status == WorkflowStatus::Running {
                return Err(SchedulerError::InvalidState(format!(
                    "workflow {workflow_id} is already running"
                )));
            }
            // reset runtime state so a workflow can be re-executed
            for step in workflow.steps.values_mut() {
                step.status = StepStatus::Pending;
                step.output = None;
                step.error = None;
            }
            workflow.status = WorkflowStatus::Running;
            tracing::info!("🚀 Workflow '{}' started ({workflow_id})", workflow.name);
        }

        let mut context = WorkflowContext {
            workflow_id: workflow_id.to_string(),
            vars: seed,
        };

        loop {
            // ready set: pending steps whose prerequisites have all succeeded
            let ready = {
                let mut workflow = workflow_arc.lock().await;
                let mut ready_ids: Vec<String> = workflow
                    .steps
                    .values()
                    .filter(|s| s.status == StepStatus::Pending)
                    .filter(|s| {
                        workflow
                            .deps
                            .get(&s.id)
                            .map(|prereqs| {
                                prereqs.iter().all(|p| {
                                    workflow
                                        .steps
                                        .get(p)
                                        .is_some_and(|ps| ps.status == StepStatus::Succeeded)
                                })
                            })
                            .unwrap_or(true)
                    })
                    .map(|s| s.id.clone())
                    .collect();
                ready_ids.sort();

                let step_ids: Vec<String> = workflow.steps.keys().cloned().collect();
                let mut batch = Vec::with_capacity(ready_ids.len());
                for step_id in ready_ids {
                    let prereqs = workflow.deps.get(&step_id).cloned().unwrap_or_default();
                    if let Some(step) = workflow.steps.get_mut(&step_id) {
                        step.status = StepStatus::Running;
                        let payload = build_payload(&step.args, &context, &prereqs, &step_ids);
                        batch.push((step_id, step.name.clone(), step.func.clone(), payload));
                    }
                }
                batch
            };

            if ready.is_empty() {
                break;
            }

            // The entire ready set runs concurrently; only dependency edges
            // serialize execution. Each step records its terminal status and
            // fires the completion callbacks as its own future resolves, so a
            // fast parallel member never waits on the round's slowest step.
            let results = futures::future::join_all(ready.into_iter().map(
                |(step_id, name, func, payload)| {
                    let manager = self.manager.clone();
                    let workflow_arc = workflow_arc.clone();
                    async move {
                        let outcome = run_step(&manager, &name, func, payload).await;
                        let mut workflow = workflow_arc.lock().await;
                        match &outcome {
                            Ok(value) => {
                                if let Some(step) = workflow.steps.get_mut(&step_id) {
                                    step.status = StepStatus::Succeeded;
                                    step.output = Some(value.clone());
                                }
                            }
                            Err(message) => {
                                tracing::warn!("❌ Workflow step '{step_id}' failed: {message}");
                                if let Some(step) = workflow.steps.get_mut(&step_id) {
                                    step.status = StepStatus::Failed;
                                    step.error = Some(message.clone());
                                }
                                skip_dependents(&mut workflow, &step_id);
                            }
                        }
                        if let Some(step) = workflow.steps.get(&step_id) {
                            let step = step.clone();
                            for callback in self.step_callbacks() {
                                callback(&workflow, &step);
                            }
                        }
                        (step_id, outcome)
                    }
                },
            ))
            .await;

            // outputs feed the next round's payloads, applied once the round
            // settles
            for (step_id, outcome) in results {
                if let Ok(value) = outcome {
                    context.vars.insert(step_id, value);
                }
            }
        }

        let success = {
            let mut workflow = workflow_arc.lock().await;
            let success = !workflow
                .steps
                .values()
                .any(|s| matches!(s.status, StepStatus::Failed | StepStatus::Pending));
            workflow.status = if success {
                WorkflowStatus::Succeeded
            } else {
                WorkflowStatus::Failed
            };
            tracing::info!(
                "🏁 Workflow '{}' finished: {}",
                workflow.name,
                if success { "succeeded" } else { "failed" }
            );
            for callback in self.workflow_callbacks() {
                callback(&workflow);
            }
            success
        };
        Ok(success)
    }

    /// Current status of every step in a workflow.
    pub async fn step_statuses(&self, workflow_id: &str) -> Result<HashMap<String, StepStatus>> {
        let workflow = self.workflow(workflow_id).await?;
        let workflow = workflow.lock().await;
        Ok(workflow
            .steps
            .values()
            .map(|s| (s.id.clone(), s.status))
            .collect())
    }

    /// Recorded output of one step, if it succeeded.
    pub async fn step_output(&self, workflow_id: &str, step_id: &str) -> Result<Option<Value>> {
        let workflow = self.workflow(workflow_id).await?;
        let workflow = workflow.lock().await;
        let step = workflow
            .steps
            .get(step_id)
            .ok_or_else(|| SchedulerError::NotFound(format!("step {step_id}")))?;
        Ok(step.output.clone())
    }

    /// Per-workflow and global statistics.
    pub async fn get_workflow_statistics(&self) -> WorkflowStats {
        let workflows = self.workflows.lock().await;
        let mut summaries = Vec::with_capacity(workflows.len());
        for workflow in workflows.values() {
            let workflow = workflow.lock().await;
            summaries.push(WorkflowSummary {
                id: workflow.id.clone(),
                name: workflow.name.clone(),
                status: workflow.status,
                steps: workflow.steps.len(),
                succeeded_steps: count_status(&workflow, StepStatus::Succeeded),
                failed_steps: count_status(&workflow, StepStatus::Failed),
                skipped_steps: count_status(&workflow, StepStatus::Skipped),
            });
        }
        WorkflowStats {
            total: summaries.len(),
            succeeded: summaries
                .iter()
                .filter(|s| s.status == WorkflowStatus::Succeeded)
                .count(),
            failed: summaries
                .iter()
                .filter(|s| s.status == WorkflowStatus::Failed)
                .count(),
            workflows: summaries,
        }
    }
}

fn count_status(workflow: &Workflow, status: StepStatus) -> usize {
    workflow
        .steps
        .values()
        .filter(|s| s.status == status)
        .count()
}

/// Run one step as a task through the manager so workflow work shares the
/// worker pool with direct and cron dispatch.
async fn run_step(
    manager: &TaskManager,
    name: &str,
    func: TaskFn,
    payload: Value,
) -> std::result::Result<Value, String> {
    let task_id = manager
        .create_task(name, func, payload, TaskConfig::default())
        .await
        .map_err(|e| e.to_string())?;
    manager.run_task(&task_id).await.map_err(|e| e.to_string())?;
    let task = manager.get_task(&task_id).await.map_err(|e| e.to_string())?;
    match task.status {
        TaskStatus::Succeeded => Ok(task
            .result
            .map(|r| r.value)
            .unwrap_or(Value::Null)),
        _ => Err(task
            .last_error
            .map(|e| e.message)
            .unwrap_or_else(|| "step did not succeed".into())),
    }
}

/// Build the invocation payload: the step's own args plus a `"context"`
/// object holding the caller's seed variables and the outputs of the step's
/// declared prerequisites.
fn build_payload(
    args: &Value,
    context: &WorkflowContext,
    prereqs: &[String],
    step_ids: &[String],
) -> Value {
    let mut payload = match args {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("args".to_string(), other.clone());
            map
        }
    };
    let mut ctx = Map::new();
    for (key, value) in &context.vars {
        let is_step_output = step_ids.contains(key);
        if !is_step_output || prereqs.contains(key) {
            ctx.insert(key.clone(), value.clone());
        }
    }
    payload.insert("context".to_string(), Value::Object(ctx));
    Value::Object(payload)
}

/// Mark every transitive dependent of `failed` as skipped.
fn skip_dependents(workflow: &mut Workflow, failed: &str) {
    let mut queue = vec![failed.to_string()];
    while let Some(current) = queue.pop() {
        let dependents: Vec<String> = workflow
            .deps
            .iter()
            .filter(|(_, prereqs)| prereqs.contains(&current))
            .map(|(step_id, _)| step_id.clone())
            .collect();
        for step_id in dependents {
            if let Some(step) = workflow.steps.get_mut(&step_id)
                && step.status == StepStatus::Pending
            {
                step.status = StepStatus::Skipped;
                step.error = Some(format!("prerequisite '{current}' failed"));
                queue.push(step_id);
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// DFS cycle check over the prerequisite edges.
fn detect_cycle(deps: &HashMap<String, Vec<String>>) -> Result<()> {
    let mut colors: HashMap<String, Color> = HashMap::new();
    for node in deps.keys() {
        if colors.get(node).copied().unwrap_or(Color::White) == Color::White
            && visit(node, deps, &mut colors)
        {
            return Err(SchedulerError::Validation(format!(
                "dependency cycle detected involving step '{node}'"
            )));
        }
    }
    Ok(())
}

fn visit(node: &str, deps: &HashMap<String, Vec<String>>, colors: &mut HashMap<String, Color>) -> bool {
    colors.insert(node.to_string(), Color::Gray);
    for prereq in deps.get(node).into_iter().flatten() {
        match colors.get(prereq).copied().unwrap_or(Color::White) {
            Color::Gray => return true,
            Color::White => {
                if visit(prereq, deps, colors) {
                    return true;
                }
            }
            Color::Black => {}
        }
    }
    colors.insert(node.to_string(), Color::Black);
    false
}

/// Peel the DAG into layers; layer N only depends on earlier layers.
/// Assumes acyclicity was already checked.
fn topo_layers(step_ids: &[String], deps: &HashMap<String, Vec<String>>) -> Vec<Vec<String>> {
    let mut remaining: Vec<String> = step_ids.to_vec();
    let mut layers = Vec::new();
    while !remaining.is_empty() {
        let mut layer: Vec<String> = remaining
            .iter()
            .filter(|id| {
                deps.get(*id)
                    .map(|prereqs| prereqs.iter().all(|p| !remaining.contains(p)))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if layer.is_empty() {
            break;
        }
        layer.sort();
        remaining.retain(|id| !layer.contains(id));
        layers.push(layer);
    }
    layers
}
