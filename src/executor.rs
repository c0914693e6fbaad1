use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::retry::RetryError;
use crate::{
    Context, ParallelEngine, RetryExecutor, SequentialEngine, TaskDefinition, TaskId, TaskResult,
    TaskState, TaskloomError, WorkflowDefinition,
};

/// Worker count used when a parallel engine is requested by name only.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Runs a [`WorkflowDefinition`] to completion.
///
/// Task failures never surface as `Err`: they end the run with
/// `success == false`. `Err` is reserved for workflows that cannot be ordered
/// (a cycle or an unknown dependency).
#[async_trait]
pub trait ExecutionEngine: Send + Sync + 'static {
    fn kind(&self) -> EngineKind;

    /// Execute `workflow`; cancelling `cancel` stops tasks that have not
    /// started yet and interrupts retry waits.
    async fn execute_with_cancel(
        &self,
        workflow: &WorkflowDefinition,
        context: Context,
        cancel: CancellationToken,
    ) -> Result<WorkflowResult, TaskloomError>;

    async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        context: Context,
    ) -> Result<WorkflowResult, TaskloomError> {
        self.execute_with_cancel(workflow, context, CancellationToken::new())
            .await
    }

    /// Start `execute` in the background and return immediately.
    fn execute_async(
        self: Arc<Self>,
        workflow: WorkflowDefinition,
        context: Context,
    ) -> JoinHandle<Result<WorkflowResult, TaskloomError>> {
        tokio::spawn(async move { self.execute(&workflow, context).await })
    }
}

/// Which engine to build. Deserializes from `{"kind": "sequential"}` or
/// `{"kind": "parallel", "max_workers": 8}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineKind {
    #[default]
    Sequential,
    Parallel { max_workers: usize },
}

impl FromStr for EngineKind {
    type Err = TaskloomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(EngineKind::Sequential),
            "parallel" => Ok(EngineKind::Parallel {
                max_workers: DEFAULT_MAX_WORKERS,
            }),
            other => Err(TaskloomError::InvalidEngine(format!(
                "unknown engine kind: {other}"
            ))),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Sequential => write!(f, "sequential"),
            EngineKind::Parallel { max_workers } => write!(f, "parallel({max_workers})"),
        }
    }
}

pub fn create_engine(kind: EngineKind) -> Result<Arc<dyn ExecutionEngine>, TaskloomError> {
    match kind {
        EngineKind::Sequential => Ok(Arc::new(SequentialEngine::new())),
        EngineKind::Parallel { max_workers } => Ok(Arc::new(ParallelEngine::new(max_workers)?)),
    }
}

/// Aggregated outcome of one `execute` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub success: bool,
    pub task_results: HashMap<TaskId, TaskResult>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub error: Option<String>,
    /// Context as it stood when the run ended.
    pub context: Context,
}

impl WorkflowResult {
    pub(crate) fn start(workflow: &WorkflowDefinition) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow.id().to_string(),
            success: false,
            task_results: HashMap::new(),
            start_time: now,
            end_time: now,
            error: None,
            context: Context::new(),
        }
    }

    pub(crate) fn record(&mut self, result: TaskResult) {
        self.task_results.insert(result.task_id.clone(), result);
    }

    pub(crate) fn finish(mut self, context: Context, error: Option<String>) -> Self {
        self.end_time = Utc::now();
        self.success = error.is_none();
        self.error = error;
        self.context = context;

        if self.success {
            info!(workflow = %self.workflow_id, tasks = self.task_results.len(), "workflow completed");
        } else {
            error!(
                workflow = %self.workflow_id,
                error = self.error.as_deref().unwrap_or_default(),
                "workflow failed"
            );
        }
        self
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskResult> {
        self.task_results.get(task_id)
    }

    pub fn ids_in_state(&self, state: TaskState) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .task_results
            .values()
            .filter(|r| r.state == state)
            .map(|r| r.task_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn completed_ids(&self) -> Vec<TaskId> {
        self.ids_in_state(TaskState::Completed)
    }

    pub fn failed_ids(&self) -> Vec<TaskId> {
        self.ids_in_state(TaskState::Failed)
    }

    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }
}

/// Publish a completed task's output under both its id and its name.
pub(crate) fn publish_output(context: &mut Context, task: &TaskDefinition, result: &TaskResult) {
    if let Some(output) = &result.output {
        context.insert(task.id().to_string(), output.clone());
        context.insert(task.name().to_string(), output.clone());
    }
}

/// Run one task: evaluate its condition, then retry its action with a fixed
/// delay, bounding each attempt by the task timeout. A panicking action is a
/// failed attempt.
pub(crate) async fn run_task(
    task: &TaskDefinition,
    context: Context,
    cancel: &CancellationToken,
) -> TaskResult {
    if cancel.is_cancelled() {
        return TaskResult::finished(task.id(), TaskState::Cancelled);
    }
    if !task.should_run(&context) {
        info!(task = %task.name(), "condition not met, skipping");
        return TaskResult::finished(task.id(), TaskState::Skipped);
    }

    let mut result = TaskResult::new(task.id());
    result.state = TaskState::Running;
    result.start_time = Some(Utc::now());

    let retry_executor = RetryExecutor::new(task.get_retry_policy().clone());
    let timeout = task.get_timeout();

    let outcome = retry_executor
        .execute_with_retry(cancel, task.name(), |_attempt| {
            let action = Arc::clone(task.action());
            let snapshot = context.clone();
            async move {
                let attempt = AssertUnwindSafe(action.run(snapshot)).catch_unwind();
                let finished = match timeout {
                    Some(limit) => tokio::time::timeout(limit, attempt)
                        .await
                        .map_err(|_| anyhow!("timed out after {limit:?}"))?,
                    None => attempt.await,
                };
                finished.map_err(|_| anyhow!("action panicked"))?
            }
        })
        .await;

    result.end_time = Some(Utc::now());
    result.attempts = outcome.attempts;

    match outcome.result {
        Ok(output) => {
            info!(task = %task.name(), attempts = result.attempts, "task completed");
            result.state = TaskState::Completed;
            result.output = Some(output);
        }
        Err(RetryError::Cancelled { .. }) => {
            info!(task = %task.name(), "task cancelled");
            result.state = TaskState::Cancelled;
            result.error = Some("cancelled".to_string());
        }
        Err(RetryError::Exhausted { last_error, .. }) => {
            error!(task = %task.name(), attempts = result.attempts, error = %last_error, "task failed");
            result.state = TaskState::Failed;
            result.error = Some(last_error);
        }
    }

    result
}
