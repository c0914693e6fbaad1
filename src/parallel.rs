use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::{publish_output, run_task};
use crate::{
    Context, EngineKind, ExecutionEngine, TaskDefinition, TaskResult, TaskState, TaskloomError,
    WorkflowDefinition, WorkflowResult,
};

/// Runs each level's tasks concurrently on at most `max_workers` workers.
///
/// Every task of a level sees the same context snapshot taken when the level
/// starts. Outputs are merged back once they arrive, so the next level sees
/// everything its predecessors produced. When a task fails, siblings that have
/// not started are cancelled, running ones finish, and no further level runs.
#[derive(Debug, Clone)]
pub struct ParallelEngine {
    max_workers: usize,
}

impl ParallelEngine {
    pub fn new(max_workers: usize) -> Result<Self, TaskloomError> {
        if max_workers == 0 {
            return Err(TaskloomError::InvalidEngine(
                "parallel engine needs at least one worker".to_string(),
            ));
        }
        Ok(Self { max_workers })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}

#[async_trait]
impl ExecutionEngine for ParallelEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Parallel {
            max_workers: self.max_workers,
        }
    }

    async fn execute_with_cancel(
        &self,
        workflow: &WorkflowDefinition,
        mut context: Context,
        cancel: CancellationToken,
    ) -> Result<WorkflowResult, TaskloomError> {
        let levels = workflow.get_execution_order()?;
        let mut outcome = WorkflowResult::start(workflow);
        let semaphore = Arc::new(Semaphore::new(self.max_workers));

        info!(
            workflow = %workflow.name(),
            tasks = workflow.len(),
            levels = levels.len(),
            engine = "parallel",
            max_workers = self.max_workers,
            "workflow started"
        );

        for (depth, level) in levels.iter().enumerate() {
            debug!(workflow = %workflow.name(), level = depth, size = level.len(), "running level");

            let level_cancel = cancel.child_token();
            let snapshot = Arc::new(context.clone());
            let mut running = JoinSet::new();

            for task in level {
                running.spawn(run_in_pool(
                    (*task).clone(),
                    Arc::clone(&snapshot),
                    Arc::clone(&semaphore),
                    level_cancel.clone(),
                    cancel.clone(),
                ));
            }

            let mut failure: Option<String> = None;
            while let Some(joined) = running.join_next().await {
                let (task, result) = match joined {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(workflow = %workflow.name(), error = %e, "worker did not finish");
                        level_cancel.cancel();
                        failure.get_or_insert_with(|| format!("worker did not finish: {e}"));
                        continue;
                    }
                };

                match result.state {
                    TaskState::Completed => publish_output(&mut context, &task, &result),
                    TaskState::Failed => {
                        level_cancel.cancel();
                        failure.get_or_insert_with(|| {
                            format!(
                                "task {} failed: {}",
                                task.name(),
                                result.error.as_deref().unwrap_or("unknown error")
                            )
                        });
                    }
                    _ => {}
                }
                outcome.record(result);
            }

            if let Some(error) = failure {
                return Ok(outcome.finish(context, Some(error)));
            }

            if cancel.is_cancelled() {
                for pending in levels[depth + 1..].iter().flatten() {
                    outcome.record(TaskResult::finished(pending.id(), TaskState::Cancelled));
                }
                return Ok(outcome.finish(context, Some("workflow cancelled".to_string())));
            }
        }

        Ok(outcome.finish(context, None))
    }
}

/// Wait for a worker slot, then run `task` unless its level was cancelled
/// in the meantime.
async fn run_in_pool(
    task: TaskDefinition,
    snapshot: Arc<Context>,
    semaphore: Arc<Semaphore>,
    level_cancel: CancellationToken,
    run_cancel: CancellationToken,
) -> (TaskDefinition, TaskResult) {
    let permit = tokio::select! {
        permit = semaphore.acquire_owned() => permit.ok(),
        _ = level_cancel.cancelled() => None,
    };
    let Some(_permit) = permit.filter(|_| !level_cancel.is_cancelled()) else {
        let result = TaskResult::finished(task.id(), TaskState::Cancelled);
        return (task, result);
    };

    let result = run_task(&task, Context::clone(&snapshot), &run_cancel).await;
    (task, result)
}
