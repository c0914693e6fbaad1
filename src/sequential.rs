use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::executor::{publish_output, run_task};
use crate::{
    Context, EngineKind, ExecutionEngine, TaskResult, TaskState, TaskloomError, WorkflowDefinition,
    WorkflowResult,
};

/// Runs one task at a time, level by level, in definition order.
///
/// The first failed task ends the run: nothing after it is started, not even
/// its siblings in the same level.
#[derive(Debug, Default, Clone)]
pub struct SequentialEngine;

impl SequentialEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecutionEngine for SequentialEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Sequential
    }

    async fn execute_with_cancel(
        &self,
        workflow: &WorkflowDefinition,
        mut context: Context,
        cancel: CancellationToken,
    ) -> Result<WorkflowResult, TaskloomError> {
        let levels = workflow.get_execution_order()?;
        let mut outcome = WorkflowResult::start(workflow);

        info!(
            workflow = %workflow.name(),
            tasks = workflow.len(),
            levels = levels.len(),
            engine = "sequential",
            "workflow started"
        );

        for (depth, level) in levels.iter().enumerate() {
            debug!(workflow = %workflow.name(), level = depth, size = level.len(), "running level");

            for (pos, task) in level.iter().enumerate() {
                let result = run_task(task, context.clone(), &cancel).await;

                match result.state {
                    TaskState::Completed => {
                        publish_output(&mut context, task, &result);
                        outcome.record(result);
                    }
                    TaskState::Failed => {
                        let error = format!(
                            "task {} failed: {}",
                            task.name(),
                            result.error.as_deref().unwrap_or("unknown error")
                        );
                        outcome.record(result);
                        return Ok(outcome.finish(context, Some(error)));
                    }
                    TaskState::Cancelled => {
                        outcome.record(result);
                        let rest = level[pos + 1..]
                            .iter()
                            .chain(levels[depth + 1..].iter().flatten());
                        for pending in rest {
                            outcome.record(TaskResult::finished(pending.id(), TaskState::Cancelled));
                        }
                        return Ok(outcome.finish(context, Some("workflow cancelled".to_string())));
                    }
                    _ => outcome.record(result),
                }
            }
        }

        Ok(outcome.finish(context, None))
    }
}
