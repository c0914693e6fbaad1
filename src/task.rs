use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Context, RetryPolicy, TaskId};

/// Unit of work run by a task. Receives an owned snapshot of the workflow
/// context.
#[async_trait]
pub trait Action: Send + Sync {
    async fn run(&self, ctx: Context) -> anyhow::Result<Value>;
}

pub type BoxAction = Arc<dyn Action>;

/// Predicate deciding whether a task runs at all.
pub type Condition = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, ctx: Context) -> anyhow::Result<Value> {
        (self.0)(ctx).await
    }
}

struct SyncAction<F>(F);

#[async_trait]
impl<F> Action for SyncAction<F>
where
    F: Fn(&Context) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    async fn run(&self, ctx: Context) -> anyhow::Result<Value> {
        (self.0)(&ctx)
    }
}

/// Wrap an async closure as an [`Action`].
pub fn action<F, Fut>(f: F) -> BoxAction
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnAction(f))
}

/// Wrap a blocking-free synchronous closure as an [`Action`].
pub fn sync_action<F>(f: F) -> BoxAction
where
    F: Fn(&Context) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(SyncAction(f))
}

/// Declarative description of one task in a workflow.
///
/// Built with [`TaskDefinition::new`] and the chained setters; once handed to
/// a [`WorkflowDefinition`](crate::WorkflowDefinition) it is only read.
#[derive(Clone)]
pub struct TaskDefinition {
    id: TaskId,
    name: String,
    action: BoxAction,
    dependencies: Vec<String>,
    timeout: Option<Duration>,
    retry: RetryPolicy,
    condition: Option<Condition>,
    metadata: HashMap<String, Value>,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, action: BoxAction) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            action,
            dependencies: Vec::new(),
            timeout: None,
            retry: RetryPolicy::default(),
            condition: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Ids or names of tasks that must complete first.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Upper bound for a single attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retry.retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry.retry_delay = delay;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn condition<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(predicate));
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action(&self) -> &BoxAction {
        &self.action
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn get_retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn get_metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// `true` when there is no condition or the condition holds for `ctx`.
    pub fn should_run(&self, ctx: &Context) -> bool {
        self.condition.as_ref().is_none_or(|cond| cond(ctx))
    }

    /// Whether `key` refers to this task by id or by name.
    pub fn answers_to(&self, key: &str) -> bool {
        self.id == key || self.name == key
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("has_condition", &self.condition.is_some())
            .field("metadata", &self.metadata)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled | TaskState::Skipped
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one task within one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub state: TaskState,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl TaskResult {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            state: TaskState::Pending,
            output: None,
            error: None,
            start_time: None,
            end_time: None,
            attempts: 0,
        }
    }

    pub(crate) fn finished(task_id: &str, state: TaskState) -> Self {
        let now = Utc::now();
        Self {
            state,
            start_time: Some(now),
            end_time: Some(now),
            ..Self::new(task_id)
        }
    }

    /// Milliseconds between start and end, 0 when either is missing.
    pub fn duration_ms(&self) -> i64 {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).num_milliseconds(),
            _ => 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == TaskState::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.state == TaskState::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    #[test]
    fn duration_is_zero_without_both_timestamps() {
        let mut result = TaskResult::new("t");
        assert_eq!(result.duration_ms(), 0);

        result.start_time = Some(Utc::now());
        assert_eq!(result.duration_ms(), 0);
    }

    #[test]
    fn duration_measures_start_to_end() {
        let start = Utc::now();
        let mut result = TaskResult::new("t");
        result.start_time = Some(start);
        result.end_time = Some(start + ChronoDuration::milliseconds(250));
        assert_eq!(result.duration_ms(), 250);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = TaskDefinition::new("a", sync_action(|_| Ok(json!(1))));
        let b = TaskDefinition::new("a", sync_action(|_| Ok(json!(1))));
        assert_ne!(a.id(), b.id());
        assert!(a.answers_to("a"));
        assert!(a.answers_to(a.id()));
    }

    #[test]
    fn condition_defaults_to_run() {
        let task = TaskDefinition::new("a", sync_action(|_| Ok(Value::Null)));
        assert!(task.should_run(&Context::new()));

        let gated = task.condition(|ctx| ctx.contains_key("go"));
        assert!(!gated.should_run(&Context::new()));
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(serde_json::to_value(TaskState::Skipped).unwrap(), json!("skipped"));
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
    }

    #[tokio::test]
    async fn async_action_receives_context() {
        let act = action(|ctx: Context| async move {
            Ok(ctx.get("x").cloned().unwrap_or(Value::Null))
        });
        let mut ctx = Context::new();
        ctx.insert("x".into(), json!(7));
        assert_eq!(act.run(ctx).await.unwrap(), json!(7));
    }
}
