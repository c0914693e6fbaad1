//! `taskloom` runs dependency-ordered workflows and schedules trigger-based
//! jobs.
//!
//! # Workflows
//!
//! A [`WorkflowDefinition`] holds [`TaskDefinition`]s and their dependency
//! edges. [`WorkflowDefinition::get_execution_order`] groups the tasks into
//! levels; an [`ExecutionEngine`] runs the levels in order, either one task at
//! a time ([`SequentialEngine`]) or on a bounded worker pool
//! ([`ParallelEngine`]).
//!
//! # Jobs
//!
//! A [`Scheduler`] owns [`Job`]s, each driven by a [`Trigger`]:
//!
//! | Variant    | Behaviour                                       |
//! |------------|-------------------------------------------------|
//! | `Once`     | Single fire at an absolute UTC instant          |
//! | `Interval` | Repeat every N seconds from a start time        |
//! | `Cron`     | Five-field cron expression, evaluated in UTC    |

pub mod task;
pub mod retry;
pub mod cycle_check;
pub mod workflow;
pub mod executor;
pub mod sequential;
pub mod parallel;
pub mod trigger;
pub mod cron;
pub mod job;
pub mod scheduler;

pub use task::{
    Action, BoxAction, Condition, TaskDefinition, TaskResult, TaskState, action, sync_action,
};
pub use retry::{RetryExecutor, RetryPolicy};
pub use cycle_check::find_cycle;
pub use workflow::WorkflowDefinition;
pub use executor::{
    DEFAULT_MAX_WORKERS, EngineKind, ExecutionEngine, WorkflowResult, create_engine,
};
pub use sequential::SequentialEngine;
pub use parallel::ParallelEngine;
pub use trigger::{Every, IntervalTrigger, OnceTrigger, Trigger};
pub use cron::CronTrigger;
pub use job::{Job, JobArgs, JobFn, JobRun, JobStatus, NewJob, job_fn, sync_job_fn};
pub use scheduler::{Scheduler, SchedulerConfig};

use std::collections::HashMap;
use thiserror::Error;

/// Shared key/value mapping handed to task actions.
pub type Context = HashMap<String, serde_json::Value>;
pub type TaskId = String;
pub type JobId = String;

#[derive(Error, Debug)]
pub enum TaskloomError {
    #[error("Circular dependency detected: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },
    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },
    #[error("Duplicate task: {0}")]
    DuplicateTask(String),
    #[error("Invalid engine configuration: {0}")]
    InvalidEngine(String),
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),
    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("Job not found: {id}")]
    JobNotFound { id: String },
    #[error("Job {id} failed: {message}")]
    JobFailed { id: String, message: String },
    #[error("No Tokio runtime is available to run the scheduler loop")]
    NoRuntime,
    #[error("Background execution failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, TaskloomError>;
