use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::{JobId, TaskloomError, Trigger};

/// Positional and keyword arguments bound to a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobArgs {
    pub args: Vec<Value>,
    pub kwargs: HashMap<String, Value>,
}

/// The callable a job runs.
pub type JobFn = Arc<dyn Fn(JobArgs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

pub fn job_fn<F, Fut>(f: F) -> JobFn
where
    F: Fn(JobArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |args: JobArgs| f(args).boxed())
}

pub fn sync_job_fn<F>(f: F) -> JobFn
where
    F: Fn(&JobArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |args: JobArgs| {
        let f = Arc::clone(&f);
        async move { f(&args) }.boxed()
    })
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its next_run time.
    Pending,
    /// Currently being executed.
    Running,
    /// Last execution succeeded.
    Completed,
    /// Last execution returned an error.
    Failed,
    /// Excluded from scheduling; stays listed until removed.
    Cancelled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Everything needed to register a job. Only `func` is required.
pub struct NewJob {
    func: JobFn,
    trigger: Option<Trigger>,
    name: Option<String>,
    args: JobArgs,
    max_runs: Option<u32>,
}

impl NewJob {
    pub fn new(func: JobFn) -> Self {
        Self {
            func,
            trigger: None,
            name: None,
            args: JobArgs::default(),
            max_runs: None,
        }
    }

    pub fn trigger(mut self, trigger: impl Into<Trigger>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args.args = args;
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.kwargs.insert(key.into(), value);
        self
    }

    /// Stop after `n` successful runs. `0` means unlimited.
    pub fn max_runs(mut self, n: u32) -> Self {
        self.max_runs = (n > 0).then_some(n);
        self
    }
}

/// A job's callable and arguments, detached from the job so it can be awaited
/// without holding the job.
pub struct JobRun {
    func: JobFn,
    args: JobArgs,
}

impl JobRun {
    /// Run the callable; a panic is reported as an error.
    pub async fn run(self) -> anyhow::Result<Value> {
        AssertUnwindSafe((self.func)(self.args))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow!("job panicked")))
    }
}

/// A schedulable unit: callable, arguments, trigger and run history.
#[derive(Clone)]
pub struct Job {
    id: JobId,
    name: String,
    func: JobFn,
    args: JobArgs,
    trigger: Trigger,
    max_runs: Option<u32>,
    run_count: u32,
    status: JobStatus,
    result: Option<Value>,
    error: Option<String>,
    next_run: Option<DateTime<Utc>>,
    last_run: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl Job {
    /// Build a job; without a trigger it fires once, right away.
    pub fn new(new: NewJob, now: DateTime<Utc>) -> Self {
        let id = Uuid::new_v4().to_string();
        let name = new
            .name
            .unwrap_or_else(|| format!("job-{}", &id[..8]));
        let trigger = new.trigger.unwrap_or_else(|| Trigger::once(now));
        let next_run = trigger.first_run(now);

        Self {
            id,
            name,
            func: new.func,
            args: new.args,
            trigger,
            max_runs: new.max_runs,
            run_count: 0,
            status: JobStatus::Pending,
            result: None,
            error: None,
            next_run,
            last_run: None,
            created_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &JobArgs {
        &self.args
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn max_runs(&self) -> Option<u32> {
        self.max_runs
    }

    pub fn run_count(&self) -> u32 {
        self.run_count
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.next_run
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.last_run
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn cancel(&mut self) {
        self.status = JobStatus::Cancelled;
    }

    /// Due when `next_run` has arrived and the job is neither cancelled nor
    /// already running.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !matches!(self.status, JobStatus::Cancelled | JobStatus::Running)
            && self.next_run.is_some_and(|at| at <= now)
    }

    fn max_runs_reached(&self) -> bool {
        self.max_runs.is_some_and(|max| self.run_count >= max)
    }

    /// Order by `next_run`, earliest first; jobs with nothing scheduled last.
    pub fn cmp_next_run(&self, other: &Job) -> Ordering {
        match (self.next_run, other.next_run) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }

    /// Mark the job running and hand out its callable.
    pub fn begin_run(&mut self, now: DateTime<Utc>) -> JobRun {
        if self.status != JobStatus::Cancelled {
            self.status = JobStatus::Running;
        }
        self.last_run = Some(now);
        JobRun {
            func: Arc::clone(&self.func),
            args: self.args.clone(),
        }
    }

    /// Record the outcome of a run started with [`begin_run`](Self::begin_run)
    /// and compute the next fire time from `now`.
    pub fn finish_run(
        &mut self,
        outcome: anyhow::Result<Value>,
        now: DateTime<Utc>,
    ) -> Result<Value, TaskloomError> {
        let cancelled = self.status == JobStatus::Cancelled;

        match outcome {
            Ok(value) => {
                self.run_count += 1;
                self.result = Some(value.clone());
                self.error = None;
                if !cancelled {
                    self.status = JobStatus::Completed;
                }
                self.next_run = if self.max_runs_reached() {
                    None
                } else {
                    self.trigger.next_run(now)
                };
                debug!(job_id = %self.id, run = self.run_count, next_run = ?self.next_run, "job run recorded");
                Ok(value)
            }
            Err(e) => {
                let message = format!("{e:#}");
                self.error = Some(message.clone());
                if !cancelled {
                    self.status = JobStatus::Failed;
                }
                self.next_run = self.trigger.next_run(now);
                Err(TaskloomError::JobFailed {
                    id: self.id.clone(),
                    message,
                })
            }
        }
    }

    /// Run the job now and record the outcome. Errors from the callable are
    /// returned after being recorded.
    pub async fn execute(&mut self) -> Result<Value, TaskloomError> {
        let run = self.begin_run(Utc::now());
        let outcome = run.run().await;
        self.finish_run(outcome, Utc::now())
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("args", &self.args)
            .field("trigger", &self.trigger)
            .field("max_runs", &self.max_runs)
            .field("run_count", &self.run_count)
            .field("status", &self.status)
            .field("result", &self.result)
            .field("error", &self.error)
            .field("next_run", &self.next_run)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Every, IntervalTrigger};
    use chrono::{Duration, TimeZone};
    use rstest::rstest;
    use serde_json::json;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    fn constant(value: Value) -> JobFn {
        sync_job_fn(move |_| Ok(value.clone()))
    }

    #[test]
    fn default_trigger_is_due_immediately() {
        let job = Job::new(NewJob::new(constant(json!(1))), noon());
        assert_eq!(job.next_run(), Some(noon()));
        assert!(job.is_due(noon()));
        assert!(job.name().starts_with("job-"));
        assert_eq!(job.status(), JobStatus::Pending);
    }

    #[tokio::test]
    async fn execute_records_result_and_reschedules() {
        let trigger = IntervalTrigger::new(Every::seconds(60)).unwrap();
        let mut job = Job::new(
            NewJob::new(constant(json!("ok"))).trigger(trigger).name("tick"),
            Utc::now(),
        );

        let value = job.execute().await.unwrap();
        assert_eq!(value, json!("ok"));
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.run_count(), 1);
        assert_eq!(job.result(), Some(&json!("ok")));
        assert!(job.next_run().unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn max_runs_clears_next_run() {
        let trigger = IntervalTrigger::new(Every::seconds(1)).unwrap();
        let mut job = Job::new(
            NewJob::new(constant(json!(null))).trigger(trigger).max_runs(2),
            Utc::now(),
        );

        job.execute().await.unwrap();
        assert!(job.next_run().is_some());
        job.execute().await.unwrap();
        assert_eq!(job.next_run(), None);
        assert_eq!(job.run_count(), 2);
    }

    #[test]
    fn zero_max_runs_means_unlimited() {
        let job = Job::new(NewJob::new(constant(json!(1))).max_runs(0), noon());
        assert_eq!(job.max_runs(), None);
    }

    #[tokio::test]
    async fn failure_is_recorded_and_returned() {
        let mut job = Job::new(
            NewJob::new(sync_job_fn(|_| Err(anyhow!("quota exceeded")))),
            Utc::now(),
        );

        let err = job.execute().await.unwrap_err();
        assert!(matches!(err, TaskloomError::JobFailed { .. }));
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error(), Some("quota exceeded"));
        assert_eq!(job.run_count(), 0);
        // a spent one-shot trigger is not retried
        assert_eq!(job.next_run(), None);
    }

    #[tokio::test]
    async fn panic_is_reported_as_failure() {
        let mut job = Job::new(NewJob::new(sync_job_fn(|_| panic!("boom"))), Utc::now());
        let err = job.execute().await.unwrap_err();
        assert!(err.to_string().contains("job panicked"));
        assert_eq!(job.status(), JobStatus::Failed);
    }

    #[tokio::test]
    async fn args_reach_the_callable() {
        let func = job_fn(|args: JobArgs| async move {
            let base = args.args.first().and_then(Value::as_i64).unwrap_or_default();
            let bonus = args.kwargs.get("bonus").and_then(Value::as_i64).unwrap_or_default();
            Ok(json!(base + bonus))
        });
        let mut job = Job::new(
            NewJob::new(func).args(vec![json!(40)]).kwarg("bonus", json!(2)),
            Utc::now(),
        );
        assert_eq!(job.execute().await.unwrap(), json!(42));
    }

    #[test]
    fn cancelled_job_is_never_due() {
        let mut job = Job::new(NewJob::new(constant(json!(1))), noon());
        job.cancel();
        assert!(!job.is_due(noon() + Duration::hours(1)));
    }

    #[rstest]
    #[case::both_scheduled(Some(0), Some(5), Ordering::Less)]
    #[case::later_first(Some(5), Some(0), Ordering::Greater)]
    #[case::unscheduled_last(None, Some(5), Ordering::Greater)]
    #[case::scheduled_first(Some(5), None, Ordering::Less)]
    #[case::both_unscheduled(None, None, Ordering::Equal)]
    fn orders_by_next_run(
        #[case] a: Option<i64>,
        #[case] b: Option<i64>,
        #[case] expected: Ordering,
    ) {
        let job_at = |offset: Option<i64>| {
            let mut job = Job::new(NewJob::new(constant(json!(1))), noon());
            job.next_run = offset.map(|m| noon() + Duration::minutes(m));
            job
        };
        assert_eq!(job_at(a).cmp_next_run(&job_at(b)), expected);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("missed".parse::<JobStatus>().is_err());
    }
}
