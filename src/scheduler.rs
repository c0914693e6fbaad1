use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    CronTrigger, Every, IntervalTrigger, Job, JobId, JobStatus, NewJob, TaskloomError, Trigger,
};

type Registry = Arc<Mutex<HashMap<JobId, Job>>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the background loop looks for due jobs.
    pub poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

struct LoopHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

/// In-process job registry plus a background loop that runs due jobs.
///
/// Jobs run one after another on the loop task; a failing job is recorded
/// and logged and the loop carries on.
pub struct Scheduler {
    jobs: Registry,
    config: SchedulerConfig,
    runner: Mutex<Option<LoopHandle>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            config,
            runner: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register a job and return its id.
    pub fn schedule(&self, new: NewJob) -> JobId {
        let job = Job::new(new, Utc::now());
        let id = job.id().to_string();
        info!(
            job_id = %id,
            name = %job.name(),
            trigger = %job.trigger(),
            next_run = ?job.next_run(),
            "job scheduled"
        );
        lock(&self.jobs).insert(id.clone(), job);
        id
    }

    /// Mark a job cancelled. It stays listed until [`remove`](Self::remove)d.
    pub fn cancel(&self, id: &str) -> bool {
        match lock(&self.jobs).get_mut(id) {
            Some(job) => {
                job.cancel();
                info!(job_id = %id, "job cancelled");
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &str) -> Option<Job> {
        let removed = lock(&self.jobs).remove(id);
        if removed.is_some() {
            info!(job_id = %id, "job removed");
        }
        removed
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        lock(&self.jobs).get(id).cloned()
    }

    /// All jobs, or those in `status`, ordered by next fire time.
    pub fn list_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        let mut jobs: Vec<Job> = lock(&self.jobs)
            .values()
            .filter(|job| status.is_none_or(|s| job.status() == s))
            .cloned()
            .collect();
        jobs.sort_by(Job::cmp_next_run);
        jobs
    }

    /// Run a job right away, ignoring its trigger. The job's own error is
    /// returned after being recorded.
    pub async fn run_now(&self, id: &str) -> Result<Value, TaskloomError> {
        let run = {
            let mut jobs = lock(&self.jobs);
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| TaskloomError::JobNotFound { id: id.to_string() })?;
            info!(job_id = %id, name = %job.name(), "running job on demand");
            job.begin_run(Utc::now())
        };

        let outcome = run.run().await;

        let mut jobs = lock(&self.jobs);
        match jobs.get_mut(id) {
            Some(job) => job.finish_run(outcome, Utc::now()),
            // removed while running
            None => outcome.map_err(|e| TaskloomError::JobFailed {
                id: id.to_string(),
                message: format!("{e:#}"),
            }),
        }
    }

    /// Run every job that is due now, earliest first. Returns how many ran.
    pub async fn tick(&self) -> usize {
        run_due(&self.jobs, Utc::now()).await
    }

    /// Spawn the background loop on the current Tokio runtime. Calling it
    /// while the loop runs does nothing. Outside a runtime it returns
    /// [`TaskloomError::NoRuntime`].
    pub fn start(&self) -> Result<(), TaskloomError> {
        let runtime = Handle::try_current().map_err(|_| TaskloomError::NoRuntime)?;

        let mut runner = lock(&self.runner);
        if runner.as_ref().is_some_and(|h| !h.join.is_finished()) {
            debug!("scheduler already running");
            return Ok(());
        }

        let shutdown = CancellationToken::new();
        let join = runtime.spawn(run_loop(
            Arc::clone(&self.jobs),
            self.config.poll_interval(),
            shutdown.clone(),
        ));
        *runner = Some(LoopHandle { shutdown, join });
        Ok(())
    }

    /// Stop the background loop and wait for it to exit. A job that is
    /// running finishes first. Safe to call when not running.
    pub async fn stop(&self) {
        let Some(handle) = lock(&self.runner).take() else {
            return;
        };
        handle.shutdown.cancel();
        if let Err(e) = handle.join.await {
            warn!("scheduler loop ended abnormally: {e}");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.runner)
            .as_ref()
            .is_some_and(|h| !h.join.is_finished())
    }

    /// Interval trigger starting now.
    pub fn every(every: Every) -> Result<Trigger, TaskloomError> {
        Ok(IntervalTrigger::new(every)?.into())
    }

    /// One-shot trigger at the next occurrence of `HH:MM` (UTC), today if it
    /// is still ahead, tomorrow otherwise.
    pub fn at(time: &str) -> Result<Trigger, TaskloomError> {
        Ok(Trigger::once(next_occurrence(time, Utc::now())?))
    }

    pub fn cron(expression: &str) -> Result<Trigger, TaskloomError> {
        Ok(CronTrigger::from_expression(expression)?.into())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.runner).take() {
            handle.shutdown.cancel();
        }
    }
}

fn next_occurrence(time: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, TaskloomError> {
    let invalid = || TaskloomError::InvalidTrigger(format!("expected HH:MM, got '{time}'"));

    let (hour, minute) = time.trim().split_once(':').ok_or_else(invalid)?;
    let hour: u32 = hour.parse().map_err(|_| invalid())?;
    let minute: u32 = minute.parse().map_err(|_| invalid())?;
    let at = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)?;

    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        return Ok(today);
    }
    now.date_naive()
        .checked_add_days(Days::new(1))
        .map(|day| day.and_time(at).and_utc())
        .ok_or_else(invalid)
}

async fn run_loop(jobs: Registry, poll_interval: Duration, shutdown: CancellationToken) {
    info!(poll_ms = poll_interval.as_millis() as u64, "scheduler loop started");

    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("scheduler loop shutting down");
                break;
            }
            _ = interval.tick() => {
                let ran = run_due(&jobs, Utc::now()).await;
                if ran > 0 {
                    debug!(count = ran, "scheduler tick executed jobs");
                }
            }
        }
    }
}

/// Execute the jobs due at `now` in `next_run` order. The registry lock is
/// released while a job runs.
async fn run_due(jobs: &Registry, now: DateTime<Utc>) -> usize {
    let due: Vec<JobId> = {
        let registry = lock(jobs);
        let mut due: Vec<&Job> = registry.values().filter(|job| job.is_due(now)).collect();
        due.sort_by(|a, b| a.cmp_next_run(b));
        due.into_iter().map(|job| job.id().to_string()).collect()
    };

    let mut ran = 0;
    for id in due {
        let run = {
            let mut registry = lock(jobs);
            match registry.get_mut(&id) {
                // cancelled or removed since the scan
                Some(job) if job.is_due(now) => {
                    info!(job_id = %id, name = %job.name(), run = job.run_count() + 1, "executing job");
                    job.begin_run(Utc::now())
                }
                _ => continue,
            }
        };

        let outcome = run.run().await;
        ran += 1;

        let mut registry = lock(jobs);
        if let Some(job) = registry.get_mut(&id) {
            match job.finish_run(outcome, Utc::now()) {
                Ok(_) => info!(job_id = %id, next_run = ?job.next_run(), "job completed"),
                Err(e) => error!(job_id = %id, next_run = ?job.next_run(), "job failed: {e}"),
            }
        }
    }
    ran
}
