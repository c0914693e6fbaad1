use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use chrono::{Timelike, Utc};
use serde_json::json;
use taskloom::*;

fn fast_scheduler() -> Scheduler {
    Scheduler::new(SchedulerConfig {
        poll_interval_ms: 20,
    })
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn has_status(scheduler: &Scheduler, id: &str, status: JobStatus) -> bool {
    scheduler.get_job(id).is_some_and(|job| job.status() == status)
}

fn counting(count: &Arc<AtomicUsize>) -> JobFn {
    let count = Arc::clone(count);
    sync_job_fn(move |_| Ok(json!(count.fetch_add(1, Ordering::SeqCst) + 1)))
}

#[tokio::test]
async fn run_now_returns_exact_value_without_loop() {
    let scheduler = fast_scheduler();
    let id = scheduler.schedule(
        NewJob::new(job_fn(|args: JobArgs| async move {
            Ok(json!({ "args": args.args, "ok": true }))
        }))
        .trigger(Scheduler::every(Every::seconds(1)).unwrap())
        .args(vec![json!("a"), json!(2)]),
    );

    assert!(!scheduler.is_running());
    let value = scheduler.run_now(&id).await.unwrap();
    assert_eq!(value, json!({ "args": ["a", 2], "ok": true }));
}

#[tokio::test]
async fn cancelled_job_is_listed_by_status() {
    let scheduler = fast_scheduler();
    let count = Arc::new(AtomicUsize::new(0));
    let id = scheduler.schedule(
        NewJob::new(counting(&count)).trigger(Scheduler::every(Every::minutes(5)).unwrap()),
    );

    assert!(scheduler.cancel(&id));

    let cancelled: Vec<String> = scheduler
        .list_jobs(Some(JobStatus::Cancelled))
        .iter()
        .map(|j| j.id().to_string())
        .collect();
    assert_eq!(cancelled, vec![id.clone()]);
    assert!(scheduler
        .list_jobs(Some(JobStatus::Pending))
        .iter()
        .all(|j| j.id() != id));
}

#[tokio::test]
async fn loop_runs_due_jobs() {
    let scheduler = fast_scheduler();
    let count = Arc::new(AtomicUsize::new(0));
    let id = scheduler.schedule(NewJob::new(counting(&count)).name("now"));

    scheduler.start().unwrap();
    wait_until(|| has_status(&scheduler, &id, JobStatus::Completed)).await;
    scheduler.stop().await;

    let job = scheduler.get_job(&id).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(job.status(), JobStatus::Completed);
    assert_eq!(job.run_count(), 1);
    assert_eq!(job.next_run(), None);
}

#[tokio::test]
async fn starting_twice_keeps_one_loop() {
    let scheduler = fast_scheduler();
    scheduler.start().unwrap();
    scheduler.start().unwrap();
    assert!(scheduler.is_running());

    scheduler.stop().await;
    assert!(!scheduler.is_running());

    // a second, orphaned loop would still pick this up
    let count = Arc::new(AtomicUsize::new(0));
    scheduler.schedule(NewJob::new(counting(&count)));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn interval_job_is_not_duplicated() {
    let scheduler = fast_scheduler();
    let count = Arc::new(AtomicUsize::new(0));
    let first_fire = Utc::now() + chrono::Duration::milliseconds(100);
    let trigger = IntervalTrigger::new(Every::hours(1))
        .unwrap()
        .starting_at(first_fire);
    let id = scheduler.schedule(NewJob::new(counting(&count)).trigger(trigger));

    scheduler.start().unwrap();
    scheduler.start().unwrap();
    wait_until(|| count.load(Ordering::SeqCst) >= 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    scheduler.stop().await;

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(
        scheduler.get_job(&id).unwrap().next_run(),
        Some(first_fire + chrono::Duration::hours(1))
    );
}

#[tokio::test]
async fn failing_job_does_not_stop_the_loop() {
    let scheduler = fast_scheduler();
    let count = Arc::new(AtomicUsize::new(0));
    let bad = scheduler.schedule(
        NewJob::new(sync_job_fn(|_| Err(anyhow!("disk full")))).name("bad"),
    );
    let good = scheduler.schedule(NewJob::new(counting(&count)).name("good"));

    scheduler.start().unwrap();
    wait_until(|| {
        has_status(&scheduler, &bad, JobStatus::Failed)
            && has_status(&scheduler, &good, JobStatus::Completed)
    })
    .await;
    assert!(scheduler.is_running());
    scheduler.stop().await;

    let bad = scheduler.get_job(&bad).unwrap();
    assert_eq!(bad.status(), JobStatus::Failed);
    assert_eq!(bad.error(), Some("disk full"));
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn max_runs_limits_executions() {
    let scheduler = fast_scheduler();
    let count = Arc::new(AtomicUsize::new(0));
    let id = scheduler.schedule(
        NewJob::new(counting(&count))
            .trigger(Scheduler::every(Every::seconds(1)).unwrap())
            .max_runs(2),
    );

    scheduler.run_now(&id).await.unwrap();
    assert!(scheduler.get_job(&id).unwrap().next_run().is_some());
    scheduler.run_now(&id).await.unwrap();

    let job = scheduler.get_job(&id).unwrap();
    assert_eq!(job.run_count(), 2);
    assert_eq!(job.next_run(), None);
    assert_eq!(scheduler.tick().await, 0);
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn at_builds_a_future_one_shot() {
    let now = Utc::now();
    let later = now + chrono::Duration::hours(2);
    let trigger = Scheduler::at(&format!("{:02}:{:02}", later.hour(), later.minute())).unwrap();

    let Trigger::Once(once) = trigger else {
        panic!("expected a one-shot trigger");
    };
    assert!(once.run_at() > now);
    assert!(once.run_at() <= later);
    assert_eq!(once.run_at().second(), 0);
}

#[test]
fn cron_builder_checks_arity() {
    let trigger = CronTrigger::from_expression("30 8 * * 1").unwrap();
    assert_eq!(trigger.minute(), "30");
    assert_eq!(trigger.hour(), "8");
    assert_eq!(trigger.day_of_week(), "1");

    assert!(matches!(
        Scheduler::cron("30 8 *"),
        Err(TaskloomError::InvalidCron(_))
    ));
}

#[tokio::test]
async fn removed_job_is_gone() {
    let scheduler = fast_scheduler();
    let count = Arc::new(AtomicUsize::new(0));
    let id = scheduler.schedule(NewJob::new(counting(&count)));

    assert!(scheduler.remove(&id).is_some());
    assert!(scheduler.remove(&id).is_none());
    assert!(matches!(
        scheduler.run_now(&id).await,
        Err(TaskloomError::JobNotFound { .. })
    ));
    assert_eq!(scheduler.tick().await, 0);
}
