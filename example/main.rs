use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use taskloom::*;
use tracing_subscriber::EnvFilter;

fn step(name: &str, deps: &[&str]) -> TaskDefinition {
    let label = name.to_string();
    TaskDefinition::new(
        name,
        action(move |ctx| {
            let label = label.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(json!({
                    "task": label,
                    "inputs": ctx.len(),
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                }))
            }
        }),
    )
    .with_id(name)
    .depends_on(deps.iter().copied())
    .retries(2)
    .retry_delay(Duration::from_millis(50))
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let workflow = WorkflowDefinition::new("pipeline")
        .task(step("task1", &[]))?
        .task(step("task2", &["task1"]))?
        .task(step("task3", &["task1"]))?
        .task(step("task4", &["task2", "task3"]))?
        .task(step("task5", &["task2"]))?
        .task(step("task6", &["task1", "task4", "task5"]))?;

    println!("=== Execution order ===");
    for (depth, level) in workflow.get_execution_order()?.iter().enumerate() {
        let names: Vec<&str> = level.iter().map(|t| t.name()).collect();
        println!("level {depth}: {}", names.join(", "));
    }

    let engine = create_engine("parallel".parse()?)?;
    println!("=== Running on {} ===", engine.kind());
    let result = engine.execute(&workflow, Context::new()).await?;
    println!(
        "success: {}, completed: {:?}, took {}ms",
        result.success,
        result.completed_ids(),
        result.duration_ms()
    );

    println!("=== Scheduler ===");
    let scheduler = Scheduler::new(SchedulerConfig {
        poll_interval_ms: 100,
    });
    let beats = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&beats);
    let heartbeat = scheduler.schedule(
        NewJob::new(sync_job_fn(move |args| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({ "beat": n, "source": args.kwargs.get("source") }))
        }))
        .name("heartbeat")
        .trigger(Scheduler::every(Every::seconds(1))?)
        .kwarg("source", json!("demo"))
        .max_runs(3),
    );

    scheduler.start()?;
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    scheduler.stop().await;

    if let Some(job) = scheduler.get_job(&heartbeat) {
        println!(
            "{} ran {} times, status {}, last result {:?}",
            job.name(),
            job.run_count(),
            job.status(),
            job.result()
        );
    }

    Ok(())
}
