//! Task commands: submit, status, list, cancel, replay, scheduled.
//!
//! Mutating commands build a short-lived in-process coordinator over a
//! local broker, then drain its event stream before exit so cascading
//! effects (dependent cancellation, dead-letter parking) land in the
//! shared database. The serving process converges on queue membership
//! through the scheduler's pending sweep.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use mule_core::broker::MemoryBroker;
use mule_core::codec::Payload;
use mule_core::coordinator::{CancelOutcome, Coordinator, TaskSpec};
use mule_db::models::{Task, WaitMode};
use mule_db::queries::tasks as task_db;

use crate::config::MuleConfig;
use crate::parse_task_id;

/// Build a one-shot coordinator over a process-local broker.
fn one_shot_coordinator(pool: &PgPool, resolved: &MuleConfig) -> Coordinator {
    Coordinator::new(
        pool.clone(),
        Arc::new(MemoryBroker::new()),
        resolved.queue.clone(),
        mule_core::session::SessionConfig::new(resolved.session_config.secret.clone()),
    )
}

pub struct SubmitArgs {
    pub name: String,
    pub args: String,
    pub kwargs: String,
    pub priority: i32,
    pub max_retries: Option<i32>,
    pub retry_base_delay: Option<i32>,
    pub timeout: Option<i32>,
    pub scheduled_at: Option<String>,
    pub cron: Option<String>,
    pub depends_on: Option<String>,
    pub wait_mode: String,
    pub created_by: Option<String>,
}

pub async fn run_submit(pool: &PgPool, resolved: &MuleConfig, args: SubmitArgs) -> Result<()> {
    let parsed_args: serde_json::Value =
        serde_json::from_str(&args.args).context("--args is not valid JSON")?;
    let parsed_kwargs: serde_json::Value =
        serde_json::from_str(&args.kwargs).context("--kwargs is not valid JSON")?;

    let scheduled_at: Option<DateTime<Utc>> = match args.scheduled_at.as_deref() {
        Some(s) => Some(
            DateTime::parse_from_rfc3339(s)
                .context("--scheduled-at is not RFC 3339")?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    let depends_on: Vec<Uuid> = match args.depends_on.as_deref() {
        Some(list) => list
            .split(',')
            .map(|s| parse_task_id(s.trim()))
            .collect::<Result<_>>()?,
        None => Vec::new(),
    };

    let wait_mode: WaitMode = args
        .wait_mode
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let spec = TaskSpec {
        name: args.name,
        args: Payload::encode_json(&parsed_args)?,
        kwargs: Payload::encode_json(&parsed_kwargs)?,
        priority: args.priority,
        max_retries: args.max_retries,
        retry_base_delay_secs: args.retry_base_delay,
        timeout_secs: args.timeout,
        scheduled_at,
        cron_expression: args.cron,
        depends_on,
        wait_mode,
        created_by: args.created_by,
    };

    let coordinator = one_shot_coordinator(pool, resolved);
    let task_id = coordinator.submit(spec).await?;
    coordinator.drain_events(0).await?;

    println!("{task_id}");
    Ok(())
}

pub async fn run_status(pool: &PgPool, task_id: Option<&str>) -> Result<()> {
    match task_id {
        None => {
            let depths = task_db::count_by_status(pool).await?;
            println!("Queue depths:");
            println!("  pending:   {}", depths.pending);
            println!("  scheduled: {}", depths.scheduled);
            println!("  running:   {}", depths.running);
            println!("  completed: {}", depths.completed);
            println!("  failed:    {}", depths.failed);
            println!("  timeout:   {}", depths.timeout);
            println!("  cancelled: {}", depths.cancelled);
            println!("  dead:      {}", depths.dead);
            println!("  total:     {}", depths.total);
        }
        Some(id) => {
            let id = parse_task_id(id)?;
            let task = task_db::get_task(pool, id)
                .await?
                .with_context(|| format!("task {id} not found"))?;
            print_task(&task);

            let edges = mule_db::queries::deps::predecessors_of(pool, id).await?;
            if !edges.is_empty() {
                let mode = edges[0].mode;
                let ids: Vec<String> =
                    edges.iter().map(|e| e.predecessor.to_string()).collect();
                println!("  waits on ({mode}): {}", ids.join(", "));
            }

            let executions = mule_db::queries::executions::list_executions(pool, id).await?;
            if !executions.is_empty() {
                println!("Executions:");
                for e in &executions {
                    let status = e
                        .status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "in flight".to_owned());
                    let duration = e
                        .duration_ms
                        .map(|ms| format!("{ms} ms"))
                        .unwrap_or_else(|| "-".to_owned());
                    println!(
                        "  attempt {} on {}: {} ({})",
                        e.attempt_number, e.worker_id, status, duration
                    );
                }
            }

            if let Some(result) = mule_db::queries::results::get_result(pool, id).await? {
                match result.error_kind {
                    Some(kind) => println!(
                        "Error: [{kind}] {}",
                        result.error_message.unwrap_or_default()
                    ),
                    None => println!(
                        "Result: {}",
                        result
                            .result_data
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "null".to_owned())
                    ),
                }
            }
        }
    }
    Ok(())
}

fn print_task(task: &Task) {
    println!("Task {}", task.id);
    println!("  name:       {}", task.task_name);
    println!("  status:     {}", task.status);
    println!("  priority:   {}", task.priority);
    println!(
        "  retries:    {}/{} (orphaned {}x)",
        task.retry_count, task.max_retries, task.orphan_reassignments
    );
    if let Some(worker) = &task.worker_id {
        println!("  worker:     {worker}");
    }
    if let Some(at) = task.scheduled_at {
        println!("  scheduled:  {at}");
    }
    if let Some(expr) = &task.cron_expression {
        println!("  cron:       {expr}");
    }
    if let Some(parent) = task.parent_task_id {
        println!("  parent:     {parent}");
    }
    println!("  created:    {}", task.created_at);
    if let Some(at) = task.started_at {
        println!("  started:    {at}");
    }
    if let Some(at) = task.completed_at {
        println!("  completed:  {at}");
    }
}

pub async fn run_list(
    pool: &PgPool,
    status: Option<&str>,
    name: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<()> {
    let status = match status {
        Some(s) => Some(s.parse().map_err(|e| anyhow::anyhow!("{e}"))?),
        None => None,
    };
    let filter = task_db::TaskFilter {
        status,
        task_name: name.map(str::to_owned),
        created_by: None,
    };
    let tasks = task_db::list_tasks(pool, &filter, limit, offset).await?;
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    for task in &tasks {
        println!(
            "{}  {:<10} p{:<2} {}  {}",
            task.id, task.status, task.priority, task.task_name, task.created_at
        );
    }
    Ok(())
}

pub async fn run_cancel(pool: &PgPool, resolved: &MuleConfig, task_id: &str) -> Result<()> {
    let id = parse_task_id(task_id)?;
    let coordinator = one_shot_coordinator(pool, resolved);
    match coordinator.cancel(id).await? {
        CancelOutcome::Cancelled => {
            coordinator.drain_events(0).await?;
            println!("Task {id} cancelled.");
        }
        CancelOutcome::Requested => {
            println!("Task {id} is running; cancellation recorded, worker report will be honored.");
        }
    }
    Ok(())
}

pub async fn run_replay(pool: &PgPool, resolved: &MuleConfig, task_id: &str) -> Result<()> {
    let id = parse_task_id(task_id)?;
    let coordinator = one_shot_coordinator(pool, resolved);
    let new_id = coordinator.replay(id).await?;
    println!("{new_id}");
    Ok(())
}

pub async fn run_scheduled(pool: &PgPool) -> Result<()> {
    let tasks = task_db::list_scheduled(pool).await?;
    if tasks.is_empty() {
        println!("No scheduled tasks.");
        return Ok(());
    }
    for task in &tasks {
        let due = task
            .ready_at
            .map(|at| at.to_string())
            .unwrap_or_else(|| "awaiting dependencies".to_owned());
        println!("{}  p{:<2} {}  due {}", task.id, task.priority, task.task_name, due);
    }
    Ok(())
}
