//! Query functions for the `tasks` table.
//!
//! Every status mutation is an optimistic-lock UPDATE whose WHERE clause
//! includes the expected current state. Functions return the number of
//! rows affected; zero means the state moved under the caller, who maps
//! it to `StoreError::Conflict` with the context it has.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{Task, TaskStatus};

/// Parameters for inserting a new task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_name: String,
    pub args: serde_json::Value,
    pub kwargs: serde_json::Value,
    pub priority: i32,
    pub status: TaskStatus,
    pub max_retries: i32,
    pub retry_base_delay_secs: i32,
    pub timeout_secs: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    pub parent_task_id: Option<Uuid>,
    pub created_by: Option<String>,
}

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, created_at, retry_count).
pub async fn insert_task(pool: &PgPool, new: &NewTask) -> StoreResult<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (task_name, args, kwargs, priority, status, max_retries, \
                            retry_base_delay_secs, timeout_secs, scheduled_at, ready_at, \
                            cron_expression, parent_task_id, created_by) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
         RETURNING *",
    )
    .bind(&new.task_name)
    .bind(&new.args)
    .bind(&new.kwargs)
    .bind(new.priority)
    .bind(new.status)
    .bind(new.max_retries)
    .bind(new.retry_base_delay_secs)
    .bind(new.timeout_secs)
    .bind(new.scheduled_at)
    .bind(new.ready_at)
    .bind(&new.cron_expression)
    .bind(new.parent_task_id)
    .bind(&new.created_by)
    .fetch_one(pool)
    .await?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> StoreResult<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(task)
}

/// Filter for [`list_tasks`]. All fields are conjunctive; `None` matches
/// everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_name: Option<String>,
    pub created_by: Option<String>,
}

/// List tasks matching a filter, newest first, with limit/offset paging.
pub async fn list_tasks(
    pool: &PgPool,
    filter: &TaskFilter,
    limit: i64,
    offset: i64,
) -> StoreResult<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE ($1::text IS NULL OR status = $1) \
           AND ($2::text IS NULL OR task_name = $2) \
           AND ($3::text IS NULL OR created_by = $3) \
         ORDER BY created_at DESC \
         LIMIT $4 OFFSET $5",
    )
    .bind(filter.status.map(|s| s.to_string()))
    .bind(&filter.task_name)
    .bind(&filter.created_by)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(tasks)
}

/// Atomically transition a task from one status to another.
///
/// `started_at`/`completed_at` are applied with COALESCE so passing `None`
/// leaves the stored value untouched. Returns rows affected (0 means the
/// status did not match `from`).
pub async fn transition_task_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> StoreResult<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at) \
         WHERE id = $4 AND status = $5",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Claim a pending task for a worker: `pending -> running` with the worker
/// id and `started_at` set atomically. Exactly one concurrent claimant
/// wins; the rest match zero rows.
pub async fn claim_task(pool: &PgPool, task_id: Uuid, worker_id: &str) -> StoreResult<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'running', worker_id = $2, started_at = NOW() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(task_id)
    .bind(worker_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Record the outcome of a running attempt: `running -> failed|timeout|completed`.
///
/// The WHERE clause pins both status and worker id so a report from a
/// worker whose task was reassigned matches zero rows. `worker_id` is
/// cleared because only running tasks hold one; `completed_at` is set only
/// for the terminal `completed` outcome.
pub async fn finish_running(
    pool: &PgPool,
    task_id: Uuid,
    worker_id: &str,
    to: TaskStatus,
) -> StoreResult<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $2, \
             worker_id = NULL, \
             completed_at = CASE WHEN $2 = 'completed' THEN NOW() ELSE completed_at END \
         WHERE id = $1 AND status = 'running' AND worker_id = $3",
    )
    .bind(task_id)
    .bind(to)
    .bind(worker_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Schedule a retry: `failed|timeout -> scheduled` with an incremented
/// retry counter and the backoff deadline. The lock covers status and the
/// current retry count so two retry decisions cannot both apply.
pub async fn retry_to_scheduled(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    current_retry_count: i32,
    ready_at: DateTime<Utc>,
) -> StoreResult<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'scheduled', \
             retry_count = retry_count + 1, \
             ready_at = $3, \
             started_at = NULL \
         WHERE id = $1 AND status = $2 AND retry_count = $4",
    )
    .bind(task_id)
    .bind(from)
    .bind(ready_at)
    .bind(current_retry_count)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Park a task permanently: `from -> dead`.
pub async fn mark_dead(pool: &PgPool, task_id: Uuid, from: TaskStatus) -> StoreResult<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'dead', worker_id = NULL, completed_at = NOW() \
         WHERE id = $1 AND status = $2",
    )
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Reassign an orphaned task: `running -> pending`, clearing the worker
/// and bumping the orphan counter. The retry counter is untouched.
pub async fn release_orphan(pool: &PgPool, task_id: Uuid, worker_id: &str) -> StoreResult<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             worker_id = NULL, \
             started_at = NULL, \
             orphan_reassignments = orphan_reassignments + 1 \
         WHERE id = $1 AND status = 'running' AND worker_id = $2",
    )
    .bind(task_id)
    .bind(worker_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Promote a due scheduled task: `scheduled -> pending`, clearing the
/// readiness deadline.
pub async fn promote_scheduled(pool: &PgPool, task_id: Uuid) -> StoreResult<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', ready_at = NULL \
         WHERE id = $1 AND status = 'scheduled'",
    )
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Record a cancellation request against a running task. The worker is
/// not interrupted; its eventual report is honored.
pub async fn request_cancel(pool: &PgPool, task_id: Uuid) -> StoreResult<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET cancel_requested = TRUE \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Reset a dead task for dead-letter requeue: `dead -> pending` with a
/// zeroed retry and orphan budget.
pub async fn requeue_dead(pool: &PgPool, task_id: Uuid) -> StoreResult<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             retry_count = 0, \
             orphan_reassignments = 0, \
             ready_at = NULL, \
             started_at = NULL, \
             completed_at = NULL \
         WHERE id = $1 AND status = 'dead'",
    )
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Select scheduled tasks whose readiness deadline has passed, oldest
/// deadline first.
pub async fn select_due_scheduled(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> StoreResult<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'scheduled' AND ready_at IS NOT NULL AND ready_at <= $1 \
         ORDER BY ready_at ASC \
         LIMIT $2",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(tasks)
}

/// Select every task a given worker currently holds as running.
pub async fn select_running_for_worker(pool: &PgPool, worker_id: &str) -> StoreResult<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = 'running' AND worker_id = $1",
    )
    .bind(worker_id)
    .fetch_all(pool)
    .await?;

    Ok(tasks)
}

/// Select running tasks whose per-task timeout has elapsed.
pub async fn select_running_past_timeout(
    pool: &PgPool,
    now: DateTime<Utc>,
) -> StoreResult<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'running' \
           AND started_at IS NOT NULL \
           AND started_at + make_interval(secs => timeout_secs) <= $1",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;

    Ok(tasks)
}

/// All pending tasks in enqueue order (creation order), used to re-seed
/// the broker queues after a restart.
pub async fn list_pending_in_order(pool: &PgPool) -> StoreResult<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = 'pending' ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await?;

    Ok(tasks)
}

/// All scheduled tasks, soonest deadline first (deadline-less, i.e.
/// dependency-gated, tasks last).
pub async fn list_scheduled(pool: &PgPool) -> StoreResult<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = 'scheduled' \
         ORDER BY ready_at ASC NULLS LAST, created_at ASC",
    )
    .fetch_all(pool)
    .await?;

    Ok(tasks)
}

/// Task counts by status across the whole store.
#[derive(Debug, Clone, Default)]
pub struct QueueDepths {
    pub pending: i64,
    pub scheduled: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub timeout: i64,
    pub dead: i64,
    pub total: i64,
}

/// Get a summary of task counts by status.
pub async fn count_by_status(pool: &PgPool) -> StoreResult<QueueDepths> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt FROM tasks GROUP BY status",
    )
    .fetch_all(pool)
    .await?;

    let mut depths = QueueDepths::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => depths.pending = *count,
            "scheduled" => depths.scheduled = *count,
            "running" => depths.running = *count,
            "completed" => depths.completed = *count,
            "failed" => depths.failed = *count,
            "cancelled" => depths.cancelled = *count,
            "timeout" => depths.timeout = *count,
            "dead" => depths.dead = *count,
            _ => {}
        }
        depths.total += count;
    }
    Ok(depths)
}
