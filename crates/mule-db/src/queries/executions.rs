//! Query functions for the append-only `task_executions` history.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{ExecutionStatus, TaskExecution};

/// Open an execution row for a freshly claimed attempt.
pub async fn open_execution(
    pool: &PgPool,
    task_id: Uuid,
    attempt_number: i32,
    worker_id: &str,
) -> StoreResult<TaskExecution> {
    let execution = sqlx::query_as::<_, TaskExecution>(
        "INSERT INTO task_executions (task_id, attempt_number, worker_id) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(attempt_number)
    .bind(worker_id)
    .fetch_one(pool)
    .await?;

    Ok(execution)
}

/// Close the open execution row for `(task_id, attempt, worker)`.
///
/// The WHERE clause requires `completed_at IS NULL`, so a report arriving
/// after the attempt was closed as orphaned matches zero rows and the
/// caller discards it.
pub async fn close_execution(
    pool: &PgPool,
    task_id: Uuid,
    attempt_number: i32,
    worker_id: &str,
    status: ExecutionStatus,
    error_message: Option<&str>,
) -> StoreResult<u64> {
    let result = sqlx::query(
        "UPDATE task_executions \
         SET completed_at = NOW(), \
             duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT, \
             status = $4, \
             error_message = $5 \
         WHERE task_id = $1 AND attempt_number = $2 AND worker_id = $3 \
           AND completed_at IS NULL",
    )
    .bind(task_id)
    .bind(attempt_number)
    .bind(worker_id)
    .bind(status)
    .bind(error_message)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// List all executions for a task, oldest first.
pub async fn list_executions(pool: &PgPool, task_id: Uuid) -> StoreResult<Vec<TaskExecution>> {
    let executions = sqlx::query_as::<_, TaskExecution>(
        "SELECT * FROM task_executions \
         WHERE task_id = $1 \
         ORDER BY started_at ASC, id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;

    Ok(executions)
}

/// The most recent execution for a task, if any.
pub async fn latest_execution(pool: &PgPool, task_id: Uuid) -> StoreResult<Option<TaskExecution>> {
    let execution = sqlx::query_as::<_, TaskExecution>(
        "SELECT * FROM task_executions \
         WHERE task_id = $1 \
         ORDER BY started_at DESC, id DESC \
         LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await?;

    Ok(execution)
}

/// Count executions recorded for a task.
pub async fn count_executions(pool: &PgPool, task_id: Uuid) -> StoreResult<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM task_executions WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(pool)
            .await?;

    Ok(row.0)
}
