//! Query functions for the `task_results` table (one row per task).

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::TaskResult;

/// Record a successful result, replacing any earlier attempt's failure.
pub async fn record_success(
    pool: &PgPool,
    task_id: Uuid,
    result_data: &serde_json::Value,
) -> StoreResult<TaskResult> {
    let result = sqlx::query_as::<_, TaskResult>(
        "INSERT INTO task_results (task_id, result_data, error_kind, error_message, traceback) \
         VALUES ($1, $2, NULL, NULL, NULL) \
         ON CONFLICT (task_id) DO UPDATE \
         SET result_data = EXCLUDED.result_data, \
             error_kind = NULL, error_message = NULL, traceback = NULL, \
             recorded_at = NOW() \
         RETURNING *",
    )
    .bind(task_id)
    .bind(result_data)
    .fetch_one(pool)
    .await?;

    Ok(result)
}

/// Record a failure outcome for the latest attempt.
pub async fn record_failure(
    pool: &PgPool,
    task_id: Uuid,
    error_kind: &str,
    error_message: &str,
    traceback: Option<&str>,
) -> StoreResult<TaskResult> {
    let result = sqlx::query_as::<_, TaskResult>(
        "INSERT INTO task_results (task_id, result_data, error_kind, error_message, traceback) \
         VALUES ($1, NULL, $2, $3, $4) \
         ON CONFLICT (task_id) DO UPDATE \
         SET result_data = NULL, \
             error_kind = EXCLUDED.error_kind, \
             error_message = EXCLUDED.error_message, \
             traceback = EXCLUDED.traceback, \
             recorded_at = NOW() \
         RETURNING *",
    )
    .bind(task_id)
    .bind(error_kind)
    .bind(error_message)
    .bind(traceback)
    .fetch_one(pool)
    .await?;

    Ok(result)
}

/// Fetch the recorded result for a task, if any.
pub async fn get_result(pool: &PgPool, task_id: Uuid) -> StoreResult<Option<TaskResult>> {
    let result = sqlx::query_as::<_, TaskResult>(
        "SELECT * FROM task_results WHERE task_id = $1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await?;

    Ok(result)
}
