//! Query functions for the `dlq_entries` table.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::DlqEntry;

/// Parameters for parking a task in the dead-letter store.
#[derive(Debug, Clone)]
pub struct NewDlqEntry {
    pub task_id: Uuid,
    pub task_name: String,
    /// Full JSON snapshot of the task row at the moment of failure.
    pub snapshot: serde_json::Value,
    pub failure_reason: String,
    pub error_message: Option<String>,
    pub total_attempts: i32,
}

/// Insert a dead-letter entry. Returns the inserted row.
pub async fn insert_entry(pool: &PgPool, new: &NewDlqEntry) -> StoreResult<DlqEntry> {
    let entry = sqlx::query_as::<_, DlqEntry>(
        "INSERT INTO dlq_entries (task_id, task_name, snapshot, failure_reason, \
                                  error_message, total_attempts) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(&new.task_name)
    .bind(&new.snapshot)
    .bind(&new.failure_reason)
    .bind(&new.error_message)
    .bind(new.total_attempts)
    .fetch_one(pool)
    .await?;

    Ok(entry)
}

/// List dead-letter entries, most recently parked first.
pub async fn list_entries(pool: &PgPool, limit: i64, offset: i64) -> StoreResult<Vec<DlqEntry>> {
    let entries = sqlx::query_as::<_, DlqEntry>(
        "SELECT * FROM dlq_entries ORDER BY moved_at DESC LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(entries)
}

/// Fetch the newest dead-letter entry for a task, if one exists.
pub async fn latest_for_task(pool: &PgPool, task_id: Uuid) -> StoreResult<Option<DlqEntry>> {
    let entry = sqlx::query_as::<_, DlqEntry>(
        "SELECT * FROM dlq_entries \
         WHERE task_id = $1 \
         ORDER BY moved_at DESC \
         LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await?;

    Ok(entry)
}

/// Stamp a dead-letter entry as requeued. The lock on `requeued_at IS
/// NULL` makes a double requeue visible to the loser.
pub async fn mark_requeued(pool: &PgPool, entry_id: Uuid) -> StoreResult<u64> {
    let result = sqlx::query(
        "UPDATE dlq_entries SET requeued_at = NOW() \
         WHERE id = $1 AND requeued_at IS NULL",
    )
    .bind(entry_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Total dead-letter entries on record.
pub async fn count_entries(pool: &PgPool) -> StoreResult<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dlq_entries")
        .fetch_one(pool)
        .await?;

    Ok(row.0)
}

/// Delete entries parked before the cutoff. Returns the number removed.
pub async fn purge_older_than(pool: &PgPool, cutoff: DateTime<Utc>) -> StoreResult<u64> {
    let result = sqlx::query("DELETE FROM dlq_entries WHERE moved_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
