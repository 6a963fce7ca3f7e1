//! Convenience transition helpers that wrap [`super::TaskStateMachine`]
//! and the specialized store queries with semantic names.

use sqlx::PgPool;
use uuid::Uuid;

use mule_db::error::{StoreError, StoreResult};
use mule_db::models::TaskStatus;
use mule_db::queries::tasks as db;

use super::TaskStateMachine;

/// Promote a due scheduled task: `scheduled -> pending`.
///
/// Clears the readiness deadline. Returns `Conflict` when another
/// scheduler instance already promoted (or the task was cancelled).
pub async fn promote_task(pool: &PgPool, task_id: Uuid) -> StoreResult<()> {
    let rows = db::promote_scheduled(pool, task_id).await?;
    if rows == 0 {
        return match db::get_task(pool, task_id).await? {
            None => Err(StoreError::NotFound(task_id)),
            Some(_) => Err(StoreError::conflict(task_id, TaskStatus::Scheduled.to_string())),
        };
    }
    Ok(())
}

/// Cancel a task that has not started: `pending|scheduled -> cancelled`.
///
/// Sets `completed_at` via the generic transition.
pub async fn cancel_task(pool: &PgPool, task_id: Uuid, from: TaskStatus) -> StoreResult<()> {
    TaskStateMachine::transition(pool, task_id, from, TaskStatus::Cancelled).await
}

/// Park a task permanently: `from -> dead`.
///
/// Sets `completed_at`. The caller is responsible for writing the
/// dead-letter snapshot.
pub async fn park_dead(pool: &PgPool, task_id: Uuid, from: TaskStatus) -> StoreResult<()> {
    if !TaskStateMachine::is_valid_transition(from, TaskStatus::Dead) {
        return Err(StoreError::conflict(task_id, "a dead-eligible state"));
    }
    let rows = db::mark_dead(pool, task_id, from).await?;
    if rows == 0 {
        return match db::get_task(pool, task_id).await? {
            None => Err(StoreError::NotFound(task_id)),
            Some(_) => Err(StoreError::conflict(task_id, from.to_string())),
        };
    }
    Ok(())
}

/// Requeue a dead-lettered task: `dead -> pending` with a reset retry and
/// orphan budget.
pub async fn requeue_dead(pool: &PgPool, task_id: Uuid) -> StoreResult<()> {
    let rows = db::requeue_dead(pool, task_id).await?;
    if rows == 0 {
        return match db::get_task(pool, task_id).await? {
            None => Err(StoreError::NotFound(task_id)),
            Some(_) => Err(StoreError::conflict(task_id, TaskStatus::Dead.to_string())),
        };
    }
    Ok(())
}
