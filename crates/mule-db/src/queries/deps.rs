//! Query functions for the `task_dependencies` edge table.
//!
//! An edge `(predecessor, successor, mode)` means `successor` waits on
//! `predecessor`; `mode` is uniform across a successor's incoming edges.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{TaskDependency, TaskStatus, WaitMode};

/// Insert a dependency edge. Idempotent via `ON CONFLICT DO NOTHING`.
pub async fn insert_edge(
    pool: &PgPool,
    predecessor: Uuid,
    successor: Uuid,
    mode: WaitMode,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO task_dependencies (predecessor, successor, mode) \
         VALUES ($1, $2, $3) \
         ON CONFLICT DO NOTHING",
    )
    .bind(predecessor)
    .bind(successor)
    .bind(mode)
    .execute(pool)
    .await?;

    Ok(())
}

/// All incoming edges of a task (its wait-set).
pub async fn predecessors_of(pool: &PgPool, successor: Uuid) -> StoreResult<Vec<TaskDependency>> {
    let edges = sqlx::query_as::<_, TaskDependency>(
        "SELECT * FROM task_dependencies WHERE successor = $1",
    )
    .bind(successor)
    .fetch_all(pool)
    .await?;

    Ok(edges)
}

/// Reverse index: ids of tasks waiting on the given predecessor.
pub async fn dependents_of(pool: &PgPool, predecessor: Uuid) -> StoreResult<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT successor FROM task_dependencies WHERE predecessor = $1")
            .bind(predecessor)
            .fetch_all(pool)
            .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// The wait mode of a task's incoming edges, if it has any.
pub async fn wait_mode_of(pool: &PgPool, successor: Uuid) -> StoreResult<Option<WaitMode>> {
    let row: Option<(WaitMode,)> = sqlx::query_as(
        "SELECT mode FROM task_dependencies WHERE successor = $1 LIMIT 1",
    )
    .bind(successor)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(mode,)| mode))
}

/// Statuses of every predecessor of a task.
pub async fn predecessor_statuses(
    pool: &PgPool,
    successor: Uuid,
) -> StoreResult<Vec<(Uuid, TaskStatus)>> {
    let rows: Vec<(Uuid, TaskStatus)> = sqlx::query_as(
        "SELECT t.id, t.status \
         FROM task_dependencies td \
         JOIN tasks t ON t.id = td.predecessor \
         WHERE td.successor = $1",
    )
    .bind(successor)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Every edge in the graph, for reachability checks.
pub async fn all_edges(pool: &PgPool) -> StoreResult<Vec<TaskDependency>> {
    let edges = sqlx::query_as::<_, TaskDependency>("SELECT * FROM task_dependencies")
        .fetch_all(pool)
        .await?;

    Ok(edges)
}
