//! Task state machine transitions.
//!
//! Validates and executes state transitions for tasks, enforcing the
//! allowed transition graph, compare-and-swap updates, and timestamp
//! management. Specialized transitions (claiming, finishing an attempt,
//! retry parking, orphan release) live in `mule_db::queries::tasks`; this
//! module covers the generic edges and is the single statement of which
//! edges exist at all.

pub mod dispatch;

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use mule_db::error::{StoreError, StoreResult};
use mule_db::models::TaskStatus;
use mule_db::queries::tasks as db;

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// scheduled -> pending    (promotion: due, dependencies satisfied)
/// scheduled -> cancelled  (explicit cancel, failed predecessor, cycle)
/// pending   -> running    (worker claims)
/// pending   -> cancelled  (explicit cancel)
/// pending   -> dead       (orphan budget exhausted)
/// running   -> completed  (success)
/// running   -> failed     (handler error)
/// running   -> timeout    (timeout tripped)
/// running   -> pending    (reassignment from a dead worker)
/// running   -> dead       (invariant violation, non-correctable)
/// failed    -> scheduled  (retry parked for backoff)
/// failed    -> pending    (immediate retry)
/// failed    -> dead       (retries exhausted)
/// timeout   -> scheduled  (retry parked for backoff)
/// timeout   -> pending    (immediate retry)
/// timeout   -> dead       (retries exhausted)
/// dead      -> pending    (dead-letter requeue)
/// ```
///
/// `completed` and `cancelled` have no outgoing edges; `dead` is terminal
/// except for the operator's dead-letter requeue.
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge
    /// in the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Scheduled, Pending)
                | (Scheduled, Cancelled)
                | (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Dead)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Timeout)
                | (Running, Pending)
                | (Running, Dead)
                | (Failed, Scheduled)
                | (Failed, Pending)
                | (Failed, Dead)
                | (Timeout, Scheduled)
                | (Timeout, Pending)
                | (Timeout, Dead)
                | (Dead, Pending)
        )
    }

    /// Execute a generic state transition with a compare-and-swap on the
    /// current status.
    ///
    /// - Validates the transition is legal.
    /// - Sets `completed_at` when transitioning into a terminal state.
    ///
    /// Returns `StoreError::Conflict` if the current status in the
    /// database does not match `from`, and `StoreError::NotFound` if the
    /// task does not exist.
    pub async fn transition(
        pool: &PgPool,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> StoreResult<()> {
        if !Self::is_valid_transition(from, to) {
            // A programming error, not a data race: surface it as a
            // conflict naming the edge so callers log it loudly.
            return Err(StoreError::conflict(
                task_id,
                format!("valid source for {to} (got {from})"),
            ));
        }

        let completed_at = if to.is_terminal() { Some(Utc::now()) } else { None };

        let rows =
            db::transition_task_status(pool, task_id, from, to, None, completed_at).await?;

        if rows == 0 {
            // Either the task does not exist or the status moved under us.
            match db::get_task(pool, task_id).await? {
                None => return Err(StoreError::NotFound(task_id)),
                Some(_) => return Err(StoreError::conflict(task_id, from.to_string())),
            }
        }

        Ok(())
    }
}
