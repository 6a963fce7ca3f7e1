//! Dependency resolver: wait-sets, release on completion, cycle handling.
//!
//! Edges live in the store (`task_dependencies`) so the graph survives
//! restart; this module never caches it. Release decisions are driven by
//! completion events and are made under CAS, so two coordinator loops
//! evaluating the same dependent cannot double-release it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mule_db::error::{StoreError, StoreResult};
use mule_db::models::{Task, TaskStatus, WaitMode};
use mule_db::queries::deps as deps_db;
use mule_db::queries::results as result_db;
use mule_db::queries::tasks as task_db;

use crate::broker::{Broker, QueueEvent};
use crate::state::dispatch;

/// Rejection for a dependency set that would close a loop.
#[derive(Debug, thiserror::Error)]
#[error("cyclic dependency involving task {member}")]
pub struct CyclicDependency {
    /// One task on the offending cycle.
    pub member: Uuid,
}

/// Readiness of a task with respect to its wait-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// The wait-set is satisfied (or empty).
    Eligible,
    /// Some predecessor is still in flight.
    Waiting,
    /// The wait-set can never be satisfied: under `all`, a predecessor
    /// ended in a terminal non-completed state; under `any`, every
    /// predecessor did.
    FailedPredecessors,
}

/// Evaluate a task's wait-set against current predecessor statuses.
pub async fn evaluate(pool: &PgPool, task_id: Uuid) -> StoreResult<Eligibility> {
    let statuses = deps_db::predecessor_statuses(pool, task_id).await?;
    if statuses.is_empty() {
        return Ok(Eligibility::Eligible);
    }
    let mode = deps_db::wait_mode_of(pool, task_id)
        .await?
        .unwrap_or(WaitMode::All);

    let total = statuses.len();
    let completed = statuses
        .iter()
        .filter(|(_, s)| *s == TaskStatus::Completed)
        .count();
    let failed_terminal = statuses
        .iter()
        .filter(|(_, s)| s.is_terminal() && *s != TaskStatus::Completed)
        .count();

    let eligibility = match mode {
        WaitMode::All => {
            if failed_terminal > 0 {
                Eligibility::FailedPredecessors
            } else if completed == total {
                Eligibility::Eligible
            } else {
                Eligibility::Waiting
            }
        }
        WaitMode::Any => {
            if completed > 0 {
                Eligibility::Eligible
            } else if failed_terminal == total {
                Eligibility::FailedPredecessors
            } else {
                Eligibility::Waiting
            }
        }
    };
    Ok(eligibility)
}

/// Reject edge sets that would make `successor` transitively depend on
/// itself.
///
/// `new_edges` are `(predecessor, successor)` pairs not yet inserted. The
/// check walks the union of stored and new edges from each new edge's
/// successor looking for a path back to its predecessor.
pub async fn check_acyclic(
    pool: &PgPool,
    new_edges: &[(Uuid, Uuid)],
) -> Result<(), CheckAcyclicError> {
    let stored = deps_db::all_edges(pool).await?;

    // Adjacency over "x is depended on by y": predecessor -> successors.
    let mut adj: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for edge in &stored {
        adj.entry(edge.predecessor).or_default().push(edge.successor);
    }
    for (pred, succ) in new_edges {
        adj.entry(*pred).or_default().push(*succ);
    }

    for (pred, succ) in new_edges {
        // A cycle exists iff the successor already reaches the
        // predecessor through dependency edges.
        if reaches(&adj, *succ, *pred) {
            return Err(CheckAcyclicError::Cycle(CyclicDependency { member: *succ }));
        }
    }
    Ok(())
}

/// Errors from [`check_acyclic`].
#[derive(Debug, thiserror::Error)]
pub enum CheckAcyclicError {
    #[error(transparent)]
    Cycle(#[from] CyclicDependency),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Depth-first reachability: is `target` reachable from `start`?
fn reaches(adj: &HashMap<Uuid, Vec<Uuid>>, start: Uuid, target: Uuid) -> bool {
    if start == target {
        return true;
    }
    let mut seen: HashSet<Uuid> = HashSet::new();
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = adj.get(&node) {
            for &n in next {
                if n == target {
                    return true;
                }
                stack.push(n);
            }
        }
    }
    false
}

/// Completion-driven dependency release.
pub struct DependencyResolver {
    pool: PgPool,
    broker: Arc<dyn Broker>,
}

impl DependencyResolver {
    pub fn new(pool: PgPool, broker: Arc<dyn Broker>) -> Self {
        Self { pool, broker }
    }

    /// React to a task reaching a terminal state: re-evaluate every
    /// dependent and release or cancel it.
    pub async fn on_terminal(&self, task_id: Uuid) -> Result<()> {
        let dependents = deps_db::dependents_of(&self.pool, task_id)
            .await
            .context("failed to read reverse dependency index")?;

        for dependent_id in dependents {
            self.reevaluate(dependent_id).await?;
        }
        Ok(())
    }

    /// Re-evaluate one gated task against its wait-set and release or
    /// cancel it. Also used right after edge insertion to close the race
    /// against predecessors terminating mid-submit.
    pub async fn reevaluate(&self, dependent_id: Uuid) -> Result<()> {
        let Some(dependent) = task_db::get_task(&self.pool, dependent_id).await? else {
            return Ok(());
        };
        // Only dependency-gated (scheduled) tasks react; anything else
        // already left the gate or is terminal.
        if dependent.status != TaskStatus::Scheduled {
            return Ok(());
        }

        match evaluate(&self.pool, dependent_id).await? {
            Eligibility::Waiting => {}
            Eligibility::Eligible => {
                self.release(&dependent).await?;
            }
            Eligibility::FailedPredecessors => {
                self.cancel_with_reason(&dependent, "predecessor_failed")
                    .await?;
            }
        }
        Ok(())
    }

    /// Release an eligible dependent.
    ///
    /// A dependent that also carries a future readiness deadline stays
    /// scheduled; the scheduler promotes it when due (and re-checks the
    /// wait-set then).
    async fn release(&self, task: &Task) -> Result<()> {
        if let Some(ready_at) = task.ready_at {
            if ready_at > chrono::Utc::now() {
                debug!(task_id = %task.id, %ready_at, "dependencies satisfied, awaiting schedule");
                return Ok(());
            }
        }

        match dispatch::promote_task(&self.pool, task.id).await {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => {
                // Another loop won the promotion.
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        self.broker.unschedule(task.id).await?;
        self.broker
            .enqueue(task.id, task.priority as u8, task.retry_count + 1)
            .await?;
        info!(task_id = %task.id, task_name = %task.task_name, "dependency released");
        Ok(())
    }

    /// Cancel a gated task with a recorded reason and publish the
    /// terminal event so its own dependents cascade.
    pub async fn cancel_with_reason(&self, task: &Task, reason: &str) -> Result<()> {
        match dispatch::cancel_task(&self.pool, task.id, task.status).await {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        result_db::record_failure(&self.pool, task.id, reason, reason, None).await?;
        self.broker.unschedule(task.id).await?;
        self.broker
            .publish_event(QueueEvent::TaskFinished {
                task_id: task.id,
                status: TaskStatus::Cancelled,
                attempt: task.retry_count,
                worker_id: None,
                at: chrono::Utc::now(),
            })
            .await?;
        warn!(task_id = %task.id, task_name = %task.task_name, reason, "task cancelled");
        Ok(())
    }

    /// Find dependency cycles among live tasks and cancel every member.
    ///
    /// Insertion-time checks normally prevent cycles; this is the
    /// recovery path for edges half-written by a crashed submitter. Run
    /// at coordinator startup.
    pub async fn cancel_runtime_cycles(&self) -> Result<Vec<Uuid>> {
        let edges = deps_db::all_edges(&self.pool).await?;
        let mut adj: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for edge in &edges {
            adj.entry(edge.predecessor).or_default().push(edge.successor);
        }

        let members = cycle_members(&adj);
        let mut cancelled = Vec::new();
        for member in members {
            let Some(task) = task_db::get_task(&self.pool, member).await? else {
                continue;
            };
            if task.status.is_terminal() || task.status == TaskStatus::Running {
                continue;
            }
            self.cancel_with_reason(&task, "cycle_detected").await?;
            cancelled.push(member);
        }
        if !cancelled.is_empty() {
            warn!(count = cancelled.len(), "cancelled members of dependency cycles");
        }
        Ok(cancelled)
    }
}

/// Nodes that sit on at least one directed cycle.
fn cycle_members(adj: &HashMap<Uuid, Vec<Uuid>>) -> Vec<Uuid> {
    let mut members: HashSet<Uuid> = HashSet::new();
    for &start in adj.keys() {
        // A node is on a cycle iff it can reach itself.
        if reaches_via_successor(adj, start) {
            members.insert(start);
        }
    }
    members.into_iter().collect()
}

/// Whether `start` can reach itself through at least one edge.
fn reaches_via_successor(adj: &HashMap<Uuid, Vec<Uuid>>, start: Uuid) -> bool {
    let mut seen: HashSet<Uuid> = HashSet::new();
    let mut stack: Vec<Uuid> = adj.get(&start).cloned().unwrap_or_default();
    while let Some(node) = stack.pop() {
        if node == start {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = adj.get(&node) {
            stack.extend(next.iter().copied());
        }
    }
    false
}
