//! Scheduler: promotes due tasks and expands cron recurrences.
//!
//! The store is the authority for what is due (`select_due_scheduled`);
//! the broker's scheduled set is a hint that survives only as long as the
//! process. A promotion is a CAS, so two schedulers running concurrently
//! cannot double-promote.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use mule_db::error::StoreError;
use mule_db::models::{Task, TaskStatus};
use mule_db::queries::tasks as task_db;

use crate::broker::Broker;
use crate::resolver::{self, DependencyResolver, Eligibility};
use crate::state::dispatch;

/// How many due tasks one tick will consider.
const PROMOTION_BATCH: i64 = 256;

/// Error from parsing a cron expression.
#[derive(Debug, thiserror::Error)]
#[error("invalid cron expression {expr:?}: {reason}")]
pub struct CronParseError {
    pub expr: String,
    pub reason: String,
}

/// Parse a cron expression, accepting both the five-field crontab form
/// and the six/seven-field form with seconds.
pub fn parse_cron(expr: &str) -> Result<Schedule, CronParseError> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        // Classic crontab: prepend a seconds field.
        format!("0 {expr}")
    } else {
        expr.to_owned()
    };
    Schedule::from_str(&normalized).map_err(|e| CronParseError {
        expr: expr.to_owned(),
        reason: e.to_string(),
    })
}

/// The next fire time strictly after `after`, if the schedule has one.
pub fn next_fire(expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, CronParseError> {
    let schedule = parse_cron(expr)?;
    Ok(schedule.after(&after).next())
}

/// Tick-driven promotion of due scheduled tasks, plus cron re-expansion.
pub struct Scheduler {
    pool: PgPool,
    broker: Arc<dyn Broker>,
    resolver: DependencyResolver,
}

impl Scheduler {
    pub fn new(pool: PgPool, broker: Arc<dyn Broker>) -> Self {
        let resolver = DependencyResolver::new(pool.clone(), broker.clone());
        Self {
            pool,
            broker,
            resolver,
        }
    }

    /// One scheduler pass: sync pending tasks into the broker, then
    /// promote every due task whose wait-set is satisfied. Returns how
    /// many were promoted.
    pub async fn tick(&self) -> Result<u32> {
        self.sync_pending().await?;
        let now = Utc::now();
        let due = task_db::select_due_scheduled(&self.pool, now, PROMOTION_BATCH)
            .await
            .context("failed to select due scheduled tasks")?;

        let mut promoted = 0u32;
        for task in due {
            match resolver::evaluate(&self.pool, task.id).await? {
                Eligibility::Waiting => {
                    // Due but still gated; re-checked next tick.
                    debug!(task_id = %task.id, "due task still waiting on dependencies");
                }
                Eligibility::FailedPredecessors => {
                    self.resolver
                        .cancel_with_reason(&task, "predecessor_failed")
                        .await?;
                }
                Eligibility::Eligible => {
                    match dispatch::promote_task(&self.pool, task.id).await {
                        Ok(()) => {}
                        Err(StoreError::Conflict { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                    self.broker.unschedule(task.id).await?;
                    self.broker
                        .enqueue(task.id, task.priority as u8, task.retry_count + 1)
                        .await?;
                    promoted += 1;
                    debug!(
                        task_id = %task.id,
                        task_name = %task.task_name,
                        priority = task.priority,
                        "scheduled task promoted"
                    );
                }
            }
        }
        Ok(promoted)
    }

    /// Make broker queue membership converge on the store's pending set.
    ///
    /// Enqueue is idempotent per `(task_id, attempt)`, so re-offering
    /// every pending task is safe; this is what lets submissions from
    /// other processes (and tasks lost to a broker restart between
    /// ticks) reach the queues.
    async fn sync_pending(&self) -> Result<()> {
        let pending = task_db::list_pending_in_order(&self.pool)
            .await
            .context("failed to list pending tasks")?;
        for task in pending {
            self.broker
                .enqueue(task.id, task.priority as u8, task.retry_count + 1)
                .await?;
        }
        Ok(())
    }

    /// Expand a terminated cron task into its next occurrence.
    ///
    /// The new task is a fresh row (new id, zeroed retry counter, same
    /// handler and payload) scheduled strictly after now; the terminated
    /// row is kept for history and linked via `parent_task_id`.
    pub async fn reschedule_cron(&self, task: &Task) -> Result<Option<Uuid>> {
        let Some(expr) = task.cron_expression.as_deref() else {
            return Ok(None);
        };
        let now = Utc::now();
        let next = match next_fire(expr, now) {
            Ok(Some(next)) => next,
            Ok(None) => {
                info!(task_id = %task.id, expr, "cron schedule has no future fire time");
                return Ok(None);
            }
            Err(e) => {
                // The expression was validated at submit; a parse failure
                // here means the stored value was tampered with. Log and
                // stop recurring rather than loop.
                tracing::error!(task_id = %task.id, error = %e, "stored cron expression unparseable");
                return Ok(None);
            }
        };

        let new = task_db::NewTask {
            task_name: task.task_name.clone(),
            args: task.args.clone(),
            kwargs: task.kwargs.clone(),
            priority: task.priority,
            status: TaskStatus::Scheduled,
            max_retries: task.max_retries,
            retry_base_delay_secs: task.retry_base_delay_secs,
            timeout_secs: task.timeout_secs,
            scheduled_at: Some(next),
            ready_at: Some(next),
            cron_expression: Some(expr.to_owned()),
            parent_task_id: Some(task.id),
            created_by: task.created_by.clone(),
        };
        let inserted = task_db::insert_task(&self.pool, &new).await?;
        self.broker.schedule(inserted.id, next).await?;

        info!(
            task_id = %inserted.id,
            parent = %task.id,
            task_name = %task.task_name,
            fire_at = %next,
            "cron occurrence scheduled"
        );
        Ok(Some(inserted.id))
    }
}
