//! Retry engine and dead-letter routing.
//!
//! A failed or timed-out attempt either reschedules with exponential
//! backoff or, once the budget is spent, parks the task in the
//! dead-letter store. Poison tasks never auto-re-run; the only way out of
//! the DLQ is an explicit requeue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use mule_db::error::StoreError;
use mule_db::models::{DlqEntry, Task, TaskStatus};
use mule_db::queries::dlq as dlq_db;
use mule_db::queries::results as result_db;
use mule_db::queries::tasks as task_db;

use crate::broker::{Broker, QueueEvent};
use crate::config::QueueConfig;
use crate::state::dispatch;

/// What the engine decided for a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Retry scheduled for `ready_at`.
    Scheduled { ready_at: DateTime<Utc> },
    /// Budget exhausted; parked in the DLQ.
    Parked,
    /// The task's state had already moved on; nothing to do.
    Stale,
}

/// Backoff for the `n`-th retry (1-based): `min(base * 2^(n-1), cap)`
/// plus additive jitter in `[0, 0.25 * delay]`, never exceeding the cap.
pub fn compute_delay(retry_number: u32, base_secs: i32, cap_secs: i32) -> Duration {
    let base = base_secs.max(0) as f64;
    let cap = cap_secs.max(0) as f64;
    let exp = (retry_number.saturating_sub(1)).min(62);
    let raw = (base * 2f64.powi(exp as i32)).min(cap);
    let jitter = rand::rng().random_range(0.0..=0.25);
    let delayed = (raw * (1.0 + jitter)).min(cap);
    Duration::from_secs_f64(delayed)
}

/// Failure routing over the store, broker, and dead-letter tables.
pub struct RetryEngine {
    pool: PgPool,
    broker: Arc<dyn Broker>,
    config: QueueConfig,
}

impl RetryEngine {
    pub fn new(pool: PgPool, broker: Arc<dyn Broker>, config: QueueConfig) -> Self {
        Self {
            pool,
            broker,
            config,
        }
    }

    /// Route a failure or timeout: backoff-reschedule or park.
    ///
    /// `from` is the status the completion event reported (`failed` or
    /// `timeout`). A task whose stored status no longer matches is stale
    /// (e.g. the event was redelivered) and is left alone.
    pub async fn handle_failure(&self, task_id: Uuid, from: TaskStatus) -> Result<Disposition> {
        let Some(task) = task_db::get_task(&self.pool, task_id).await? else {
            warn!(task_id = %task_id, "failure event for unknown task");
            return Ok(Disposition::Stale);
        };
        if task.status != from {
            return Ok(Disposition::Stale);
        }

        let next_retry = task.retry_count + 1;
        if next_retry > task.max_retries {
            self.park(&task, from, "retries_exhausted").await?;
            return Ok(Disposition::Parked);
        }

        let delay = compute_delay(
            next_retry as u32,
            task.retry_base_delay_secs,
            self.config.retry_cap_secs,
        );
        let ready_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));

        let rows =
            task_db::retry_to_scheduled(&self.pool, task.id, from, task.retry_count, ready_at)
                .await?;
        if rows == 0 {
            return Ok(Disposition::Stale);
        }
        self.broker.schedule(task.id, ready_at).await?;

        info!(
            task_id = %task.id,
            task_name = %task.task_name,
            retry = next_retry,
            max_retries = task.max_retries,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
        Ok(Disposition::Scheduled { ready_at })
    }

    /// Park a task in the dead-letter store: CAS to `dead`, snapshot the
    /// row, publish the terminal event.
    pub async fn park(&self, task: &Task, from: TaskStatus, reason: &str) -> Result<()> {
        match dispatch::park_dead(&self.pool, task.id, from).await {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let last_error = result_db::get_result(&self.pool, task.id)
            .await?
            .and_then(|r| r.error_message);

        let snapshot = serde_json::to_value(task).context("failed to snapshot task for DLQ")?;
        let total_attempts = task.retry_count + 1;
        dlq_db::insert_entry(
            &self.pool,
            &dlq_db::NewDlqEntry {
                task_id: task.id,
                task_name: task.task_name.clone(),
                snapshot,
                failure_reason: reason.to_owned(),
                error_message: last_error,
                total_attempts,
            },
        )
        .await?;

        self.broker
            .publish_event(QueueEvent::TaskFinished {
                task_id: task.id,
                status: TaskStatus::Dead,
                attempt: total_attempts,
                worker_id: None,
                at: Utc::now(),
            })
            .await?;

        warn!(
            task_id = %task.id,
            task_name = %task.task_name,
            reason,
            total_attempts,
            "task parked in dead-letter store"
        );
        Ok(())
    }

    /// Requeue a dead-lettered task: reset its budgets, return it to
    /// pending, and enqueue at its original priority.
    pub async fn requeue(&self, task_id: Uuid) -> Result<()> {
        let entry = dlq_db::latest_for_task(&self.pool, task_id)
            .await?
            .ok_or(StoreError::NotFound(task_id))?;

        dispatch::requeue_dead(&self.pool, task_id).await?;
        dlq_db::mark_requeued(&self.pool, entry.id).await?;

        let task = task_db::get_task(&self.pool, task_id)
            .await?
            .ok_or(StoreError::NotFound(task_id))?;
        self.broker
            .enqueue(task.id, task.priority as u8, task.retry_count + 1)
            .await?;

        info!(task_id = %task_id, task_name = %task.task_name, "dead-letter entry requeued");
        Ok(())
    }

    /// List dead-letter entries.
    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<DlqEntry>> {
        Ok(dlq_db::list_entries(&self.pool, limit, offset).await?)
    }

    /// Inspect the newest dead-letter entry for a task.
    pub async fn inspect(&self, task_id: Uuid) -> Result<Option<DlqEntry>> {
        Ok(dlq_db::latest_for_task(&self.pool, task_id).await?)
    }

    /// Remove entries parked before the cutoff.
    pub async fn purge(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let removed = dlq_db::purge_older_than(&self.pool, older_than).await?;
        if removed > 0 {
            info!(removed, "purged expired dead-letter entries");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_retry() {
        // With jitter in [0, 0.25], delay(n) must stay within
        // [base * 2^(n-1), 1.25 * base * 2^(n-1)].
        for n in 1..=8u32 {
            let base = 1;
            let expected = 2f64.powi((n - 1) as i32);
            let delay = compute_delay(n, base, 100_000).as_secs_f64();
            assert!(
                delay >= expected && delay <= expected * 1.25,
                "retry {n}: delay {delay} outside [{expected}, {}]",
                expected * 1.25
            );
        }
    }

    #[test]
    fn delay_never_exceeds_cap() {
        for n in 1..=40u32 {
            let delay = compute_delay(n, 10, 300);
            assert!(
                delay <= Duration::from_secs(300),
                "retry {n}: delay {delay:?} over cap"
            );
        }
    }

    #[test]
    fn huge_retry_numbers_do_not_overflow() {
        let delay = compute_delay(u32::MAX, 1000, 600);
        assert!(delay <= Duration::from_secs(600));
    }

    #[test]
    fn zero_base_gives_zero_delay() {
        assert_eq!(compute_delay(1, 0, 300), Duration::from_secs(0));
    }
}
