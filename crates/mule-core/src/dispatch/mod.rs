//! Dispatcher: the two mirrored worker-facing contracts.
//!
//! `acquire` moves a task from pending to running for a specific worker;
//! `report` records the attempt's outcome. Both coordinate with
//! concurrent loops purely through store CAS and atomic broker calls --
//! a lost claim race means "loop and try the next task", never an error
//! surfaced to the worker.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use mule_db::error::StoreError;
use mule_db::models::{ExecutionStatus, Task, TaskStatus};
use mule_db::queries::executions as exec_db;
use mule_db::queries::results as result_db;
use mule_db::queries::tasks as task_db;

use crate::broker::{ALL_PRIORITIES, Broker, BrokerError, QueueEvent};
use crate::codec::Payload;
use crate::config::QueueConfig;
use crate::worker::WorkerStatus;

/// Outcome of one execution attempt, as reported by a worker.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success {
        result: Payload,
    },
    Failure {
        kind: String,
        message: String,
        traceback: Option<String>,
    },
    Timeout,
}

impl Outcome {
    fn execution_status(&self) -> ExecutionStatus {
        match self {
            Self::Success { .. } => ExecutionStatus::Completed,
            Self::Failure { .. } => ExecutionStatus::Failed,
            Self::Timeout => ExecutionStatus::Timeout,
        }
    }

    fn task_status(&self) -> TaskStatus {
        match self {
            Self::Success { .. } => TaskStatus::Completed,
            Self::Failure { .. } => TaskStatus::Failed,
            Self::Timeout => TaskStatus::Timeout,
        }
    }

    fn error_message(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { message, .. } => Some(message),
            Self::Timeout => Some("execution timed out"),
        }
    }
}

/// Errors from the acquire contract.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("worker {0} is not registered")]
    UnknownWorker(String),

    #[error("worker {worker_id} is not accepting assignments (status {status})")]
    NotAssignable {
        worker_id: String,
        status: WorkerStatus,
    },

    #[error("worker {worker_id} is at capacity ({capacity})")]
    AtCapacity { worker_id: String, capacity: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// What happened to a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportAck {
    /// The outcome was recorded and published.
    Recorded,
    /// The attempt was no longer this worker's to report (orphaned or
    /// reassigned); the report was dropped.
    Discarded,
}

/// Worker-facing dispatch over the store and broker.
pub struct Dispatcher {
    pool: PgPool,
    broker: Arc<dyn Broker>,
    config: QueueConfig,
}

impl Dispatcher {
    pub fn new(pool: PgPool, broker: Arc<dyn Broker>, config: QueueConfig) -> Self {
        Self {
            pool,
            broker,
            config,
        }
    }

    /// Hand the next eligible task to a worker.
    ///
    /// Refuses workers that are unregistered, not assignable, or at
    /// declared capacity. Otherwise blocks up to the configured dequeue
    /// timeout on the priority scan, claims via CAS, and loops on lost
    /// races (a dequeued id whose claim fails was taken or cancelled --
    /// it is simply skipped).
    pub async fn acquire(&self, worker_id: &str) -> Result<Option<Task>, AcquireError> {
        let entry = self
            .broker
            .registry_get(worker_id)
            .await?
            .ok_or_else(|| AcquireError::UnknownWorker(worker_id.to_owned()))?;

        if !entry.info.status.is_assignable() {
            return Err(AcquireError::NotAssignable {
                worker_id: worker_id.to_owned(),
                status: entry.info.status,
            });
        }
        if !entry.info.has_capacity() {
            return Err(AcquireError::AtCapacity {
                worker_id: worker_id.to_owned(),
                capacity: entry.info.capacity,
            });
        }

        let deadline = Instant::now() + self.config.broker_dequeue_timeout();

        loop {
            // Always attempt at least one dequeue, even with the budget
            // spent: a lost claim race must not eat the whole timeout.
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(task_id) = self.broker.dequeue(&ALL_PRIORITIES, remaining).await? else {
                return Ok(None);
            };

            let rows = task_db::claim_task(&self.pool, task_id, worker_id).await?;
            if rows == 0 {
                // Claimed by someone else, or cancelled while queued.
                debug!(task_id = %task_id, worker_id, "claim lost, skipping");
                continue;
            }

            let task = task_db::get_task(&self.pool, task_id)
                .await?
                .ok_or(StoreError::NotFound(task_id))?;

            let attempt = task.retry_count + 1;
            exec_db::open_execution(&self.pool, task_id, attempt, worker_id).await?;
            self.broker.registry_adjust_load(worker_id, 1).await?;

            debug!(
                task_id = %task_id,
                task_name = %task.task_name,
                worker_id,
                attempt,
                "task dispatched"
            );
            return Ok(Some(task));
        }
    }

    /// Record a worker's report for a task it holds.
    ///
    /// The execution row is closed first under a CAS on "still open for
    /// this worker"; a zero-row match means the liveness monitor already
    /// reassigned the attempt, and the report is discarded -- the
    /// replacement attempt's outcome is the one that counts.
    pub async fn report(
        &self,
        worker_id: &str,
        task_id: Uuid,
        outcome: Outcome,
    ) -> Result<ReportAck, AcquireError> {
        let task = task_db::get_task(&self.pool, task_id)
            .await?
            .ok_or(StoreError::NotFound(task_id))?;

        let attempt = task.retry_count + 1;

        let closed = exec_db::close_execution(
            &self.pool,
            task_id,
            attempt,
            worker_id,
            outcome.execution_status(),
            outcome.error_message(),
        )
        .await?;

        // Load bookkeeping happens regardless: the worker is done with
        // the task either way.
        self.broker.registry_adjust_load(worker_id, -1).await?;

        if closed == 0 {
            warn!(
                task_id = %task_id,
                worker_id,
                attempt,
                "late report for a reassigned attempt, discarding"
            );
            return Ok(ReportAck::Discarded);
        }

        match &outcome {
            Outcome::Success { result } => {
                result_db::record_success(&self.pool, task_id, &result.to_value()).await?;
            }
            Outcome::Failure {
                kind,
                message,
                traceback,
            } => {
                result_db::record_failure(
                    &self.pool,
                    task_id,
                    kind,
                    message,
                    traceback.as_deref(),
                )
                .await?;
            }
            Outcome::Timeout => {
                result_db::record_failure(
                    &self.pool,
                    task_id,
                    "timeout",
                    "execution timed out",
                    None,
                )
                .await?;
            }
        }

        let to = outcome.task_status();
        let rows = task_db::finish_running(&self.pool, task_id, worker_id, to).await?;
        if rows == 0 {
            // The task slipped out of running between closing the
            // execution row and this CAS. The store state wins.
            warn!(
                task_id = %task_id,
                worker_id,
                status = %to,
                "task left running state before report landed"
            );
            return Ok(ReportAck::Discarded);
        }

        if task.cancel_requested && to == TaskStatus::Completed {
            debug!(task_id = %task_id, "late cancel ignored, task completed");
        }

        self.broker
            .publish_event(QueueEvent::TaskFinished {
                task_id,
                status: to,
                attempt,
                worker_id: Some(worker_id.to_owned()),
                at: chrono::Utc::now(),
            })
            .await?;

        Ok(ReportAck::Recorded)
    }
}
