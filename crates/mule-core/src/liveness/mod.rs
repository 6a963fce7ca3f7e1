//! Worker liveness monitor and registry administration.
//!
//! One tick does three sweeps: declare silent workers dead and reassign
//! their running tasks, enforce per-task execution timeouts, and complete
//! pending deregistrations whose drain has finished. Orphan reassignment
//! never consumes retry budget, but it has its own budget so a task that
//! keeps killing workers is eventually parked as poison.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};

use mule_db::models::{ExecutionStatus, TaskStatus};
use mule_db::queries::executions as exec_db;
use mule_db::queries::results as result_db;
use mule_db::queries::tasks as task_db;

use crate::broker::{Broker, QueueEvent};
use crate::config::QueueConfig;
use crate::retry::RetryEngine;
use crate::worker::{WorkerAdminOp, WorkerStatus};

/// Result of an admin operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAck {
    /// The status change took effect.
    Applied,
    /// Deregistration is waiting on in-flight tasks; the worker drains.
    Draining,
    /// The registry entry was removed.
    Removed,
}

/// Errors from admin operations.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("worker {0} is not registered")]
    UnknownWorker(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Heartbeat-driven liveness over the registry and store.
pub struct LivenessMonitor {
    pool: PgPool,
    broker: Arc<dyn Broker>,
    config: QueueConfig,
    retry: RetryEngine,
    /// Workers whose deregistration waits on a drain.
    pending_deregister: Mutex<HashSet<String>>,
}

impl LivenessMonitor {
    pub fn new(pool: PgPool, broker: Arc<dyn Broker>, config: QueueConfig) -> Self {
        let retry = RetryEngine::new(pool.clone(), broker.clone(), config.clone());
        Self {
            pool,
            broker,
            config,
            retry,
            pending_deregister: Mutex::new(HashSet::new()),
        }
    }

    /// One monitor pass.
    pub async fn tick(&self) -> Result<()> {
        self.reap_dead_workers().await?;
        self.enforce_timeouts().await?;
        self.finish_drains().await?;
        Ok(())
    }

    /// Declare workers silent past `dead_after` as dead and reassign
    /// their in-flight tasks.
    async fn reap_dead_workers(&self) -> Result<()> {
        let now = Utc::now();
        let dead_after = chrono::Duration::seconds(self.config.dead_after_secs as i64);

        for entry in self.broker.registry_scan().await? {
            if entry.info.status == WorkerStatus::Dead {
                continue;
            }
            if now - entry.info.last_heartbeat < dead_after && !entry.is_expired(now) {
                continue;
            }

            let worker_id = entry.info.worker_id.clone();
            self.broker
                .registry_set_status(&worker_id, WorkerStatus::Dead)
                .await?;
            self.broker
                .publish_event(QueueEvent::WorkerDied {
                    worker_id: worker_id.clone(),
                    at: now,
                })
                .await?;
            warn!(
                worker_id = %worker_id,
                last_heartbeat = %entry.info.last_heartbeat,
                "worker declared dead"
            );

            let reassigned = self.reassign_worker_tasks(&worker_id).await?;
            if reassigned > 0 {
                info!(worker_id = %worker_id, reassigned, "orphaned tasks reassigned");
            }
        }
        Ok(())
    }

    /// Move every running task of a dead worker back to pending.
    ///
    /// The attempt's execution row is closed as `orphaned` first so a
    /// late report from the (possibly still alive but partitioned)
    /// worker is discardable. Retry count is untouched; the orphan
    /// budget is charged instead.
    pub async fn reassign_worker_tasks(&self, worker_id: &str) -> Result<u32> {
        let tasks = task_db::select_running_for_worker(&self.pool, worker_id).await?;
        let mut reassigned = 0u32;

        for task in tasks {
            let attempt = task.retry_count + 1;
            exec_db::close_execution(
                &self.pool,
                task.id,
                attempt,
                worker_id,
                ExecutionStatus::Orphaned,
                Some("worker declared dead"),
            )
            .await?;

            let rows = task_db::release_orphan(&self.pool, task.id, worker_id).await?;
            if rows == 0 {
                // The task moved on its own (report raced the reaper).
                continue;
            }
            reassigned += 1;

            if task.orphan_reassignments + 1 > self.config.max_orphan_reassignments {
                // The task keeps landing on workers that die under it.
                let Some(current) = task_db::get_task(&self.pool, task.id).await? else {
                    continue;
                };
                self.retry
                    .park(&current, TaskStatus::Pending, "persistent_orphaning")
                    .await?;
                continue;
            }

            self.broker
                .enqueue(task.id, task.priority as u8, attempt)
                .await?;
        }
        Ok(reassigned)
    }

    /// Enforce each running task's `timeout_secs`.
    ///
    /// The worker did not report in time: the attempt is closed as a
    /// timeout and the completion event routes it through the retry
    /// engine. The worker's own later report for this attempt is
    /// discarded by the closed execution row.
    async fn enforce_timeouts(&self) -> Result<()> {
        let now = Utc::now();
        for task in task_db::select_running_past_timeout(&self.pool, now).await? {
            let Some(worker_id) = task.worker_id.clone() else {
                // A running task must hold a worker; this row violates
                // the invariant and cannot be repaired here.
                warn!(task_id = %task.id, "running task with no worker, parking");
                self.retry
                    .park(&task, TaskStatus::Running, "invariant_violation")
                    .await?;
                continue;
            };

            let attempt = task.retry_count + 1;
            let closed = exec_db::close_execution(
                &self.pool,
                task.id,
                attempt,
                &worker_id,
                ExecutionStatus::Timeout,
                Some("execution timed out"),
            )
            .await?;
            if closed == 0 {
                continue;
            }

            let rows =
                task_db::finish_running(&self.pool, task.id, &worker_id, TaskStatus::Timeout)
                    .await?;
            if rows == 0 {
                continue;
            }

            result_db::record_failure(
                &self.pool,
                task.id,
                "timeout",
                "execution timed out",
                None,
            )
            .await?;
            self.broker.registry_adjust_load(&worker_id, -1).await?;
            self.broker
                .publish_event(QueueEvent::TaskFinished {
                    task_id: task.id,
                    status: TaskStatus::Timeout,
                    attempt,
                    worker_id: Some(worker_id.clone()),
                    at: now,
                })
                .await?;

            warn!(
                task_id = %task.id,
                task_name = %task.task_name,
                worker_id = %worker_id,
                timeout_secs = task.timeout_secs,
                "task timed out"
            );
        }
        Ok(())
    }

    /// Complete deregistrations whose worker has drained.
    async fn finish_drains(&self) -> Result<()> {
        let pending: Vec<String> = {
            let set = self.pending_deregister.lock().expect("deregister set poisoned");
            set.iter().cloned().collect()
        };
        for worker_id in pending {
            let in_flight = task_db::select_running_for_worker(&self.pool, &worker_id).await?;
            if in_flight.is_empty() {
                self.broker.registry_remove(&worker_id).await?;
                self.pending_deregister
                    .lock()
                    .expect("deregister set poisoned")
                    .remove(&worker_id);
                info!(worker_id = %worker_id, "worker drained and deregistered");
            }
        }
        Ok(())
    }

    /// Apply an administrative operation to a worker.
    pub async fn admin(&self, worker_id: &str, op: WorkerAdminOp) -> Result<AdminAck, AdminError> {
        let exists = self
            .broker
            .registry_get(worker_id)
            .await
            .map_err(|e| AdminError::Other(e.into()))?
            .is_some();
        if !exists {
            return Err(AdminError::UnknownWorker(worker_id.to_owned()));
        }

        let ack = match op {
            WorkerAdminOp::Pause => {
                self.broker
                    .registry_set_status(worker_id, WorkerStatus::Paused)
                    .await
                    .map_err(|e| AdminError::Other(e.into()))?;
                AdminAck::Applied
            }
            WorkerAdminOp::Resume => {
                self.broker
                    .registry_set_status(worker_id, WorkerStatus::Active)
                    .await
                    .map_err(|e| AdminError::Other(e.into()))?;
                AdminAck::Applied
            }
            WorkerAdminOp::Drain => {
                self.broker
                    .registry_set_status(worker_id, WorkerStatus::Draining)
                    .await
                    .map_err(|e| AdminError::Other(e.into()))?;
                AdminAck::Applied
            }
            WorkerAdminOp::Deregister => {
                let in_flight = task_db::select_running_for_worker(&self.pool, worker_id)
                    .await
                    .map_err(|e| AdminError::Other(e.into()))?;
                if in_flight.is_empty() {
                    self.broker
                        .registry_remove(worker_id)
                        .await
                        .map_err(|e| AdminError::Other(e.into()))?;
                    AdminAck::Removed
                } else {
                    self.broker
                        .registry_set_status(worker_id, WorkerStatus::Draining)
                        .await
                        .map_err(|e| AdminError::Other(e.into()))?;
                    self.pending_deregister
                        .lock()
                        .expect("deregister set poisoned")
                        .insert(worker_id.to_owned());
                    AdminAck::Draining
                }
            }
        };
        info!(worker_id, op = %op, "worker admin operation applied");
        Ok(ack)
    }
}
