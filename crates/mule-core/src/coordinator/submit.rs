//! Submission and control surface: validate, insert, enqueue; cancel and
//! replay.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use mule_db::error::StoreError;
use mule_db::models::{Task, TaskStatus, WaitMode};
use mule_db::queries::deps as deps_db;
use mule_db::queries::executions as exec_db;
use mule_db::queries::results as result_db;
use mule_db::queries::tasks as task_db;

use crate::broker::BrokerError;
use crate::codec::Payload;
use crate::config::{PRIORITY_MAX, PRIORITY_MIN};
use crate::resolver::{self, CheckAcyclicError, CyclicDependency, Eligibility};
use crate::scheduler::{CronParseError, parse_cron};

use super::Coordinator;

/// A submission. Unset tunables inherit the coordinator's configured
/// defaults.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub args: Payload,
    pub kwargs: Payload,
    pub priority: i32,
    pub max_retries: Option<i32>,
    pub retry_base_delay_secs: Option<i32>,
    pub timeout_secs: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    pub depends_on: Vec<Uuid>,
    pub wait_mode: WaitMode,
    pub created_by: Option<String>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Payload::empty(),
            kwargs: Payload::empty(),
            priority: 5,
            max_retries: None,
            retry_base_delay_secs: None,
            timeout_secs: None,
            scheduled_at: None,
            cron_expression: None,
            depends_on: Vec::new(),
            wait_mode: WaitMode::All,
            created_by: None,
        }
    }
}

/// Validation and infrastructure failures at submission. Validation
/// errors name the offending field; nothing is persisted for them.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("task name must not be empty")]
    EmptyName,

    #[error("priority {0} out of range {PRIORITY_MIN}..={PRIORITY_MAX}")]
    InvalidPriority(i32),

    #[error("max_retries {0} must be >= 0")]
    InvalidRetries(i32),

    #[error("retry_base_delay_secs {0} must be >= 0")]
    InvalidRetryDelay(i32),

    #[error("timeout_secs {0} must be > 0")]
    InvalidTimeout(i32),

    #[error(transparent)]
    InvalidCron(#[from] CronParseError),

    #[error("unknown dependency {0}")]
    UnknownDependency(Uuid),

    #[error(transparent)]
    CyclicDependency(#[from] CyclicDependency),

    #[error("submission rate limit exceeded for task name {0:?}")]
    RateLimited(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// What a cancel call achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was cancelled before it started.
    Cancelled,
    /// The task is running; the request was recorded and the worker's
    /// eventual report will be honored.
    Requested,
}

/// Failures of the control surface (cancel, replay, lookups).
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("task {0} not found")]
    NotFound(Uuid),

    #[error("task is {0}, operation does not apply")]
    InvalidState(TaskStatus),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A task with its most recent execution and recorded result.
#[derive(Debug, Clone)]
pub struct TaskDetail {
    pub task: Task,
    pub latest_execution: Option<mule_db::models::TaskExecution>,
    pub result: Option<mule_db::models::TaskResult>,
}

impl Coordinator {
    /// Validate and submit a task. Returns the new task id.
    pub async fn submit(&self, spec: TaskSpec) -> Result<Uuid, SubmitError> {
        if spec.name.trim().is_empty() {
            return Err(SubmitError::EmptyName);
        }
        if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&spec.priority) {
            return Err(SubmitError::InvalidPriority(spec.priority));
        }
        let max_retries = spec.max_retries.unwrap_or(self.config.max_retries);
        if max_retries < 0 {
            return Err(SubmitError::InvalidRetries(max_retries));
        }
        let retry_base_delay_secs = spec
            .retry_base_delay_secs
            .unwrap_or(self.config.retry_base_delay_secs);
        if retry_base_delay_secs < 0 {
            return Err(SubmitError::InvalidRetryDelay(retry_base_delay_secs));
        }
        let timeout_secs = spec.timeout_secs.unwrap_or(self.config.default_timeout_secs);
        if timeout_secs <= 0 {
            return Err(SubmitError::InvalidTimeout(timeout_secs));
        }
        if let Some(expr) = spec.cron_expression.as_deref() {
            parse_cron(expr)?;
        }

        if let Some(&per_minute) = self.config.rate_limits.get(&spec.name) {
            let key = format!("submit:{}", spec.name);
            let allowed = self
                .broker
                .check_rate(&key, per_minute, Duration::from_secs(60))
                .await?;
            if !allowed {
                return Err(SubmitError::RateLimited(spec.name));
            }
        }

        // Dependencies must exist; collect their statuses for the
        // initial eligibility call.
        let mut dep_ids = spec.depends_on.clone();
        dep_ids.sort();
        dep_ids.dedup();
        let mut preds = Vec::with_capacity(dep_ids.len());
        for dep_id in &dep_ids {
            let dep = task_db::get_task(&self.pool, *dep_id)
                .await?
                .ok_or(SubmitError::UnknownDependency(*dep_id))?;
            preds.push(dep);
        }

        let now = Utc::now();
        let time_gated = spec.scheduled_at.is_some_and(|at| at > now);
        let eligibility = initial_eligibility(&preds, spec.wait_mode);
        let dep_gated = !preds.is_empty() && eligibility == Eligibility::Waiting;

        let status = if time_gated || dep_gated || eligibility == Eligibility::FailedPredecessors {
            TaskStatus::Scheduled
        } else {
            TaskStatus::Pending
        };
        let ready_at = if time_gated { spec.scheduled_at } else { None };

        let task = task_db::insert_task(
            &self.pool,
            &task_db::NewTask {
                task_name: spec.name.clone(),
                args: spec.args.to_value(),
                kwargs: spec.kwargs.to_value(),
                priority: spec.priority,
                status,
                max_retries,
                retry_base_delay_secs,
                timeout_secs,
                scheduled_at: spec.scheduled_at,
                ready_at,
                cron_expression: spec.cron_expression.clone(),
                parent_task_id: None,
                created_by: spec.created_by.clone(),
            },
        )
        .await?;

        if !dep_ids.is_empty() {
            let new_edges: Vec<(Uuid, Uuid)> =
                dep_ids.iter().map(|&pred| (pred, task.id)).collect();
            match resolver::check_acyclic(&self.pool, &new_edges).await {
                Ok(()) => {}
                Err(CheckAcyclicError::Cycle(cycle)) => {
                    // The task row exists but no edges do; cancel it so
                    // nothing dangles.
                    self.resolver
                        .cancel_with_reason(&task, "cyclic_dependency")
                        .await
                        .ok();
                    return Err(cycle.into());
                }
                Err(CheckAcyclicError::Store(e)) => return Err(e.into()),
            }
            for &pred in &dep_ids {
                deps_db::insert_edge(&self.pool, pred, task.id, spec.wait_mode).await?;
            }
            // A predecessor may have terminated between the status read
            // and the edge insert; one re-evaluation closes that window.
            if status == TaskStatus::Scheduled {
                if let Err(e) = self.resolver.reevaluate(task.id).await {
                    tracing::warn!(task_id = %task.id, error = %e, "post-insert re-evaluation failed");
                }
            }
        }

        match status {
            TaskStatus::Pending => {
                self.broker
                    .enqueue(task.id, task.priority as u8, task.retry_count + 1)
                    .await?;
            }
            TaskStatus::Scheduled => {
                if eligibility == Eligibility::FailedPredecessors {
                    // A predecessor already failed permanently; the task
                    // is recorded and immediately cancelled, never
                    // enqueued.
                    self.resolver
                        .cancel_with_reason(&task, "predecessor_failed")
                        .await
                        .ok();
                } else if let Some(at) = ready_at {
                    self.broker.schedule(task.id, at).await?;
                }
            }
            _ => {}
        }

        info!(
            task_id = %task.id,
            task_name = %task.task_name,
            priority = task.priority,
            status = %status,
            "task submitted"
        );
        Ok(task.id)
    }

    /// Cancel a task.
    ///
    /// Pending and scheduled tasks cancel via CAS; a running task only
    /// records the request. Terminal tasks reject the call.
    pub async fn cancel(&self, task_id: Uuid) -> Result<CancelOutcome, ControlError> {
        let task = task_db::get_task(&self.pool, task_id)
            .await?
            .ok_or(ControlError::NotFound(task_id))?;

        match task.status {
            TaskStatus::Pending | TaskStatus::Scheduled => {
                self.resolver
                    .cancel_with_reason(&task, "cancelled")
                    .await
                    .map_err(ControlError::Other)?;
                Ok(CancelOutcome::Cancelled)
            }
            TaskStatus::Running => {
                task_db::request_cancel(&self.pool, task_id).await?;
                debug!(task_id = %task_id, "cancellation requested for running task");
                Ok(CancelOutcome::Requested)
            }
            status => Err(ControlError::InvalidState(status)),
        }
    }

    /// Re-submit a terminal task as a fresh one (new id, zeroed
    /// counters, same payload), linked through `parent_task_id`.
    pub async fn replay(&self, task_id: Uuid) -> Result<Uuid, ControlError> {
        let task = task_db::get_task(&self.pool, task_id)
            .await?
            .ok_or(ControlError::NotFound(task_id))?;
        if !task.status.is_terminal() {
            return Err(ControlError::InvalidState(task.status));
        }

        let new = task_db::insert_task(
            &self.pool,
            &task_db::NewTask {
                task_name: task.task_name.clone(),
                args: task.args.clone(),
                kwargs: task.kwargs.clone(),
                priority: task.priority,
                status: TaskStatus::Pending,
                max_retries: task.max_retries,
                retry_base_delay_secs: task.retry_base_delay_secs,
                timeout_secs: task.timeout_secs,
                scheduled_at: None,
                ready_at: None,
                cron_expression: None,
                parent_task_id: Some(task.id),
                created_by: task.created_by.clone(),
            },
        )
        .await?;
        self.broker
            .enqueue(new.id, new.priority as u8, new.retry_count + 1)
            .await?;

        info!(task_id = %new.id, replay_of = %task.id, "task replayed");
        Ok(new.id)
    }

    /// Fetch a task.
    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        task_db::get_task(&self.pool, task_id).await
    }

    /// Fetch a task with its latest execution and recorded result.
    pub async fn task_detail(&self, task_id: Uuid) -> Result<TaskDetail, ControlError> {
        let task = task_db::get_task(&self.pool, task_id)
            .await?
            .ok_or(ControlError::NotFound(task_id))?;
        let latest_execution = exec_db::latest_execution(&self.pool, task_id).await?;
        let result = result_db::get_result(&self.pool, task_id).await?;
        Ok(TaskDetail {
            task,
            latest_execution,
            result,
        })
    }

    /// List tasks matching a filter.
    pub async fn list_tasks(
        &self,
        filter: &task_db::TaskFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Task>, StoreError> {
        task_db::list_tasks(&self.pool, filter, limit, offset).await
    }

    /// List scheduled tasks, soonest first.
    pub async fn scheduled_list(&self) -> Result<Vec<Task>, StoreError> {
        task_db::list_scheduled(&self.pool).await
    }
}

/// Evaluate the wait-set against predecessor rows already in hand
/// (submission-time variant of [`resolver::evaluate`]).
fn initial_eligibility(preds: &[Task], mode: WaitMode) -> Eligibility {
    if preds.is_empty() {
        return Eligibility::Eligible;
    }
    let total = preds.len();
    let completed = preds
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .count();
    let failed_terminal = preds
        .iter()
        .filter(|t| t.status.is_terminal() && t.status != TaskStatus::Completed)
        .count();

    match mode {
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
    }
}
