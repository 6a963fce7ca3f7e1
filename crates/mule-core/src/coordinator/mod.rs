//! Coordinator: the top-level loops and the two public surfaces.
//!
//! Four loops run concurrently on the shared runtime: scheduling
//! (promotes due tasks), completion (consumes the broker's event stream
//! and routes to the retry engine, dependency resolver, and cron
//! expansion), liveness (reaps dead workers, enforces timeouts), and a
//! dead-letter janitor. Loops never hold a task record across I/O; every
//! decision re-reads and CASes.

pub mod submit;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use mule_db::models::{Task, TaskStatus};
use mule_db::queries::tasks as task_db;

use crate::broker::{Broker, QueueEvent};
use crate::config::QueueConfig;
use crate::dispatch::{AcquireError, Dispatcher, Outcome, ReportAck};
use crate::liveness::{AdminAck, AdminError, LivenessMonitor};
use crate::resolver::DependencyResolver;
use crate::retry::RetryEngine;
use crate::scheduler::Scheduler;
use crate::session::{self, SessionConfig, SessionError};
use crate::worker::{WorkerAdminOp, WorkerInfo, WorkerStatus};

pub use submit::{CancelOutcome, ControlError, SubmitError, TaskDetail, TaskSpec};

/// How often the completion loop polls when the stream is empty.
const COMPLETION_POLL: Duration = Duration::from_millis(200);

/// How often the dead-letter janitor runs.
const JANITOR_TICK: Duration = Duration::from_secs(3600);

/// Errors on the worker surface.
#[derive(Debug, thiserror::Error)]
pub enum WorkerApiError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("worker {0} is not registered")]
    UnknownWorker(String),

    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error(transparent)]
    Admin(#[from] AdminError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The queue core, fully assembled.
pub struct Coordinator {
    pub(crate) pool: PgPool,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) config: QueueConfig,
    session: SessionConfig,
    dispatcher: Dispatcher,
    retry: RetryEngine,
    pub(crate) resolver: DependencyResolver,
    scheduler: Scheduler,
    liveness: LivenessMonitor,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        pool: PgPool,
        broker: Arc<dyn Broker>,
        config: QueueConfig,
        session: SessionConfig,
    ) -> Self {
        let dispatcher = Dispatcher::new(pool.clone(), broker.clone(), config.clone());
        let retry = RetryEngine::new(pool.clone(), broker.clone(), config.clone());
        let resolver = DependencyResolver::new(pool.clone(), broker.clone());
        let scheduler = Scheduler::new(pool.clone(), broker.clone());
        let liveness = LivenessMonitor::new(pool.clone(), broker.clone(), config.clone());
        Self {
            pool,
            broker,
            config,
            session,
            dispatcher,
            retry,
            resolver,
            scheduler,
            liveness,
            cancel: CancellationToken::new(),
        }
    }

    /// Signal every loop to wind down.
    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // -----------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------

    /// Rebuild broker state from the store after a restart.
    ///
    /// Pending tasks are re-enqueued in creation order (preserving FIFO
    /// within each priority), scheduled tasks re-enter the scheduled
    /// set, and half-written dependency cycles are cancelled.
    pub async fn recover(&self) -> Result<()> {
        let pending = task_db::list_pending_in_order(&self.pool)
            .await
            .context("failed to list pending tasks for recovery")?;
        let pending_count = pending.len();
        for task in pending {
            self.broker
                .enqueue(task.id, task.priority as u8, task.retry_count + 1)
                .await?;
        }

        let scheduled = task_db::list_scheduled(&self.pool)
            .await
            .context("failed to list scheduled tasks for recovery")?;
        let scheduled_count = scheduled.len();
        for task in scheduled {
            if let Some(ready_at) = task.ready_at {
                self.broker.schedule(task.id, ready_at).await?;
            }
        }

        self.resolver.cancel_runtime_cycles().await?;

        info!(
            pending = pending_count,
            scheduled = scheduled_count,
            "broker state recovered from store"
        );
        Ok(())
    }

    /// Run the coordinator until shutdown: recover, then drive all four
    /// loops to completion.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.recover().await?;
        let handles = Arc::clone(&self).spawn_loops();
        for handle in handles {
            let _ = handle.await;
        }
        info!("coordinator stopped");
        Ok(())
    }

    /// Spawn the scheduling, completion, liveness, and janitor loops.
    pub fn spawn_loops(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Self::scheduling_loop(Arc::clone(&self))),
            tokio::spawn(Self::completion_loop(Arc::clone(&self))),
            tokio::spawn(Self::liveness_loop(Arc::clone(&self))),
            tokio::spawn(Self::janitor_loop(Arc::clone(&self))),
        ]
    }

    /// Run one scheduler pass outside the loop (embedders and tests
    /// drive ticks manually for determinism).
    pub async fn scheduler_tick(&self) -> Result<u32> {
        self.scheduler.tick().await
    }

    /// Run one liveness pass outside the loop.
    pub async fn liveness_tick(&self) -> Result<()> {
        self.liveness.tick().await
    }

    // -----------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------

    async fn scheduling_loop(this: Arc<Self>) {
        let mut interval = tokio::time::interval(this.config.scheduler_tick());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = this.cancel.cancelled() => break,
                _ = interval.tick() => {
                    match this.scheduler.tick().await {
                        Ok(promoted) if promoted > 0 => {
                            debug!(promoted, "scheduler tick");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "scheduler tick failed"),
                    }
                }
            }
        }
    }

    async fn completion_loop(this: Arc<Self>) {
        let mut cursor = 0u64;
        // Transient failures are retried in place; once they persist
        // past the runtime grace window the loop reports degradation.
        let runtime_grace = Duration::from_secs(this.config.runtime_grace_secs);
        let mut failing_since: Option<tokio::time::Instant> = None;
        loop {
            if this.cancel.is_cancelled() {
                break;
            }
            match this.broker.consume_events(cursor, 64).await {
                Ok((events, next_cursor)) => {
                    failing_since = None;
                    let empty = events.is_empty();
                    for event in events {
                        if let Err(e) = this.route_event(&event).await {
                            error!(error = %e, ?event, "failed to route completion event");
                        }
                    }
                    cursor = next_cursor;
                    if empty {
                        tokio::select! {
                            _ = this.cancel.cancelled() => break,
                            _ = tokio::time::sleep(COMPLETION_POLL) => {}
                        }
                    }
                }
                Err(e) => {
                    let since = *failing_since.get_or_insert_with(tokio::time::Instant::now);
                    if since.elapsed() > runtime_grace {
                        error!(error = %e, "completion stream unavailable past runtime grace, health degraded");
                    } else {
                        error!(error = %e, "completion stream read failed, retrying");
                    }
                    tokio::select! {
                        _ = this.cancel.cancelled() => break,
                        _ = tokio::time::sleep(COMPLETION_POLL) => {}
                    }
                }
            }
        }
    }

    async fn liveness_loop(this: Arc<Self>) {
        let mut interval = tokio::time::interval(this.config.liveness_tick());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = this.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = this.liveness.tick().await {
                        error!(error = %e, "liveness tick failed");
                    }
                }
            }
        }
    }

    async fn janitor_loop(this: Arc<Self>) {
        let mut interval = tokio::time::interval(JANITOR_TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = this.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let cutoff = Utc::now()
                        - chrono::Duration::days(this.config.dlq_retention_days);
                    if let Err(e) = this.retry.purge(cutoff).await {
                        error!(error = %e, "dead-letter purge failed");
                    }
                }
            }
        }
    }

    /// Drain and route every event currently on the stream, starting at
    /// `cursor`. Routing may publish further events (cascading cancels,
    /// dead-letter parks); the drain loops until the stream is quiet.
    /// Returns the cursor to resume from.
    ///
    /// One-shot callers (CLI commands, tests) use this instead of the
    /// long-running completion loop.
    pub async fn drain_events(&self, mut cursor: u64) -> Result<u64> {
        loop {
            let (events, next_cursor) = self.broker.consume_events(cursor, 64).await?;
            if events.is_empty() {
                return Ok(cursor);
            }
            for event in events {
                self.route_event(&event).await?;
            }
            cursor = next_cursor;
        }
    }

    /// Route one completion event.
    ///
    /// Failures and timeouts go to the retry engine; every terminal
    /// status drives the dependency resolver, and terminal cron tasks
    /// expand their next occurrence.
    async fn route_event(&self, event: &QueueEvent) -> Result<()> {
        let QueueEvent::TaskFinished {
            task_id, status, ..
        } = event
        else {
            // Worker deaths are informational here; the liveness monitor
            // already did the reassignment work.
            return Ok(());
        };

        match status {
            TaskStatus::Failed | TaskStatus::Timeout => {
                self.retry.handle_failure(*task_id, *status).await?;
            }
            TaskStatus::Completed | TaskStatus::Dead => {
                self.resolver.on_terminal(*task_id).await?;
                self.expand_cron(*task_id).await?;
            }
            TaskStatus::Cancelled => {
                self.resolver.on_terminal(*task_id).await?;
            }
            other => {
                debug!(task_id = %task_id, status = %other, "ignoring non-terminal event");
            }
        }
        Ok(())
    }

    /// If the finished task recurs, schedule its next occurrence.
    async fn expand_cron(&self, task_id: Uuid) -> Result<()> {
        let Some(task) = task_db::get_task(&self.pool, task_id).await? else {
            return Ok(());
        };
        if task.cron_expression.is_some() {
            self.scheduler.reschedule_cron(&task).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Worker surface
    // -----------------------------------------------------------------

    /// Register a worker and hand it a session token.
    pub async fn register_worker(
        &self,
        worker_id: &str,
        hostname: &str,
        capacity: u32,
    ) -> Result<String, WorkerApiError> {
        let info = WorkerInfo::new(worker_id, hostname, capacity.max(1));
        self.broker
            .heartbeat_upsert(info, self.config.registry_ttl())
            .await
            .map_err(|e| WorkerApiError::Other(e.into()))?;
        info!(worker_id, hostname, capacity, "worker registered");
        Ok(session::issue_token(&self.session, worker_id))
    }

    /// Record a worker heartbeat.
    ///
    /// The worker reports its own status and load; administrative
    /// overrides (paused, draining) stick until resumed and are not
    /// clobbered by heartbeats.
    pub async fn worker_heartbeat(
        &self,
        token: &str,
        status: WorkerStatus,
        current_load: u32,
    ) -> Result<(), WorkerApiError> {
        let claims = session::validate_token(&self.session, token)?;
        let entry = self
            .broker
            .registry_get(&claims.worker_id)
            .await
            .map_err(|e| WorkerApiError::Other(e.into()))?
            .ok_or_else(|| WorkerApiError::UnknownWorker(claims.worker_id.clone()))?;

        let mut info = entry.info;
        info.status = match info.status {
            WorkerStatus::Paused | WorkerStatus::Draining => info.status,
            _ => status,
        };
        info.current_load = current_load;
        info.last_heartbeat = Utc::now();

        self.broker
            .heartbeat_upsert(info, self.config.registry_ttl())
            .await
            .map_err(|e| WorkerApiError::Other(e.into()))?;
        Ok(())
    }

    /// Hand the calling worker its next task, if any.
    pub async fn acquire(&self, token: &str) -> Result<Option<Task>, WorkerApiError> {
        let claims = session::validate_token(&self.session, token)?;
        Ok(self.dispatcher.acquire(&claims.worker_id).await?)
    }

    /// Record the calling worker's outcome for a task.
    pub async fn report(
        &self,
        token: &str,
        task_id: Uuid,
        outcome: Outcome,
    ) -> Result<ReportAck, WorkerApiError> {
        let claims = session::validate_token(&self.session, token)?;
        Ok(self
            .dispatcher
            .report(&claims.worker_id, task_id, outcome)
            .await?)
    }

    /// Deregister the calling worker (drains first if tasks are in
    /// flight).
    pub async fn deregister(&self, token: &str) -> Result<AdminAck, WorkerApiError> {
        let claims = session::validate_token(&self.session, token)?;
        Ok(self
            .liveness
            .admin(&claims.worker_id, WorkerAdminOp::Deregister)
            .await?)
    }

    /// Operator-side worker administration.
    pub async fn worker_admin(
        &self,
        worker_id: &str,
        op: WorkerAdminOp,
    ) -> Result<AdminAck, WorkerApiError> {
        Ok(self.liveness.admin(worker_id, op).await?)
    }

    /// Snapshot the worker registry.
    pub async fn workers(&self) -> Result<Vec<crate::broker::RegistryEntry>, WorkerApiError> {
        self.broker
            .registry_scan()
            .await
            .map_err(|e| WorkerApiError::Other(e.into()))
    }

    // -----------------------------------------------------------------
    // Dead-letter surface
    // -----------------------------------------------------------------

    /// List dead-letter entries.
    pub async fn dlq_list(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<mule_db::models::DlqEntry>, ControlError> {
        self.retry.list(limit, offset).await.map_err(ControlError::Other)
    }

    /// Inspect the newest dead-letter entry for a task.
    pub async fn dlq_inspect(
        &self,
        task_id: Uuid,
    ) -> Result<Option<mule_db::models::DlqEntry>, ControlError> {
        self.retry.inspect(task_id).await.map_err(ControlError::Other)
    }

    /// Requeue a dead-lettered task.
    pub async fn dlq_requeue(&self, task_id: Uuid) -> Result<(), ControlError> {
        self.retry.requeue(task_id).await.map_err(ControlError::Other)
    }

    /// Purge dead-letter entries older than the retention window.
    pub async fn dlq_purge(&self, older_than: chrono::DateTime<Utc>) -> Result<u64, ControlError> {
        self.retry.purge(older_than).await.map_err(ControlError::Other)
    }

    /// Task counts by status.
    pub async fn queue_depths(
        &self,
    ) -> Result<task_db::QueueDepths, mule_db::error::StoreError> {
        task_db::count_by_status(&self.pool).await
    }
}
