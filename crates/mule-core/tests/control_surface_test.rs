//! Cancellation, replay, dead-letter requeue, priority/FIFO boundaries,
//! claim mutual exclusion, timeouts, and session validation, all against
//! a real database.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use mule_core::broker::{Broker, MemoryBroker};
use mule_core::codec::Payload;
use mule_core::config::QueueConfig;
use mule_core::coordinator::{CancelOutcome, ControlError, Coordinator, TaskSpec, WorkerApiError};
use mule_core::dispatch::{Outcome, ReportAck};
use mule_core::session::SessionConfig;
use mule_db::models::{ExecutionStatus, TaskStatus};
use mule_db::queries::dlq as dlq_db;
use mule_db::queries::executions as exec_db;
use mule_db::queries::tasks as task_db;

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn test_config() -> QueueConfig {
    QueueConfig {
        heartbeat_interval_secs: 1,
        dead_after_secs: 1,
        liveness_tick_secs: 1,
        scheduler_tick_secs: 1,
        broker_dequeue_timeout_secs: 0,
        ..QueueConfig::default()
    }
}

async fn setup_with_config(
    config: QueueConfig,
) -> (Arc<Coordinator>, Arc<MemoryBroker>, PgPool, String) {
    let (pool, db_name) = mule_test_utils::create_test_db().await;
    let broker = Arc::new(MemoryBroker::new());
    let coordinator = Arc::new(Coordinator::new(
        pool.clone(),
        broker.clone(),
        config,
        SessionConfig::new(b"control-test-secret".to_vec()),
    ));
    (coordinator, broker, pool, db_name)
}

async fn setup() -> (Arc<Coordinator>, Arc<MemoryBroker>, PgPool, String) {
    setup_with_config(test_config()).await
}

async fn teardown(pool: PgPool, db_name: String) {
    pool.close().await;
    mule_test_utils::drop_test_db(&db_name).await;
}

async fn register(coordinator: &Coordinator, worker_id: &str) -> String {
    coordinator
        .register_worker(worker_id, "test-host", 4)
        .await
        .expect("registration should succeed")
}

fn ok(value: &str) -> Outcome {
    Outcome::Success {
        result: Payload::encode_json(&value).unwrap(),
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_pending_task_is_never_dequeued() {
    let (coordinator, _broker, pool, db_name) = setup().await;
    let token = register(&coordinator, "w1").await;

    let task_id = coordinator.submit(TaskSpec::new("doomed")).await.unwrap();
    let outcome = coordinator.cancel(task_id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelled);
    coordinator.drain_events(0).await.unwrap();

    // The queue entry still exists, but the claim CAS fails and the
    // dispatcher skips it.
    assert!(coordinator.acquire(&token).await.unwrap().is_none());

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(exec_db::count_executions(&pool, task_id).await.unwrap(), 0);

    teardown(pool, db_name).await;
}

#[tokio::test]
async fn late_cancel_of_running_task_honors_worker_report() {
    let (coordinator, _broker, pool, db_name) = setup().await;
    let token = register(&coordinator, "w1").await;

    let task_id = coordinator.submit(TaskSpec::new("busy")).await.unwrap();
    let task = coordinator.acquire(&token).await.unwrap().unwrap();
    assert_eq!(task.id, task_id);

    let outcome = coordinator.cancel(task_id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Requested, "running task is not interrupted");

    let row = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert!(row.cancel_requested);
    assert_eq!(row.status, TaskStatus::Running);

    coordinator.report(&token, task_id, ok("done")).await.unwrap();
    coordinator.drain_events(0).await.unwrap();

    let row = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(
        row.status,
        TaskStatus::Completed,
        "late cancel is ignored in favor of the report"
    );

    teardown(pool, db_name).await;
}

#[tokio::test]
async fn cancel_of_terminal_task_is_rejected() {
    let (coordinator, _broker, pool, db_name) = setup().await;
    let token = register(&coordinator, "w1").await;

    let task_id = coordinator.submit(TaskSpec::new("quick")).await.unwrap();
    coordinator.acquire(&token).await.unwrap().unwrap();
    coordinator.report(&token, task_id, ok("done")).await.unwrap();
    coordinator.drain_events(0).await.unwrap();

    let result = coordinator.cancel(task_id).await;
    assert!(matches!(
        result,
        Err(ControlError::InvalidState(TaskStatus::Completed))
    ));

    teardown(pool, db_name).await;
}

// ---------------------------------------------------------------------------
// Dead-letter requeue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dlq_requeue_then_complete_resets_budget() {
    let (coordinator, _broker, pool, db_name) = setup().await;
    let token = register(&coordinator, "w1").await;

    let mut spec = TaskSpec::new("flaky");
    spec.max_retries = Some(0);
    let task_id = coordinator.submit(spec).await.unwrap();

    coordinator.acquire(&token).await.unwrap().unwrap();
    coordinator
        .report(
            &token,
            task_id,
            Outcome::Failure {
                kind: "handler_error".to_owned(),
                message: "first life".to_owned(),
                traceback: None,
            },
        )
        .await
        .unwrap();
    coordinator.drain_events(0).await.unwrap();

    // max_retries = 0: a single failure is fatal.
    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Dead);
    let entry = dlq_db::latest_for_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(entry.total_attempts, 1);

    coordinator.dlq_requeue(task_id).await.unwrap();

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0, "requeue resets the retry budget");

    let entry = dlq_db::latest_for_task(&pool, task_id).await.unwrap().unwrap();
    assert!(entry.requeued_at.is_some());

    // Second life completes.
    let task = coordinator.acquire(&token).await.unwrap().unwrap();
    assert_eq!(task.id, task_id);
    coordinator.report(&token, task_id, ok("redeemed")).await.unwrap();
    coordinator.drain_events(0).await.unwrap();

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 0);

    teardown(pool, db_name).await;
}

// ---------------------------------------------------------------------------
// Priority and FIFO boundaries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn priority_ten_precedes_priority_nine() {
    let (coordinator, _broker, pool, db_name) = setup().await;
    let token = register(&coordinator, "w1").await;

    let mut low = TaskSpec::new("low");
    low.priority = 9;
    let low_id = coordinator.submit(low).await.unwrap();

    let mut high = TaskSpec::new("high");
    high.priority = 10;
    let high_id = coordinator.submit(high).await.unwrap();

    let first = coordinator.acquire(&token).await.unwrap().unwrap();
    assert_eq!(first.id, high_id, "priority 10 wins despite later submission");
    let second = coordinator.acquire(&token).await.unwrap().unwrap();
    assert_eq!(second.id, low_id);

    teardown(pool, db_name).await;
}

#[tokio::test]
async fn same_priority_dequeues_in_submission_order() {
    let (coordinator, _broker, pool, db_name) = setup().await;
    let token = register(&coordinator, "w1").await;

    let first_id = coordinator.submit(TaskSpec::new("first")).await.unwrap();
    let second_id = coordinator.submit(TaskSpec::new("second")).await.unwrap();

    assert_eq!(coordinator.acquire(&token).await.unwrap().unwrap().id, first_id);
    assert_eq!(coordinator.acquire(&token).await.unwrap().unwrap().id, second_id);

    teardown(pool, db_name).await;
}

// ---------------------------------------------------------------------------
// Claim mutual exclusion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_queue_entries_yield_a_single_claim() {
    let (coordinator, broker, pool, db_name) = setup().await;
    let token_a = register(&coordinator, "wa").await;
    let token_b = register(&coordinator, "wb").await;

    let task_id = coordinator.submit(TaskSpec::new("contested")).await.unwrap();
    // Force a duplicate entry under a different attempt key, simulating
    // a redelivered enqueue.
    broker.enqueue(task_id, 5, 99).await.unwrap();

    let (a, b) = tokio::join!(coordinator.acquire(&token_a), coordinator.acquire(&token_b));
    let a = a.unwrap();
    let b = b.unwrap();

    let claims = [a.is_some(), b.is_some()].iter().filter(|x| **x).count();
    assert_eq!(claims, 1, "exactly one worker may claim the task");

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(exec_db::count_executions(&pool, task_id).await.unwrap(), 1);

    teardown(pool, db_name).await;
}

// ---------------------------------------------------------------------------
// Timeout enforcement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn overdue_running_task_is_timed_out_and_retried() {
    let (coordinator, _broker, pool, db_name) = setup().await;
    let token = register(&coordinator, "w1").await;

    let mut spec = TaskSpec::new("sluggish");
    spec.timeout_secs = Some(1);
    let task_id = coordinator.submit(spec).await.unwrap();

    coordinator.acquire(&token).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(1300)).await;

    // Keep the worker alive so only the per-task timeout fires.
    coordinator
        .worker_heartbeat(&token, mule_core::worker::WorkerStatus::Busy, 1)
        .await
        .unwrap();
    coordinator.liveness_tick().await.unwrap();
    coordinator.drain_events(0).await.unwrap();

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Scheduled, "timeout consumed a retry");
    assert_eq!(task.retry_count, 1);

    let executions = exec_db::list_executions(&pool, task_id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, Some(ExecutionStatus::Timeout));

    // The worker's own late report is discarded.
    let ack = coordinator.report(&token, task_id, ok("too late")).await.unwrap();
    assert_eq!(ack, ReportAck::Discarded);

    teardown(pool, db_name).await;
}

// ---------------------------------------------------------------------------
// Orphan budget
// ---------------------------------------------------------------------------

#[tokio::test]
async fn persistent_orphaning_parks_the_task() {
    let config = QueueConfig {
        max_orphan_reassignments: 0,
        ..test_config()
    };
    let (coordinator, _broker, pool, db_name) = setup_with_config(config).await;
    let token = register(&coordinator, "w1").await;

    let task_id = coordinator.submit(TaskSpec::new("cursed")).await.unwrap();
    coordinator.acquire(&token).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(1300)).await;
    coordinator.liveness_tick().await.unwrap();
    coordinator.drain_events(0).await.unwrap();

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Dead);

    let entry = dlq_db::latest_for_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(entry.failure_reason, "persistent_orphaning");

    teardown(pool, db_name).await;
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn replay_clones_a_terminal_task() {
    let (coordinator, _broker, pool, db_name) = setup().await;
    let token = register(&coordinator, "w1").await;

    let mut spec = TaskSpec::new("original");
    spec.priority = 8;
    let task_id = coordinator.submit(spec).await.unwrap();
    coordinator.acquire(&token).await.unwrap().unwrap();
    coordinator.report(&token, task_id, ok("done")).await.unwrap();
    coordinator.drain_events(0).await.unwrap();

    let new_id = coordinator.replay(task_id).await.unwrap();
    assert_ne!(new_id, task_id);

    let new_task = task_db::get_task(&pool, new_id).await.unwrap().unwrap();
    assert_eq!(new_task.status, TaskStatus::Pending);
    assert_eq!(new_task.priority, 8);
    assert_eq!(new_task.parent_task_id, Some(task_id));
    assert_eq!(new_task.retry_count, 0);

    // Replaying an in-flight task is rejected.
    let running = coordinator.submit(TaskSpec::new("busy")).await.unwrap();
    let err = coordinator.replay(running).await.unwrap_err();
    assert!(matches!(err, ControlError::InvalidState(TaskStatus::Pending)));

    teardown(pool, db_name).await;
}

// ---------------------------------------------------------------------------
// Session and registry gates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn forged_session_token_is_rejected() {
    let (coordinator, _broker, pool, db_name) = setup().await;
    register(&coordinator, "w1").await;

    let forged = "mule_wk_w1_deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";
    let result = coordinator.acquire(forged).await;
    assert!(matches!(result, Err(WorkerApiError::Session(_))));

    teardown(pool, db_name).await;
}

#[tokio::test]
async fn paused_worker_is_refused_assignments() {
    let (coordinator, _broker, pool, db_name) = setup().await;
    let token = register(&coordinator, "w1").await;
    coordinator.submit(TaskSpec::new("work")).await.unwrap();

    coordinator
        .worker_admin("w1", mule_core::worker::WorkerAdminOp::Pause)
        .await
        .unwrap();
    let result = coordinator.acquire(&token).await;
    assert!(matches!(result, Err(WorkerApiError::Acquire(_))));

    coordinator
        .worker_admin("w1", mule_core::worker::WorkerAdminOp::Resume)
        .await
        .unwrap();
    assert!(coordinator.acquire(&token).await.unwrap().is_some());

    teardown(pool, db_name).await;
}

#[tokio::test]
async fn deregister_waits_for_drain() {
    let (coordinator, _broker, pool, db_name) = setup().await;
    let token = register(&coordinator, "w1").await;

    let task_id = coordinator.submit(TaskSpec::new("in-flight")).await.unwrap();
    coordinator.acquire(&token).await.unwrap().unwrap();

    let ack = coordinator.deregister(&token).await.unwrap();
    assert_eq!(ack, mule_core::liveness::AdminAck::Draining);

    // Draining workers get no new assignments.
    coordinator.submit(TaskSpec::new("extra")).await.unwrap();
    assert!(matches!(
        coordinator.acquire(&token).await,
        Err(WorkerApiError::Acquire(_))
    ));

    // The in-flight report is still honored, and the next liveness pass
    // removes the drained worker.
    coordinator.report(&token, task_id, ok("done")).await.unwrap();
    coordinator.drain_events(0).await.unwrap();
    coordinator.liveness_tick().await.unwrap();

    let workers = coordinator.workers().await.unwrap();
    assert!(
        workers.iter().all(|w| w.info.worker_id != "w1"),
        "drained worker should be deregistered"
    );

    teardown(pool, db_name).await;
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submission_validation_rejects_bad_fields() {
    let (coordinator, _broker, pool, db_name) = setup().await;

    let mut bad_priority = TaskSpec::new("x");
    bad_priority.priority = 11;
    assert!(coordinator.submit(bad_priority).await.is_err());

    let mut bad_cron = TaskSpec::new("x");
    bad_cron.cron_expression = Some("not a cron".to_owned());
    assert!(coordinator.submit(bad_cron).await.is_err());

    let mut bad_dep = TaskSpec::new("x");
    bad_dep.depends_on = vec![uuid::Uuid::new_v4()];
    assert!(coordinator.submit(bad_dep).await.is_err());

    assert!(coordinator.submit(TaskSpec::new("")).await.is_err());

    // Nothing was persisted.
    let depths = task_db::count_by_status(&pool).await.unwrap();
    assert_eq!(depths.total, 0);

    teardown(pool, db_name).await;
}

// ---------------------------------------------------------------------------
// Restart recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn recovery_reseeds_broker_from_store() {
    let (coordinator, _broker, pool, db_name) = setup().await;
    let pending_id = coordinator.submit(TaskSpec::new("queued")).await.unwrap();

    let mut scheduled = TaskSpec::new("later");
    scheduled.scheduled_at = Some(chrono::Utc::now() + chrono::Duration::seconds(60));
    let scheduled_id = coordinator.submit(scheduled).await.unwrap();

    // Simulate a restart: a new coordinator over a fresh, empty broker.
    let replacement = Arc::new(Coordinator::new(
        pool.clone(),
        Arc::new(MemoryBroker::new()),
        test_config(),
        SessionConfig::new(b"control-test-secret".to_vec()),
    ));
    replacement.recover().await.unwrap();

    let token = register(&replacement, "w1").await;
    let task = replacement.acquire(&token).await.unwrap().unwrap();
    assert_eq!(task.id, pending_id, "pending work survives a broker restart");

    let still_scheduled = task_db::get_task(&pool, scheduled_id).await.unwrap().unwrap();
    assert_eq!(still_scheduled.status, TaskStatus::Scheduled);

    teardown(pool, db_name).await;
}
