//! End-to-end queue scenarios driven through the public worker surface.
//!
//! These tests require Docker (testcontainers) or an external PostgreSQL
//! via `MULE_TEST_PG_URL`. Each test gets its own database. Loops are
//! driven manually (`scheduler_tick`, `liveness_tick`, `drain_events`)
//! so the tests are deterministic instead of timing-dependent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use mule_core::broker::MemoryBroker;
use mule_core::codec::Payload;
use mule_core::config::QueueConfig;
use mule_core::coordinator::{Coordinator, TaskSpec};
use mule_core::dispatch::Outcome;
use mule_core::session::SessionConfig;
use mule_db::models::{ExecutionStatus, TaskStatus, WaitMode};
use mule_db::queries::dlq as dlq_db;
use mule_db::queries::executions as exec_db;
use mule_db::queries::results as result_db;
use mule_db::queries::tasks as task_db;

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Queue settings tuned for test speed: sub-second liveness, no blocking
/// dequeue.
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

async fn setup() -> (Arc<Coordinator>, PgPool, String) {
    let (pool, db_name) = mule_test_utils::create_test_db().await;
    let coordinator = Arc::new(Coordinator::new(
        pool.clone(),
        Arc::new(MemoryBroker::new()),
        test_config(),
        SessionConfig::new(b"scenario-test-secret".to_vec()),
    ));
    (coordinator, pool, db_name)
}

async fn teardown(pool: PgPool, db_name: String) {
    pool.close().await;
    mule_test_utils::drop_test_db(&db_name).await;
}

/// Register a worker and return its session token.
async fn register(coordinator: &Coordinator, worker_id: &str) -> String {
    coordinator
        .register_worker(worker_id, "test-host", 4)
        .await
        .expect("registration should succeed")
}

/// Pull the backoff deadline of a scheduled retry forward so the next
/// scheduler tick promotes it without sleeping.
async fn rewind_ready_at(pool: &PgPool, task_id: Uuid) {
    sqlx::query("UPDATE tasks SET ready_at = NOW() WHERE id = $1")
        .bind(task_id)
        .execute(pool)
        .await
        .expect("rewind should succeed");
}

fn success(value: &str) -> Outcome {
    Outcome::Success {
        result: Payload::encode_json(&value).unwrap(),
    }
}

fn failure(message: &str) -> Outcome {
    Outcome::Failure {
        kind: "handler_error".to_owned(),
        message: message.to_owned(),
        traceback: None,
    }
}

// ---------------------------------------------------------------------------
// Scenario 1: happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_single_attempt() {
    let (coordinator, pool, db_name) = setup().await;
    let token = register(&coordinator, "w1").await;

    let mut spec = TaskSpec::new("echo");
    spec.args = Payload::encode_json(&vec!["hi"]).unwrap();
    spec.priority = 5;
    let task_id = coordinator.submit(spec).await.unwrap();

    let task = coordinator
        .acquire(&token)
        .await
        .unwrap()
        .expect("worker should receive the task");
    assert_eq!(task.id, task_id);
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.worker_id.as_deref(), Some("w1"));
    assert!(task.started_at.is_some());

    coordinator
        .report(&token, task_id, success("hi"))
        .await
        .unwrap();
    coordinator.drain_events(0).await.unwrap();

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.completed_at.is_some());
    assert!(task.worker_id.is_none(), "worker cleared after completion");

    let executions = exec_db::list_executions(&pool, task_id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].attempt_number, 1);
    assert_eq!(executions[0].status, Some(ExecutionStatus::Completed));

    let result = result_db::get_result(&pool, task_id).await.unwrap().unwrap();
    assert!(result.error_kind.is_none());
    let payload = Payload::from_value(&result.result_data.unwrap()).unwrap();
    let decoded: String = payload.decode_json().unwrap();
    assert_eq!(decoded, "hi");

    assert!(
        dlq_db::latest_for_task(&pool, task_id).await.unwrap().is_none(),
        "no DLQ entry on success"
    );

    teardown(pool, db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario 2: retry then succeed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_then_succeed() {
    let (coordinator, pool, db_name) = setup().await;
    let token = register(&coordinator, "w1").await;

    let mut spec = TaskSpec::new("flaky");
    spec.max_retries = Some(3);
    spec.retry_base_delay_secs = Some(1);
    let task_id = coordinator.submit(spec).await.unwrap();

    // First attempt fails.
    let task = coordinator.acquire(&token).await.unwrap().unwrap();
    assert_eq!(task.id, task_id);
    coordinator
        .report(&token, task_id, failure("net"))
        .await
        .unwrap();
    coordinator.drain_events(0).await.unwrap();

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Scheduled, "parked for backoff");
    assert_eq!(task.retry_count, 1);
    assert!(task.ready_at.is_some(), "backoff deadline set");

    // Fast-forward the backoff and promote.
    rewind_ready_at(&pool, task_id).await;
    let promoted = coordinator.scheduler_tick().await.unwrap();
    assert_eq!(promoted, 1);

    // Second attempt succeeds.
    let task = coordinator.acquire(&token).await.unwrap().unwrap();
    assert_eq!(task.id, task_id);
    assert_eq!(task.retry_count, 1);
    coordinator
        .report(&token, task_id, success("ok"))
        .await
        .unwrap();
    coordinator.drain_events(0).await.unwrap();

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 1);

    let executions = exec_db::list_executions(&pool, task_id).await.unwrap();
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].status, Some(ExecutionStatus::Failed));
    assert_eq!(executions[1].status, Some(ExecutionStatus::Completed));
    assert_eq!(executions[1].attempt_number, 2);

    teardown(pool, db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario 3: exhaust retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_retries_reach_dead_letter() {
    let (coordinator, pool, db_name) = setup().await;
    let token = register(&coordinator, "w1").await;

    let mut spec = TaskSpec::new("always_fails");
    spec.max_retries = Some(2);
    spec.retry_base_delay_secs = Some(1);
    let task_id = coordinator.submit(spec).await.unwrap();

    for attempt in 1..=3 {
        let task = coordinator
            .acquire(&token)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("attempt {attempt} should be dispatched"));
        assert_eq!(task.id, task_id);
        coordinator
            .report(&token, task_id, failure(&format!("boom-{attempt}")))
            .await
            .unwrap();
        coordinator.drain_events(0).await.unwrap();

        if attempt < 3 {
            rewind_ready_at(&pool, task_id).await;
            coordinator.scheduler_tick().await.unwrap();
        }
    }

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Dead);
    assert_eq!(task.retry_count, 2);

    let executions = exec_db::list_executions(&pool, task_id).await.unwrap();
    assert_eq!(executions.len(), 3);

    let entry = dlq_db::latest_for_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(entry.total_attempts, 3);
    assert_eq!(entry.failure_reason, "retries_exhausted");
    assert_eq!(
        entry.error_message.as_deref(),
        Some("boom-3"),
        "last error message carried verbatim"
    );

    teardown(pool, db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario 4: worker death mid-task
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dead_worker_task_is_reassigned_without_burning_a_retry() {
    let (coordinator, pool, db_name) = setup().await;
    let token_w1 = register(&coordinator, "w1").await;

    let mut spec = TaskSpec::new("long");
    spec.timeout_secs = Some(60);
    let task_id = coordinator.submit(spec).await.unwrap();

    let task = coordinator.acquire(&token_w1).await.unwrap().unwrap();
    assert_eq!(task.id, task_id);

    // w1 stops heartbeating; dead_after is 1s in the test config.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    coordinator.liveness_tick().await.unwrap();
    coordinator.drain_events(0).await.unwrap();

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending, "returned to the queue");
    assert!(task.worker_id.is_none());
    assert_eq!(task.retry_count, 0, "orphaning does not burn a retry");
    assert_eq!(task.orphan_reassignments, 1);

    // A late report from the dead worker is discarded.
    let ack = coordinator
        .report(&token_w1, task_id, success("stale"))
        .await
        .unwrap();
    assert_eq!(ack, mule_core::dispatch::ReportAck::Discarded);

    // A replacement worker finishes the job.
    let token_w2 = register(&coordinator, "w2").await;
    let task = coordinator.acquire(&token_w2).await.unwrap().unwrap();
    assert_eq!(task.id, task_id);
    coordinator
        .report(&token_w2, task_id, success("done"))
        .await
        .unwrap();
    coordinator.drain_events(0).await.unwrap();

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    let executions = exec_db::list_executions(&pool, task_id).await.unwrap();
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].status, Some(ExecutionStatus::Orphaned));
    assert_eq!(executions[0].worker_id, "w1");
    assert_eq!(executions[1].status, Some(ExecutionStatus::Completed));
    assert_eq!(executions[1].worker_id, "w2");

    teardown(pool, db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario 5: scheduled task
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scheduled_task_waits_for_its_deadline() {
    let (coordinator, pool, db_name) = setup().await;
    let token = register(&coordinator, "w1").await;

    let fire_at = Utc::now() + chrono::Duration::milliseconds(500);
    let mut spec = TaskSpec::new("later");
    spec.priority = 7;
    spec.scheduled_at = Some(fire_at);
    let task_id = coordinator.submit(spec).await.unwrap();

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Scheduled);

    // Before the deadline: not promoted, not acquirable.
    coordinator.scheduler_tick().await.unwrap();
    assert!(coordinator.acquire(&token).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(600)).await;
    let promoted = coordinator.scheduler_tick().await.unwrap();
    assert_eq!(promoted, 1);

    let task = coordinator.acquire(&token).await.unwrap().unwrap();
    assert_eq!(task.id, task_id);
    assert!(
        task.started_at.unwrap() >= fire_at,
        "must not start before the scheduled time"
    );

    teardown(pool, db_name).await;
}

// ---------------------------------------------------------------------------
// Scenario 6: wait_for_all with a failing predecessor
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wait_for_all_cancels_dependent_when_predecessor_dies() {
    let (coordinator, pool, db_name) = setup().await;
    let token = register(&coordinator, "w1").await;

    let a = coordinator.submit(TaskSpec::new("a")).await.unwrap();
    let mut spec_b = TaskSpec::new("b");
    spec_b.max_retries = Some(0);
    let b = coordinator.submit(spec_b).await.unwrap();

    let mut spec_c = TaskSpec::new("c");
    spec_c.depends_on = vec![a, b];
    spec_c.wait_mode = WaitMode::All;
    let c = coordinator.submit(spec_c).await.unwrap();

    let gated = task_db::get_task(&pool, c).await.unwrap().unwrap();
    assert_eq!(gated.status, TaskStatus::Scheduled, "C is dependency-gated");

    // A completes.
    let task = coordinator.acquire(&token).await.unwrap().unwrap();
    assert_eq!(task.id, a);
    coordinator.report(&token, a, success("a")).await.unwrap();
    coordinator.drain_events(0).await.unwrap();

    // B fails once; with max_retries = 0 it goes straight to dead.
    let task = coordinator.acquire(&token).await.unwrap().unwrap();
    assert_eq!(task.id, b);
    coordinator.report(&token, b, failure("fatal")).await.unwrap();
    coordinator.drain_events(0).await.unwrap();

    let b_row = task_db::get_task(&pool, b).await.unwrap().unwrap();
    assert_eq!(b_row.status, TaskStatus::Dead);

    let c_row = task_db::get_task(&pool, c).await.unwrap().unwrap();
    assert_eq!(c_row.status, TaskStatus::Cancelled);
    let c_result = result_db::get_result(&pool, c).await.unwrap().unwrap();
    assert_eq!(c_result.error_kind.as_deref(), Some("predecessor_failed"));

    // C was never enqueued: nothing left to acquire, no executions.
    assert!(coordinator.acquire(&token).await.unwrap().is_none());
    assert_eq!(exec_db::count_executions(&pool, c).await.unwrap(), 0);

    teardown(pool, db_name).await;
}

// ---------------------------------------------------------------------------
// wait_for_any: one success releases the dependent
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wait_for_any_releases_on_first_completion() {
    let (coordinator, pool, db_name) = setup().await;
    let token = register(&coordinator, "w1").await;

    let a = coordinator.submit(TaskSpec::new("a")).await.unwrap();
    let b = coordinator.submit(TaskSpec::new("b")).await.unwrap();

    let mut spec_c = TaskSpec::new("c");
    spec_c.depends_on = vec![a, b];
    spec_c.wait_mode = WaitMode::Any;
    let c = coordinator.submit(spec_c).await.unwrap();

    // Complete A only.
    let task = coordinator.acquire(&token).await.unwrap().unwrap();
    assert_eq!(task.id, a);
    coordinator.report(&token, a, success("a")).await.unwrap();
    coordinator.drain_events(0).await.unwrap();

    let c_row = task_db::get_task(&pool, c).await.unwrap().unwrap();
    assert_eq!(
        c_row.status,
        TaskStatus::Pending,
        "any-mode releases on the first completed predecessor"
    );

    teardown(pool, db_name).await;
}

// ---------------------------------------------------------------------------
// Cron recurrence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cron_task_reinserts_next_occurrence_on_completion() {
    let (coordinator, pool, db_name) = setup().await;
    let token = register(&coordinator, "w1").await;

    let mut spec = TaskSpec::new("nightly");
    spec.cron_expression = Some("0 3 * * *".to_owned());
    let task_id = coordinator.submit(spec).await.unwrap();

    let task = coordinator.acquire(&token).await.unwrap().unwrap();
    assert_eq!(task.id, task_id);
    coordinator
        .report(&token, task_id, success("ran"))
        .await
        .unwrap();
    coordinator.drain_events(0).await.unwrap();

    let original = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(original.status, TaskStatus::Completed, "history retained");

    // A fresh occurrence exists, scheduled strictly in the future.
    let scheduled = task_db::list_scheduled(&pool).await.unwrap();
    assert_eq!(scheduled.len(), 1);
    let next = &scheduled[0];
    assert_eq!(next.task_name, "nightly");
    assert_ne!(next.id, task_id);
    assert_eq!(next.parent_task_id, Some(task_id));
    assert_eq!(next.retry_count, 0);
    assert!(next.ready_at.unwrap() > Utc::now());

    teardown(pool, db_name).await;
}
