//! The `Broker` trait -- transient queue state behind an object-safe seam.
//!
//! The broker owns what is allowed to be lost and rebuilt: priority queue
//! membership, the scheduled set, the worker registry, the completion
//! stream, and rate-limit counters. Task records themselves live in the
//! store; queue elements are task ids only. The trait is intentionally
//! object-safe so the coordinator can hold `Arc<dyn Broker>` and swap
//! implementations without touching the loops.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mule_db::models::TaskStatus;

use crate::worker::{WorkerInfo, WorkerStatus};

pub use memory::MemoryBroker;

/// Errors from broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The broker cannot be reached or refused the operation for
    /// infrastructure reasons. Retryable.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Result alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// An event on the completion stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A task attempt reached a reported status (terminal or retryable).
    TaskFinished {
        task_id: Uuid,
        status: TaskStatus,
        attempt: i32,
        worker_id: Option<String>,
        at: DateTime<Utc>,
    },
    /// A worker was declared dead by the liveness monitor.
    WorkerDied { worker_id: String, at: DateTime<Utc> },
}

/// A worker registry entry with its expiration deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub info: WorkerInfo,
    /// Heartbeats push this forward; a scan past it means the worker has
    /// gone silent.
    pub expires_at: DateTime<Utc>,
}

impl RegistryEntry {
    /// Whether the entry's TTL has lapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// The descending priority scan order used by dispatchers.
pub const ALL_PRIORITIES: [u8; 10] = [10, 9, 8, 7, 6, 5, 4, 3, 2, 1];

/// Transient queue state: priority queues, scheduled set, worker
/// registry, completion stream, rate counters.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a task id to the FIFO queue for `priority`.
    ///
    /// Idempotent per `(task_id, attempt)`: re-enqueueing the same pair
    /// returns `false` and leaves a single queue entry.
    async fn enqueue(&self, task_id: Uuid, priority: u8, attempt: i32) -> BrokerResult<bool>;

    /// Atomically pop the next task id, scanning `priorities` in the
    /// given order (FIFO within each queue). Blocks up to `timeout` when
    /// all listed queues are empty.
    async fn dequeue(&self, priorities: &[u8], timeout: Duration) -> BrokerResult<Option<Uuid>>;

    /// Add a task to the scheduled set with its readiness deadline.
    /// Re-scheduling an already-present task replaces its deadline.
    async fn schedule(&self, task_id: Uuid, ready_at: DateTime<Utc>) -> BrokerResult<()>;

    /// Remove and return every scheduled task whose deadline is at or
    /// before `now`, soonest first.
    async fn poll_due(&self, now: DateTime<Utc>) -> BrokerResult<Vec<Uuid>>;

    /// Remove a task from the scheduled set (e.g. on cancellation).
    async fn unschedule(&self, task_id: Uuid) -> BrokerResult<bool>;

    /// Upsert a worker registry entry, resetting its TTL.
    async fn heartbeat_upsert(&self, info: WorkerInfo, ttl: Duration) -> BrokerResult<()>;

    /// Snapshot every registry entry, expired ones included.
    async fn registry_scan(&self) -> BrokerResult<Vec<RegistryEntry>>;

    /// Fetch one registry entry.
    async fn registry_get(&self, worker_id: &str) -> BrokerResult<Option<RegistryEntry>>;

    /// Overwrite a worker's status without touching its TTL. Returns
    /// `false` when the worker is not registered.
    async fn registry_set_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> BrokerResult<bool>;

    /// Adjust a worker's advisory load counter, saturating at zero.
    async fn registry_adjust_load(&self, worker_id: &str, delta: i32) -> BrokerResult<()>;

    /// Remove a worker's registry entry. Returns `false` if absent.
    async fn registry_remove(&self, worker_id: &str) -> BrokerResult<bool>;

    /// Append an event to the completion stream.
    async fn publish_event(&self, event: QueueEvent) -> BrokerResult<()>;

    /// Read up to `max` events starting at `cursor`. Returns the events
    /// and the cursor to resume from. Non-blocking.
    async fn consume_events(
        &self,
        cursor: u64,
        max: usize,
    ) -> BrokerResult<(Vec<QueueEvent>, u64)>;

    /// Count an occurrence against a fixed-window rate counter. Returns
    /// `true` when the occurrence is within `limit` for the window.
    async fn check_rate(&self, key: &str, limit: u32, window: Duration) -> BrokerResult<bool>;
}

// Compile-time assertion: Broker must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Broker) {}
};
