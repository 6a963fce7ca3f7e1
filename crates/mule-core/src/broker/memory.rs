//! In-process broker implementation.
//!
//! All state sits behind one mutex; no lock is ever held across an await
//! point. Blocked dequeuers park on a `Notify` that every enqueue pokes.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::worker::{WorkerInfo, WorkerStatus};

use super::{Broker, BrokerResult, QueueEvent, RegistryEntry};

/// One queued element: the task id, the attempt it was enqueued for, and
/// a monotonic sequence number (the FIFO tie-breaker).
#[derive(Debug, Clone)]
struct QueueItem {
    task_id: Uuid,
    attempt: i32,
    #[allow(dead_code)]
    seq: u64,
}

#[derive(Default)]
struct BrokerState {
    /// `queues[p - 1]` is the FIFO queue for priority `p`.
    queues: Vec<VecDeque<QueueItem>>,
    /// Enqueue idempotence: `(task_id, attempt)` pairs currently queued.
    queued: HashSet<(Uuid, i32)>,
    /// Monotonic sequence assigned at enqueue.
    next_seq: u64,
    /// Scheduled set ordered by `(ready_at, seq)`.
    scheduled: BTreeMap<(DateTime<Utc>, u64), Uuid>,
    /// Reverse lookup for `unschedule` and deadline replacement.
    scheduled_keys: HashMap<Uuid, (DateTime<Utc>, u64)>,
    registry: HashMap<String, RegistryEntry>,
    events: Vec<QueueEvent>,
    /// Fixed-window rate counters: key -> (window start, count).
    rate: HashMap<String, (DateTime<Utc>, u32)>,
}

/// An in-memory [`Broker`].
///
/// Queue membership is rebuilt from the store at coordinator startup, so
/// losing this state on restart is by contract recoverable.
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    enqueued: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let mut state = BrokerState::default();
        state.queues = (0..super::ALL_PRIORITIES.len())
            .map(|_| VecDeque::new())
            .collect();
        Self {
            state: Mutex::new(state),
            enqueued: Notify::new(),
        }
    }

    fn try_pop(&self, priorities: &[u8]) -> Option<Uuid> {
        let mut state = self.state.lock().expect("broker state poisoned");
        for &priority in priorities {
            if priority == 0 {
                continue;
            }
            let idx = (priority - 1) as usize;
            if let Some(item) = state.queues.get_mut(idx).and_then(VecDeque::pop_front) {
                state.queued.remove(&(item.task_id, item.attempt));
                return Some(item.task_id);
            }
        }
        None
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, task_id: Uuid, priority: u8, attempt: i32) -> BrokerResult<bool> {
        let priority = priority.clamp(1, super::ALL_PRIORITIES.len() as u8);
        {
            let mut state = self.state.lock().expect("broker state poisoned");
            if !state.queued.insert((task_id, attempt)) {
                // Already queued for this attempt.
                return Ok(false);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queues[(priority - 1) as usize].push_back(QueueItem {
                task_id,
                attempt,
                seq,
            });
        }
        self.enqueued.notify_one();
        Ok(true)
    }

    async fn dequeue(&self, priorities: &[u8], timeout: Duration) -> BrokerResult<Option<Uuid>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(task_id) = self.try_pop(priorities) {
                return Ok(Some(task_id));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let notified = self.enqueued.notified();
            // Re-check after arming the waiter so an enqueue racing the
            // first check is not missed.
            if let Some(task_id) = self.try_pop(priorities) {
                return Ok(Some(task_id));
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn schedule(&self, task_id: Uuid, ready_at: DateTime<Utc>) -> BrokerResult<()> {
        let mut state = self.state.lock().expect("broker state poisoned");
        if let Some(old_key) = state.scheduled_keys.remove(&task_id) {
            state.scheduled.remove(&old_key);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.scheduled.insert((ready_at, seq), task_id);
        state.scheduled_keys.insert(task_id, (ready_at, seq));
        Ok(())
    }

    async fn poll_due(&self, now: DateTime<Utc>) -> BrokerResult<Vec<Uuid>> {
        let mut state = self.state.lock().expect("broker state poisoned");
        let mut due = Vec::new();
        while let Some((&key, &task_id)) = state.scheduled.first_key_value() {
            if key.0 > now {
                break;
            }
            state.scheduled.remove(&key);
            state.scheduled_keys.remove(&task_id);
            due.push(task_id);
        }
        Ok(due)
    }

    async fn unschedule(&self, task_id: Uuid) -> BrokerResult<bool> {
        let mut state = self.state.lock().expect("broker state poisoned");
        match state.scheduled_keys.remove(&task_id) {
            Some(key) => {
                state.scheduled.remove(&key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn heartbeat_upsert(&self, info: WorkerInfo, ttl: Duration) -> BrokerResult<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let mut state = self.state.lock().expect("broker state poisoned");
        state
            .registry
            .insert(info.worker_id.clone(), RegistryEntry { info, expires_at });
        Ok(())
    }

    async fn registry_scan(&self) -> BrokerResult<Vec<RegistryEntry>> {
        let state = self.state.lock().expect("broker state poisoned");
        Ok(state.registry.values().cloned().collect())
    }

    async fn registry_get(&self, worker_id: &str) -> BrokerResult<Option<RegistryEntry>> {
        let state = self.state.lock().expect("broker state poisoned");
        Ok(state.registry.get(worker_id).cloned())
    }

    async fn registry_set_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> BrokerResult<bool> {
        let mut state = self.state.lock().expect("broker state poisoned");
        match state.registry.get_mut(worker_id) {
            Some(entry) => {
                entry.info.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn registry_adjust_load(&self, worker_id: &str, delta: i32) -> BrokerResult<()> {
        let mut state = self.state.lock().expect("broker state poisoned");
        if let Some(entry) = state.registry.get_mut(worker_id) {
            let load = entry.info.current_load as i64 + delta as i64;
            entry.info.current_load = load.max(0) as u32;
        }
        Ok(())
    }

    async fn registry_remove(&self, worker_id: &str) -> BrokerResult<bool> {
        let mut state = self.state.lock().expect("broker state poisoned");
        Ok(state.registry.remove(worker_id).is_some())
    }

    async fn publish_event(&self, event: QueueEvent) -> BrokerResult<()> {
        let mut state = self.state.lock().expect("broker state poisoned");
        state.events.push(event);
        Ok(())
    }

    async fn consume_events(
        &self,
        cursor: u64,
        max: usize,
    ) -> BrokerResult<(Vec<QueueEvent>, u64)> {
        let state = self.state.lock().expect("broker state poisoned");
        let start = (cursor as usize).min(state.events.len());
        let end = (start + max).min(state.events.len());
        let events = state.events[start..end].to_vec();
        Ok((events, end as u64))
    }

    async fn check_rate(&self, key: &str, limit: u32, window: Duration) -> BrokerResult<bool> {
        let now = Utc::now();
        let window = chrono::Duration::from_std(window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut state = self.state.lock().expect("broker state poisoned");
        let slot = state
            .rate
            .entry(key.to_owned())
            .or_insert_with(|| (now, 0));
        if now - slot.0 >= window {
            *slot = (now, 0);
        }
        slot.1 += 1;
        Ok(slot.1 <= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ALL_PRIORITIES;

    fn id() -> Uuid {
        Uuid::new_v4()
    }

    #[tokio::test]
    async fn fifo_within_a_priority() {
        let broker = MemoryBroker::new();
        let (a, b, c) = (id(), id(), id());

        broker.enqueue(a, 5, 1).await.unwrap();
        broker.enqueue(b, 5, 1).await.unwrap();
        broker.enqueue(c, 5, 1).await.unwrap();

        let timeout = Duration::from_millis(10);
        assert_eq!(broker.dequeue(&ALL_PRIORITIES, timeout).await.unwrap(), Some(a));
        assert_eq!(broker.dequeue(&ALL_PRIORITIES, timeout).await.unwrap(), Some(b));
        assert_eq!(broker.dequeue(&ALL_PRIORITIES, timeout).await.unwrap(), Some(c));
        assert_eq!(broker.dequeue(&ALL_PRIORITIES, timeout).await.unwrap(), None);
    }

    #[tokio::test]
    async fn higher_priority_dequeued_first() {
        let broker = MemoryBroker::new();
        let (low, high) = (id(), id());

        broker.enqueue(low, 3, 1).await.unwrap();
        broker.enqueue(high, 9, 1).await.unwrap();

        let timeout = Duration::from_millis(10);
        assert_eq!(
            broker.dequeue(&ALL_PRIORITIES, timeout).await.unwrap(),
            Some(high),
            "priority 9 must precede priority 3"
        );
        assert_eq!(broker.dequeue(&ALL_PRIORITIES, timeout).await.unwrap(), Some(low));
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_attempt() {
        let broker = MemoryBroker::new();
        let task = id();

        assert!(broker.enqueue(task, 5, 1).await.unwrap());
        assert!(!broker.enqueue(task, 5, 1).await.unwrap(), "duplicate rejected");
        // A later attempt of the same task may be queued again.
        assert!(broker.enqueue(task, 5, 2).await.unwrap());

        let timeout = Duration::from_millis(10);
        assert_eq!(broker.dequeue(&ALL_PRIORITIES, timeout).await.unwrap(), Some(task));
        assert_eq!(broker.dequeue(&ALL_PRIORITIES, timeout).await.unwrap(), Some(task));
        assert_eq!(broker.dequeue(&ALL_PRIORITIES, timeout).await.unwrap(), None);
    }

    #[tokio::test]
    async fn dequeue_blocks_until_enqueue() {
        let broker = std::sync::Arc::new(MemoryBroker::new());
        let task = id();

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .dequeue(&ALL_PRIORITIES, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.enqueue(task, 7, 1).await.unwrap();

        assert_eq!(waiter.await.unwrap(), Some(task));
    }

    #[tokio::test]
    async fn dequeue_times_out_on_empty_queue() {
        let broker = MemoryBroker::new();
        let start = std::time::Instant::now();
        let got = broker
            .dequeue(&ALL_PRIORITIES, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(got, None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn scheduled_set_releases_in_deadline_order() {
        let broker = MemoryBroker::new();
        let (early, late) = (id(), id());
        let now = Utc::now();

        broker.schedule(late, now + chrono::Duration::seconds(2)).await.unwrap();
        broker.schedule(early, now + chrono::Duration::seconds(1)).await.unwrap();

        assert!(broker.poll_due(now).await.unwrap().is_empty());

        let due = broker
            .poll_due(now + chrono::Duration::seconds(3))
            .await
            .unwrap();
        assert_eq!(due, vec![early, late]);

        // Drained: a second poll returns nothing.
        assert!(broker
            .poll_due(now + chrono::Duration::seconds(3))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn reschedule_replaces_deadline() {
        let broker = MemoryBroker::new();
        let task = id();
        let now = Utc::now();

        broker.schedule(task, now + chrono::Duration::seconds(60)).await.unwrap();
        broker.schedule(task, now + chrono::Duration::seconds(1)).await.unwrap();

        let due = broker
            .poll_due(now + chrono::Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(due, vec![task], "only one entry survives a reschedule");
    }

    #[tokio::test]
    async fn unschedule_removes_entry() {
        let broker = MemoryBroker::new();
        let task = id();
        let now = Utc::now();

        broker.schedule(task, now + chrono::Duration::seconds(1)).await.unwrap();
        assert!(broker.unschedule(task).await.unwrap());
        assert!(!broker.unschedule(task).await.unwrap());
        assert!(broker
            .poll_due(now + chrono::Duration::seconds(2))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn registry_ttl_and_expiry() {
        let broker = MemoryBroker::new();
        let info = WorkerInfo::new("w1", "host-a", 4);

        broker
            .heartbeat_upsert(info, Duration::from_secs(30))
            .await
            .unwrap();

        let entry = broker.registry_get("w1").await.unwrap().unwrap();
        assert!(!entry.is_expired(Utc::now()));
        assert!(entry.is_expired(Utc::now() + chrono::Duration::seconds(31)));
    }

    #[tokio::test]
    async fn registry_load_saturates_at_zero() {
        let broker = MemoryBroker::new();
        broker
            .heartbeat_upsert(WorkerInfo::new("w1", "host-a", 4), Duration::from_secs(30))
            .await
            .unwrap();

        broker.registry_adjust_load("w1", 2).await.unwrap();
        broker.registry_adjust_load("w1", -5).await.unwrap();

        let entry = broker.registry_get("w1").await.unwrap().unwrap();
        assert_eq!(entry.info.current_load, 0);
    }

    #[tokio::test]
    async fn completion_stream_cursor_resumes() {
        let broker = MemoryBroker::new();
        for i in 0..5 {
            broker
                .publish_event(QueueEvent::WorkerDied {
                    worker_id: format!("w{i}"),
                    at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let (first, cursor) = broker.consume_events(0, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(cursor, 3);

        let (rest, cursor) = broker.consume_events(cursor, 10).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(cursor, 5);

        let (empty, cursor) = broker.consume_events(cursor, 10).await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(cursor, 5);
    }

    #[tokio::test]
    async fn rate_counter_enforces_window_limit() {
        let broker = MemoryBroker::new();
        let window = Duration::from_secs(60);

        assert!(broker.check_rate("submit:echo", 2, window).await.unwrap());
        assert!(broker.check_rate("submit:echo", 2, window).await.unwrap());
        assert!(!broker.check_rate("submit:echo", 2, window).await.unwrap());
        // A different key has its own window.
        assert!(broker.check_rate("submit:other", 2, window).await.unwrap());
    }
}
