//! Queue configuration: every tunable with its default.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Number of priority levels. Priorities are `1..=10`, 10 highest.
pub const PRIORITY_LEVELS: u8 = 10;

/// Lowest valid task priority.
pub const PRIORITY_MIN: i32 = 1;

/// Highest valid task priority.
pub const PRIORITY_MAX: i32 = 10;

/// Coordinator-wide configuration.
///
/// Deserializable from the `[queue]` section of the config file; every
/// field has a default so a missing section means defaults throughout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How often workers are expected to heartbeat.
    pub heartbeat_interval_secs: u64,
    /// Silence after which a worker is declared dead.
    pub dead_after_secs: u64,
    /// Liveness monitor tick interval.
    pub liveness_tick_secs: u64,
    /// Scheduler tick interval.
    pub scheduler_tick_secs: u64,
    /// Default backoff base for tasks that do not specify one.
    pub retry_base_delay_secs: i32,
    /// Upper bound on any computed retry delay.
    pub retry_cap_secs: i32,
    /// Default retry budget for tasks that do not specify one.
    pub max_retries: i32,
    /// Orphan-reassignment budget before a task is parked as poison.
    pub max_orphan_reassignments: i32,
    /// Default per-task execution timeout.
    pub default_timeout_secs: i32,
    /// Dead-letter entries older than this are eligible for removal.
    pub dlq_retention_days: i64,
    /// How long a worker's acquire call may block on an empty queue.
    pub broker_dequeue_timeout_secs: u64,
    /// Window for in-place infrastructure retries at boot.
    pub startup_grace_secs: u64,
    /// Window for in-place infrastructure retries at steady state.
    pub runtime_grace_secs: u64,
    /// Optional per-task-name submission caps (submissions per minute).
    pub rate_limits: HashMap<String, u32>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            dead_after_secs: 30,
            liveness_tick_secs: 10,
            scheduler_tick_secs: 5,
            retry_base_delay_secs: 1,
            retry_cap_secs: 300,
            max_retries: 3,
            max_orphan_reassignments: 3,
            default_timeout_secs: 300,
            dlq_retention_days: 30,
            broker_dequeue_timeout_secs: 2,
            startup_grace_secs: 60,
            runtime_grace_secs: 10,
            rate_limits: HashMap::new(),
        }
    }
}

impl QueueConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn dead_after(&self) -> Duration {
        Duration::from_secs(self.dead_after_secs)
    }

    pub fn liveness_tick(&self) -> Duration {
        Duration::from_secs(self.liveness_tick_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
    }

    pub fn broker_dequeue_timeout(&self) -> Duration {
        Duration::from_secs(self.broker_dequeue_timeout_secs)
    }

    /// Registry TTL: three missed heartbeats.
    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs * 3)
    }
}
