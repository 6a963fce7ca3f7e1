//! Worker-facing types: registry entries, statuses, and admin operations.
//!
//! Workers are external processes. The coordinator only ever sees their
//! heartbeats; everything here describes that view.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a worker as known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Idle,
    Busy,
    Draining,
    Paused,
    Dead,
}

impl WorkerStatus {
    /// Whether the dispatcher may hand this worker new tasks.
    ///
    /// `Idle`/`Busy` are heartbeat refinements of `Active`; all three are
    /// assignable (capacity is checked separately).
    pub fn is_assignable(self) -> bool {
        matches!(self, Self::Active | Self::Idle | Self::Busy)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Draining => "draining",
            Self::Paused => "paused",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerStatus {
    type Err = WorkerStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "draining" => Ok(Self::Draining),
            "paused" => Ok(Self::Paused),
            "dead" => Ok(Self::Dead),
            other => Err(WorkerStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkerStatus`] string.
#[derive(Debug, Clone)]
pub struct WorkerStatusParseError(pub String);

impl fmt::Display for WorkerStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid worker status: {:?}", self.0)
    }
}

impl std::error::Error for WorkerStatusParseError {}

/// A worker as reported by its heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub hostname: String,
    pub status: WorkerStatus,
    /// Declared maximum concurrent tasks.
    pub capacity: u32,
    /// Tasks the worker currently holds. Advisory; the store is the
    /// authority for which tasks are actually running where.
    pub current_load: u32,
    pub last_heartbeat: DateTime<Utc>,
    /// Opaque worker-supplied metadata.
    pub metadata: serde_json::Value,
}

impl WorkerInfo {
    pub fn new(worker_id: impl Into<String>, hostname: impl Into<String>, capacity: u32) -> Self {
        Self {
            worker_id: worker_id.into(),
            hostname: hostname.into(),
            status: WorkerStatus::Active,
            capacity,
            current_load: 0,
            last_heartbeat: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Whether the worker can take one more task right now.
    pub fn has_capacity(&self) -> bool {
        self.current_load < self.capacity
    }
}

/// Administrative operations on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerAdminOp {
    /// Stop new assignments; in-flight tasks keep running.
    Pause,
    /// Undo a pause or drain.
    Resume,
    /// No new assignments; in-flight tasks complete normally.
    Drain,
    /// Drain, then remove the registry entry.
    Deregister,
}

impl fmt::Display for WorkerAdminOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Drain => "drain",
            Self::Deregister => "deregister",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerAdminOp {
    type Err = WorkerAdminOpParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "drain" => Ok(Self::Drain),
            "deregister" => Ok(Self::Deregister),
            other => Err(WorkerAdminOpParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkerAdminOp`] string.
#[derive(Debug, Clone)]
pub struct WorkerAdminOpParseError(pub String);

impl fmt::Display for WorkerAdminOpParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid worker admin operation: {:?}", self.0)
    }
}

impl std::error::Error for WorkerAdminOpParseError {}
