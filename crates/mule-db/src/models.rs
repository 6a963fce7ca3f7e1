use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Dead,
}

impl TaskStatus {
    /// Terminal states: nothing ever transitions out of these.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Dead | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            "dead" => Ok(Self::Dead),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Combining mode for a task's wait-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    /// Eligible when every predecessor completed.
    All,
    /// Eligible when at least one predecessor completed.
    Any,
}

impl fmt::Display for WaitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::All => "all",
            Self::Any => "any",
        };
        f.write_str(s)
    }
}

impl FromStr for WaitMode {
    type Err = WaitModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "any" => Ok(Self::Any),
            other => Err(WaitModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WaitMode`] string.
#[derive(Debug, Clone)]
pub struct WaitModeParseError(pub String);

impl fmt::Display for WaitModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid wait mode: {:?}", self.0)
    }
}

impl std::error::Error for WaitModeParseError {}

// ---------------------------------------------------------------------------

/// Terminal status of one execution attempt.
///
/// `Orphaned` marks an attempt whose worker died before reporting; it does
/// not consume retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Timeout,
    Orphaned,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Orphaned => "orphaned",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = ExecutionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "orphaned" => Ok(Self::Orphaned),
            other => Err(ExecutionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionStatus`] string.
#[derive(Debug, Clone)]
pub struct ExecutionStatusParseError(pub String);

impl fmt::Display for ExecutionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution status: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- the unit of work submitted to the queue.
///
/// `args`/`kwargs` hold serialized payload envelopes; the store never
/// inspects their contents.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub task_name: String,
    pub args: serde_json::Value,
    pub kwargs: serde_json::Value,
    pub priority: i32,
    pub status: TaskStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub retry_base_delay_secs: i32,
    pub timeout_secs: i32,
    /// The submitter's requested start time, if any. Never mutated.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// The effective next-eligible time: `scheduled_at` at insert, then the
    /// backoff deadline on each retry. `None` for tasks gated only by
    /// dependencies.
    pub ready_at: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    pub parent_task_id: Option<Uuid>,
    pub worker_id: Option<String>,
    pub cancel_requested: bool,
    pub orphan_reassignments: i32,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Final outcome of a task, one-to-one with the task row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub result_data: Option<serde_json::Value>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub traceback: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// One execution attempt of a task. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskExecution {
    pub id: i64,
    pub task_id: Uuid,
    pub attempt_number: i32,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: Option<ExecutionStatus>,
    pub error_message: Option<String>,
}

/// An edge in the dependency graph: `successor` waits on `predecessor`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDependency {
    pub predecessor: Uuid,
    pub successor: Uuid,
    pub mode: WaitMode,
}

/// A dead-letter entry: snapshot of a task at the moment of permanent
/// failure.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DlqEntry {
    pub id: Uuid,
    pub task_id: Uuid,
    pub task_name: String,
    pub snapshot: serde_json::Value,
    pub failure_reason: String,
    pub error_message: Option<String>,
    pub total_attempts: i32,
    pub moved_at: DateTime<Utc>,
    pub requeued_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
