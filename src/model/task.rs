//! Task model and its lifecycle rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work tracked by the scheduling core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// What kind of work this is. Opaque to the core.
    pub task_type: String,

    /// Arbitrary parameters for the worker. The core doesn't interpret these.
    pub payload: serde_json::Value,

    pub priority: Priority,

    /// Maximum time a task may stay assigned before it is considered dead.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Number of timeouts suffered so far.
    pub retry_count: u32,
    pub max_retries: u32,

    /// Capabilities a worker must declare to receive this task. Only
    /// consulted when capability matching is enabled.
    pub required_capabilities: Vec<String>,

    pub status: TaskStatus,
    pub assigned_worker: Option<String>,

    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Opaque result reported by the worker on completion.
    pub result: Option<serde_json::Value>,
    /// Last failure reason (worker report or timeout).
    pub error: Option<String>,

    /// Monotonic record version for optimistic concurrency.
    pub version: u64,
}

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(TaskId)
            .map_err(|e| Error::InvalidOperation(format!("bad task id {s:?}: {e}")))
    }
}

/// What happened to a task whose timeout expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Back to pending with its original priority and creation time.
    Requeued { retry_count: u32 },
    /// Retries exhausted; permanently failed.
    Exhausted { retry_count: u32 },
}

impl Task {
    /// Is this task holding a worker slot?
    pub fn is_in_flight(&self) -> bool {
        self.status.is_in_flight()
    }

    /// Has the task been assigned for longer than its timeout?
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if !self.is_in_flight() {
            return false;
        }
        let Some(assigned_at) = self.assigned_at else {
            return false;
        };
        match (now - assigned_at).to_std() {
            Ok(elapsed) => elapsed > self.timeout,
            // assigned in the future relative to this clock
            Err(_) => false,
        }
    }

    /// Pending → Assigned.
    pub fn assign(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.check(TaskStatus::Assigned)?;
        self.status = TaskStatus::Assigned;
        self.assigned_worker = Some(worker_id.to_string());
        self.assigned_at = Some(now);
        Ok(())
    }

    /// Assigned → InProgress. Only the assigned worker may start the task.
    pub fn start(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.check(TaskStatus::InProgress)?;
        if self.assigned_worker.as_deref() != Some(worker_id) {
            return Err(Error::InvalidOperation(format!(
                "task {} is not assigned to worker {worker_id}",
                self.id
            )));
        }
        self.status = TaskStatus::InProgress;
        self.started_at = Some(now);
        Ok(())
    }

    /// Assigned/InProgress → Completed.
    pub fn complete(&mut self, result: serde_json::Value, now: DateTime<Utc>) -> Result<()> {
        self.check(TaskStatus::Completed)?;
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(now);
        Ok(())
    }

    /// Assigned/InProgress → Failed, as reported by the worker.
    pub fn fail(&mut self, error: &str, now: DateTime<Utc>) -> Result<()> {
        self.check(TaskStatus::Failed)?;
        self.status = TaskStatus::Failed;
        self.error = Some(error.to_string());
        self.completed_at = Some(now);
        Ok(())
    }

    /// Administrative cancel from any non-terminal state.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.check(TaskStatus::Cancelled)?;
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Timeout expiry: count the failure, then either requeue or give up.
    ///
    /// A requeued task keeps its original `priority` and `created_at`, so it
    /// re-enters the dispatch queue ahead of same-priority tasks created
    /// after it.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<Expiry> {
        if !self.is_in_flight() {
            return Err(Error::invalid_state(self.status, TaskStatus::Failed));
        }
        self.retry_count += 1;
        self.error = Some(format!(
            "timed out after {}s (attempt {})",
            self.timeout.as_secs(),
            self.retry_count
        ));

        if self.retry_count < self.max_retries {
            self.status = TaskStatus::Pending;
            self.assigned_worker = None;
            self.assigned_at = None;
            self.started_at = None;
            Ok(Expiry::Requeued {
                retry_count: self.retry_count,
            })
        } else {
            self.status = TaskStatus::Failed;
            self.completed_at = Some(now);
            Ok(Expiry::Exhausted {
                retry_count: self.retry_count,
            })
        }
    }

    fn check(&self, to: TaskStatus) -> Result<()> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(Error::invalid_state(self.status, to))
        }
    }

    /// Position in the dispatch queue.
    pub fn queue_key(&self) -> QueueKey {
        QueueKey {
            priority: self.priority,
            created_at: self.created_at,
            id: self.id,
        }
    }
}

/// Total order of the dispatch queue: priority descending, then creation
/// time ascending, then task id ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub id: TaskId,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 1,
    #[default]
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    pub fn level(self) -> i16 {
        self as i16
    }

    pub fn from_level(level: i16) -> Result<Self> {
        match level {
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Medium),
            3 => Ok(Priority::High),
            4 => Ok(Priority::Critical),
            other => Err(Error::Other(format!("unknown priority level: {other}"))),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" | "1" => Ok(Priority::Low),
            "medium" | "2" => Ok(Priority::Medium),
            "high" | "3" => Ok(Priority::High),
            "critical" | "4" => Ok(Priority::Critical),
            _ => Err(Error::Other(format!("unknown priority: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the dispatch queue.
    Pending,
    /// Handed to a worker, not yet acknowledged.
    Assigned,
    /// Worker acknowledged and is executing.
    InProgress,
    /// Done successfully. Terminal.
    Completed,
    /// Worker-reported failure or retries exhausted. Terminal.
    Failed,
    /// Administratively cancelled. Terminal.
    Cancelled,
}

impl TaskStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Assigned)
                | (Pending, Cancelled)
                | (Assigned, InProgress)
                | (Assigned, Completed)
                | (Assigned, Failed)
                | (Assigned, Pending)   // timeout retry
                | (Assigned, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Pending) // timeout retry
                | (InProgress, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    pub const IN_FLIGHT: [TaskStatus; 2] = [TaskStatus::Assigned, TaskStatus::InProgress];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(Error::Other(format!("unknown task status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for creating new tasks. Unset timeout and retry limit fall back
/// to the scheduler configuration.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub(crate) task_type: String,
    pub(crate) payload: serde_json::Value,
    pub(crate) priority: Priority,
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_retries: Option<u32>,
    pub(crate) required_capabilities: Vec<String>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: serde_json::Value::Null,
            priority: Priority::default(),
            timeout: None,
            max_retries: None,
            required_capabilities: Vec::new(),
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn require(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    /// Materialize a pending task.
    pub fn build(
        self,
        id: TaskId,
        now: DateTime<Utc>,
        default_timeout: Duration,
        default_max_retries: u32,
    ) -> Task {
        Task {
            id,
            task_type: self.task_type,
            payload: self.payload,
            priority: self.priority,
            timeout: self.timeout.unwrap_or(default_timeout),
            retry_count: 0,
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            required_capabilities: self.required_capabilities,
            status: TaskStatus::Pending,
            assigned_worker: None,
            created_at: now,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            version: 0,
        }
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
