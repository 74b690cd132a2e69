//! HistoryStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::workflow::{ActivityOptions, HistoryEvent, HistoryRecord, WorkflowError};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow instance not found
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(String),

    /// An instance with the same id already exists
    #[error("workflow instance already exists: {0}")]
    AlreadyExists(String),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict on {instance_id}: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict {
        instance_id: String,
        expected: i64,
        actual: i64,
    },

    /// Status change that would move an instance backwards
    #[error("invalid status transition for {instance_id}: {from} -> {to}")]
    InvalidTransition {
        instance_id: String,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Workflow instance status
///
/// Statuses only move forward: `Pending` → `Running`/`Waiting` → a terminal
/// status. `Running` and `Waiting` alternate while the workflow makes progress.
/// Terminal statuses never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Instance created, first advance not yet run
    Pending,

    /// Activities are outstanding
    Running,

    /// Suspended on timers or external events only
    Waiting,

    /// Workflow completed successfully
    Completed,

    /// Workflow failed (by its own decision or an orchestration fault)
    Failed,

    /// Workflow was terminated from outside
    Terminated,
}

impl WorkflowStatus {
    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running | Self::Waiting => 1,
            Self::Completed | Self::Failed | Self::Terminated => 2,
        }
    }

    /// Whether moving from `self` to `next` keeps statuses monotonic
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        if self.is_terminal() {
            return *self == next;
        }
        next.rank() >= self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            other => Err(StoreError::Serialization(format!(
                "unknown workflow status: {other}"
            ))),
        }
    }
}

/// Snapshot of a workflow instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstance {
    pub id: String,
    pub workflow_type: String,
    pub input: serde_json::Value,
    pub status: WorkflowStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    /// Number of events in the instance history
    pub history_len: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Task status in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed (possibly not before `available_at`)
    Scheduled,
    /// Claimed by a worker
    Running,
    Completed,
    Failed,
    /// Dropped because the owning instance was terminated
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::Serialization(format!(
                "unknown task status: {other}"
            ))),
        }
    }
}

/// Definition of a task to be enqueued
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub instance_id: String,
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
}

/// An activity task in the queue
#[derive(Debug, Clone)]
pub struct ActivityTask {
    pub id: Uuid,
    pub instance_id: String,
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
    pub status: TaskStatus,
    /// Attempts started so far (incremented on claim)
    pub attempt: u32,
    pub last_error: Option<ActivityError>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Earliest time the task may be claimed
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ActivityTask {
    /// Whether this task is still running under the given claim
    pub fn is_held_by(&self, worker_id: &str, attempt: u32) -> bool {
        self.status == TaskStatus::Running
            && self.claimed_by.as_deref() == Some(worker_id)
            && self.attempt == attempt
    }
}

/// Store for workflow history, instance snapshots and the activity task queue
///
/// Implementations must be thread-safe and support concurrent access. The
/// engine serializes writes per instance; the store still rejects appends with
/// a stale expected sequence.
#[async_trait]
pub trait HistoryStore: Send + Sync + 'static {
    // =========================================================================
    // Instance Operations
    // =========================================================================

    /// Create an instance and record `OrchestratorStarted` as its first event
    ///
    /// Fails with [`StoreError::AlreadyExists`] when the id is taken; the
    /// existing history is left untouched.
    async fn create_instance(
        &self,
        instance_id: &str,
        workflow_type: &str,
        input: serde_json::Value,
    ) -> Result<WorkflowInstance, StoreError>;

    /// Get an instance snapshot
    async fn get_instance(&self, instance_id: &str) -> Result<WorkflowInstance, StoreError>;

    /// List instances, optionally filtered by status
    async fn list_instances(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;

    /// Append events (with optimistic concurrency)
    ///
    /// `expected_sequence` is the current history length. Returns the new length.
    async fn append_events(
        &self,
        instance_id: &str,
        expected_sequence: i64,
        events: Vec<HistoryEvent>,
    ) -> Result<i64, StoreError>;

    /// Load the full history (for replay)
    async fn load_history(&self, instance_id: &str) -> Result<Vec<HistoryRecord>, StoreError>;

    /// Update instance status, output and error
    ///
    /// Rejects backwards moves with [`StoreError::InvalidTransition`]. Setting a
    /// terminal instance to its current status is a no-op.
    async fn update_status(
        &self,
        instance_id: &str,
        status: WorkflowStatus,
        output: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Task Queue Operations
    // =========================================================================

    /// Enqueue an activity task
    ///
    /// Idempotent per `(instance_id, activity_id)`: returns the existing task's
    /// id when one is already queued.
    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError>;

    /// Get a task by id
    async fn get_task(&self, task_id: Uuid) -> Result<ActivityTask, StoreError>;

    /// Claim up to `max_tasks` available tasks for execution
    async fn claim_tasks(
        &self,
        worker_id: &str,
        max_tasks: usize,
    ) -> Result<Vec<ActivityTask>, StoreError>;

    /// Refresh a running task's claim
    ///
    /// Returns `false` when the task is no longer running under this worker.
    async fn heartbeat_task(&self, task_id: Uuid, worker_id: &str) -> Result<bool, StoreError>;

    /// Put a failed attempt back in the queue, claimable from `available_at`
    ///
    /// Like [`complete_task`](Self::complete_task) and
    /// [`fail_task`](Self::fail_task), this only acts on the claim identified
    /// by `worker_id` and `attempt`. A claim that was reclaimed, re-claimed or
    /// closed in the meantime is left as it is.
    async fn retry_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
        error: &ActivityError,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Mark the claimed attempt of a task completed
    async fn complete_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
    ) -> Result<(), StoreError>;

    /// Mark the claimed attempt of a task finally failed
    async fn fail_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
        error: &ActivityError,
    ) -> Result<(), StoreError>;

    /// Cancel the unclaimed tasks of an instance, returning their ids
    async fn cancel_instance_tasks(&self, instance_id: &str) -> Result<Vec<Uuid>, StoreError>;

    /// Return tasks whose claim is older than `stale_threshold` to the queue
    async fn reclaim_stale_tasks(&self, stale_threshold: Duration)
        -> Result<Vec<Uuid>, StoreError>;

    /// List the tasks of an instance
    async fn list_tasks(&self, instance_id: &str) -> Result<Vec<ActivityTask>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_monotonicity() {
        use WorkflowStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Waiting));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Running));
        assert!(Waiting.can_transition_to(Completed));

        assert!(!Running.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Terminated.can_transition_to(Completed));
        assert!(Completed.can_transition_to(Completed));
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            WorkflowStatus::Waiting,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Terminated,
        ] {
            assert_eq!(status.as_str().parse::<WorkflowStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<WorkflowStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&WorkflowStatus::Terminated).unwrap();
        assert_eq!(json, "\"terminated\"");
    }
}
