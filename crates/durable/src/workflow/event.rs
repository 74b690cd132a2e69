//! History events for persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ActivityOptions, Awaitable, ExternalEvent, WorkflowError};
use crate::activity::ActivityError;

/// Events stored in a workflow instance's history
///
/// These events form the append-only log for an instance. They are used for:
/// - Persisting workflow progress
/// - Replaying workflows after recovery
/// - Auditing and debugging
///
/// Events fall into two groups. *Decision* events record something the
/// workflow (or the engine on its behalf) decided: they are matched against the
/// workflow's actions during replay. *Input* events record something that
/// happened to the instance (an activity finished, a timer fired, an event was
/// raised): they are fed back into the workflow during replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    // =========================================================================
    // Lifecycle
    // =========================================================================
    /// First event of every history
    OrchestratorStarted {
        /// Registered workflow type
        workflow_type: String,

        /// The input provided when scheduling the workflow
        input: serde_json::Value,
    },

    /// Workflow completed successfully
    ExecutionCompleted {
        /// The result value
        result: serde_json::Value,
    },

    /// Workflow failed, either by its own decision or through an orchestration fault
    ExecutionFailed {
        /// Error details
        error: WorkflowError,
    },

    /// Workflow was terminated from outside
    ExecutionTerminated {
        /// Reason given by the caller
        reason: String,
    },

    // =========================================================================
    // Activities
    // =========================================================================
    /// Activity was scheduled for execution
    TaskScheduled {
        /// Unique activity identifier within the workflow
        activity_id: String,

        /// Type of activity to execute
        activity_type: String,

        /// Input for the activity
        input: serde_json::Value,

        /// Execution options
        options: ActivityOptions,
    },

    /// Activity completed successfully
    TaskCompleted {
        /// Activity identifier
        activity_id: String,

        /// Task that produced the result
        task_id: Uuid,

        /// Result returned by the activity
        result: serde_json::Value,
    },

    /// Activity attempt failed (may or may not retry)
    TaskFailed {
        /// Activity identifier
        activity_id: String,

        /// Task that failed
        task_id: Uuid,

        /// Attempt number that failed (1-based)
        attempt: u32,

        /// Error details
        error: ActivityError,

        /// Whether the activity will be retried
        will_retry: bool,
    },

    // =========================================================================
    // Timers
    // =========================================================================
    /// Timer was created
    TimerCreated {
        /// Timer identifier
        timer_id: String,

        /// Requested duration in milliseconds
        duration_ms: u64,

        /// Absolute fire time, fixed when the timer was first recorded
        fire_at: DateTime<Utc>,
    },

    /// Timer fired
    TimerFired {
        /// Timer identifier
        timer_id: String,
    },

    /// Timer was cancelled before firing
    TimerCancelled {
        /// Timer identifier
        timer_id: String,
    },

    // =========================================================================
    // External events
    // =========================================================================
    /// Workflow started waiting for an external event
    EventWaitStarted {
        /// Wait identifier
        wait_id: String,

        /// Event name
        event_name: String,
    },

    /// Workflow stopped waiting for an external event
    EventWaitCancelled {
        /// Wait identifier
        wait_id: String,
    },

    /// External event was raised against the instance
    ExternalEventRaised {
        /// The event that was raised
        event: ExternalEvent,
    },

    // =========================================================================
    // Races
    // =========================================================================
    /// Workflow started a first-of-N race
    RaceStarted {
        /// Race identifier
        race_id: String,

        /// Race members
        members: Vec<Awaitable>,
    },

    /// Winner of a race, recorded so replay always picks the same member
    RaceResolved {
        /// Race identifier
        race_id: String,

        /// Winning member
        winner: Awaitable,
    },
}

impl HistoryEvent {
    /// Stable event type name (used as a column value by SQL stores)
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::OrchestratorStarted { .. } => "orchestrator_started",
            Self::ExecutionCompleted { .. } => "execution_completed",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::ExecutionTerminated { .. } => "execution_terminated",
            Self::TaskScheduled { .. } => "task_scheduled",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TimerCreated { .. } => "timer_created",
            Self::TimerFired { .. } => "timer_fired",
            Self::TimerCancelled { .. } => "timer_cancelled",
            Self::EventWaitStarted { .. } => "event_wait_started",
            Self::EventWaitCancelled { .. } => "event_wait_cancelled",
            Self::ExternalEventRaised { .. } => "external_event_raised",
            Self::RaceStarted { .. } => "race_started",
            Self::RaceResolved { .. } => "race_resolved",
        }
    }

    /// Whether this event records a decision that replay must reproduce
    pub fn is_decision(&self) -> bool {
        matches!(
            self,
            Self::TaskScheduled { .. }
                | Self::TimerCreated { .. }
                | Self::TimerCancelled { .. }
                | Self::EventWaitStarted { .. }
                | Self::EventWaitCancelled { .. }
                | Self::RaceStarted { .. }
                | Self::RaceResolved { .. }
                | Self::ExecutionCompleted { .. }
                | Self::ExecutionFailed { .. }
        )
    }

    /// Get the activity_id if this is an activity-related event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::TaskScheduled { activity_id, .. }
            | Self::TaskCompleted { activity_id, .. }
            | Self::TaskFailed { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Whether this event finishes the activity it refers to
    pub fn closes_activity(&self) -> bool {
        matches!(
            self,
            Self::TaskCompleted { .. }
                | Self::TaskFailed {
                    will_retry: false,
                    ..
                }
        )
    }

    /// Check if this is a terminal workflow event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ExecutionCompleted { .. }
                | Self::ExecutionFailed { .. }
                | Self::ExecutionTerminated { .. }
        )
    }
}

/// A history event as stored, with its position in the log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    /// Zero-based position in the instance history
    pub sequence: i64,

    /// When the event was appended
    pub recorded_at: DateTime<Utc>,

    /// The event itself
    pub event: HistoryEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_history_event_serialization() {
        let event = HistoryEvent::OrchestratorStarted {
            workflow_type: "support".to_string(),
            input: json!({"ticket_id": "T1"}),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"orchestrator_started\""));

        let parsed: HistoryEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_type_name_matches_serde_tag() {
        let event = HistoryEvent::RaceResolved {
            race_id: "approval".to_string(),
            winner: Awaitable::event("approved"),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.type_name());
    }

    #[test]
    fn test_activity_id_extraction() {
        let event = HistoryEvent::TaskCompleted {
            activity_id: "my-activity".to_string(),
            task_id: Uuid::now_v7(),
            result: json!(1),
        };

        assert_eq!(event.activity_id(), Some("my-activity"));
        assert!(event.closes_activity());

        let timer = HistoryEvent::TimerFired {
            timer_id: "t".to_string(),
        };
        assert_eq!(timer.activity_id(), None);
    }

    #[test]
    fn test_retrying_failure_does_not_close_activity() {
        let event = HistoryEvent::TaskFailed {
            activity_id: "a".to_string(),
            task_id: Uuid::now_v7(),
            attempt: 1,
            error: ActivityError::retryable("boom"),
            will_retry: true,
        };

        assert!(!event.closes_activity());
        assert!(!event.is_decision());
    }

    #[test]
    fn test_is_terminal() {
        assert!(HistoryEvent::ExecutionCompleted { result: json!({}) }.is_terminal());
        assert!(HistoryEvent::ExecutionFailed {
            error: WorkflowError::new("error")
        }
        .is_terminal());
        assert!(HistoryEvent::ExecutionTerminated {
            reason: "operator".to_string()
        }
        .is_terminal());

        assert!(!HistoryEvent::TimerFired {
            timer_id: "x".to_string()
        }
        .is_terminal());
    }
}
