//! Workflow actions, awaitable handles and activity options

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::WorkflowError;
use crate::reliability::RetryPolicy;

/// Handle to something a workflow can wait on
///
/// Handles reference primitives the workflow started earlier (or in the same
/// batch of actions) by their workflow-scoped identifiers. They are the
/// members of a [`WorkflowAction::WaitForAny`] race.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Awaitable {
    /// An activity, by activity id
    Activity(String),

    /// A durable timer, by timer id
    Timer(String),

    /// An external event wait, by wait id
    Event(String),
}

impl Awaitable {
    pub fn activity(activity_id: impl Into<String>) -> Self {
        Self::Activity(activity_id.into())
    }

    pub fn timer(timer_id: impl Into<String>) -> Self {
        Self::Timer(timer_id.into())
    }

    pub fn event(wait_id: impl Into<String>) -> Self {
        Self::Event(wait_id.into())
    }

    /// The workflow-scoped identifier of the referenced primitive
    pub fn id(&self) -> &str {
        match self {
            Self::Activity(id) | Self::Timer(id) | Self::Event(id) => id,
        }
    }
}

impl std::fmt::Display for Awaitable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Activity(id) => write!(f, "activity:{id}"),
            Self::Timer(id) => write!(f, "timer:{id}"),
            Self::Event(id) => write!(f, "event:{id}"),
        }
    }
}

/// Actions a workflow can request
///
/// These are the commands a workflow issues from its callbacks. Each action is
/// a decision point: the first time it is produced it is recorded as a
/// [`HistoryEvent`](super::HistoryEvent) and dispatched; on replay the recorded
/// event is matched against the action produced at the same position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Schedule an activity for execution
    ScheduleActivity {
        /// Unique identifier for this activity within the workflow
        activity_id: String,

        /// Type of activity to execute (used to look up in registry)
        activity_type: String,

        /// Input data for the activity (JSON)
        input: serde_json::Value,

        /// Execution options (retries, timeouts)
        options: ActivityOptions,
    },

    /// Start a timer that fires after the specified duration
    ///
    /// The absolute fire time is fixed when the timer is first recorded.
    StartTimer {
        /// Unique identifier for this timer within the workflow
        timer_id: String,

        /// Duration to wait before firing
        #[serde(with = "duration_serde")]
        duration: Duration,
    },

    /// Start a timer that fires at an absolute time
    ///
    /// The fire time is recorded as given. A time in the past fires on the
    /// next timer check.
    StartTimerAt {
        /// Unique identifier for this timer within the workflow
        timer_id: String,

        /// When the timer fires
        fire_at: DateTime<Utc>,
    },

    /// Wait for an external event with the given name
    WaitForEvent {
        /// Unique identifier for this wait within the workflow
        wait_id: String,

        /// Name of the external event
        event_name: String,
    },

    /// Race the given handles; the first to resolve wins
    WaitForAny {
        /// Unique identifier for this race within the workflow
        race_id: String,

        /// Members of the race
        members: Vec<Awaitable>,
    },

    /// Cancel a pending timer
    CancelTimer {
        /// ID of the timer to cancel
        timer_id: String,
    },

    /// Stop waiting for an external event
    CancelEventWait {
        /// ID of the wait to cancel
        wait_id: String,
    },

    /// Complete the workflow successfully with a result
    CompleteWorkflow {
        /// Result value (JSON)
        result: serde_json::Value,
    },

    /// Fail the workflow with an error
    FailWorkflow {
        /// Error details
        error: WorkflowError,
    },
}

impl WorkflowAction {
    /// Create a schedule activity action with default options
    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options: ActivityOptions::default(),
        }
    }

    /// Create a schedule activity action with explicit options
    pub fn schedule_activity_with(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options,
        }
    }

    /// Create a timer action
    pub fn timer(timer_id: impl Into<String>, duration: Duration) -> Self {
        Self::StartTimer {
            timer_id: timer_id.into(),
            duration,
        }
    }

    /// Create a timer action firing at `fire_at`
    pub fn timer_at(timer_id: impl Into<String>, fire_at: DateTime<Utc>) -> Self {
        Self::StartTimerAt {
            timer_id: timer_id.into(),
            fire_at,
        }
    }

    /// Create an external event wait action
    pub fn wait_for_event(wait_id: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self::WaitForEvent {
            wait_id: wait_id.into(),
            event_name: event_name.into(),
        }
    }

    /// Create a race over the given handles
    pub fn wait_for_any(race_id: impl Into<String>, members: Vec<Awaitable>) -> Self {
        Self::WaitForAny {
            race_id: race_id.into(),
            members,
        }
    }

    /// Create a timer cancellation action
    pub fn cancel_timer(timer_id: impl Into<String>) -> Self {
        Self::CancelTimer {
            timer_id: timer_id.into(),
        }
    }

    /// Create an event wait cancellation action
    pub fn cancel_event_wait(wait_id: impl Into<String>) -> Self {
        Self::CancelEventWait {
            wait_id: wait_id.into(),
        }
    }

    /// Create a complete workflow action
    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    /// Create a fail workflow action
    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }
}

/// Options for activity execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Retry policy for this activity
    pub retry_policy: RetryPolicy,

    /// Maximum time for a single attempt (from start to completion)
    #[serde(with = "duration_serde")]
    pub start_to_close_timeout: Duration,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            start_to_close_timeout: Duration::from_secs(300),
        }
    }
}

impl ActivityOptions {
    /// Create options with a specific retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the start-to-close timeout
    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }
}

/// Serde support for Duration (as milliseconds)
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
