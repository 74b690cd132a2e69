//! Workflow trait definition

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{Awaitable, ExternalEvent, WorkflowAction};
use crate::activity::ActivityError;

/// Error code recorded when the engine faults an instance during replay
pub const ORCHESTRATION_FAULT: &str = "ORCHESTRATION_FAULT";

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Create the error recorded for an orchestration fault
    pub fn fault(message: impl Into<String>) -> Self {
        Self::new(message).with_code(ORCHESTRATION_FAULT)
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Whether this error was produced by the engine rather than workflow logic
    pub fn is_fault(&self) -> bool {
        self.code.as_deref() == Some(ORCHESTRATION_FAULT)
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// How an awaited primitive resolved
///
/// Passed to [`Workflow::on_race_resolved`] for the winning member of a race.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resolution {
    ActivityCompleted {
        activity_id: String,
        result: serde_json::Value,
    },
    ActivityFailed {
        activity_id: String,
        error: ActivityError,
    },
    TimerFired {
        timer_id: String,
    },
    EventReceived {
        wait_id: String,
        event: ExternalEvent,
    },
}

impl Resolution {
    /// The handle that resolved
    pub fn awaitable(&self) -> Awaitable {
        match self {
            Self::ActivityCompleted { activity_id, .. } | Self::ActivityFailed { activity_id, .. } => {
                Awaitable::Activity(activity_id.clone())
            }
            Self::TimerFired { timer_id } => Awaitable::Timer(timer_id.clone()),
            Self::EventReceived { wait_id, .. } => Awaitable::Event(wait_id.clone()),
        }
    }
}

/// A workflow is a deterministic state machine driven by history
///
/// Workflows are the core abstraction for durable execution. They define:
/// - How to start execution (`on_start`)
/// - How to handle activity completions (`on_activity_completed`, `on_activity_failed`)
/// - How to handle timers (`on_timer_fired`)
/// - How to handle external events (`on_event`)
/// - How to handle the winner of a race (`on_race_resolved`)
///
/// # Determinism
///
/// Workflows must be deterministic - given the same sequence of callbacks, they
/// must produce the same sequence of actions. No randomness, clock reads or I/O
/// inside callbacks; push that work into activities. The engine rebuilds a
/// workflow from its input on every advance and replays the recorded history
/// through these callbacks.
///
/// # Example
///
/// ```ignore
/// use agentflow_durable::prelude::*;
///
/// struct OrderWorkflow {
///     order_id: String,
/// }
///
/// impl Workflow for OrderWorkflow {
///     const TYPE: &'static str = "order_workflow";
///     type Input = OrderInput;
///
///     fn new(input: Self::Input) -> Self {
///         Self { order_id: input.order_id }
///     }
///
///     fn on_start(&mut self) -> Vec<WorkflowAction> {
///         vec![WorkflowAction::schedule_activity(
///             "validate",
///             "validate_order",
///             json!({ "order_id": self.order_id }),
///         )]
///     }
///
///     // ... implement the activity callbacks
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier for this workflow
    ///
    /// This is used to look up the workflow in the registry during replay.
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send + Clone;

    /// Create a new workflow instance from input
    ///
    /// This is called both when starting a new workflow and when replaying.
    fn new(input: Self::Input) -> Self;

    /// Called once at the start of every replay
    fn on_start(&mut self) -> Vec<WorkflowAction>;

    /// Called when an activity completes successfully
    fn on_activity_completed(
        &mut self,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction>;

    /// Called when an activity fails (after all retries exhausted)
    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction>;

    /// Called when a timer fires
    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction> {
        let _ = timer_id;
        vec![]
    }

    /// Called when an external event resolves one of the workflow's waits
    fn on_event(&mut self, wait_id: &str, event: &ExternalEvent) -> Vec<WorkflowAction> {
        let _ = (wait_id, event);
        vec![]
    }

    /// Called when the first member of a race resolves
    ///
    /// The winner is delivered here instead of its individual callback. Losing
    /// timers are cancelled by the engine; losing activities and event waits stay
    /// pending and later resolve through their individual callbacks.
    fn on_race_resolved(&mut self, race_id: &str, winner: &Resolution) -> Vec<WorkflowAction> {
        let _ = (race_id, winner);
        vec![]
    }
}
