//! Workflow execution engine
//!
//! - [`replay`] re-runs a workflow state machine against its recorded history
//! - [`WorkflowExecutor`] owns every history write and advances instances
//! - [`TimerService`] turns due timers into work items
//! - [`DurableRuntime`] runs all of it, plus the activity worker pool

mod executor;
mod registry;
mod replay;
mod runtime;
mod timers;

pub use executor::{
    AdvanceResult, ExecutorConfig, ExecutorError, WorkItem, WorkflowExecutor, TERMINATED,
};
pub use registry::{AnyWorkflow, RegistryError, WorkflowFactory, WorkflowRegistry};
pub use replay::{
    replay, PendingActivity, PendingTimer, ReplayError, ReplayOutcome, Terminal,
};
pub use runtime::{DurableRuntime, DurableRuntimeBuilder, RuntimeConfig, RuntimeError};
pub use timers::{TimerCommand, TimerService};
