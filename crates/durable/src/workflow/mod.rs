//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining workflow state machines
//! - [`WorkflowAction`] enum for workflow decisions
//! - [`HistoryEvent`] enum for persisted history
//! - [`ExternalEvent`] for external communication

mod action;
mod definition;
mod event;
mod external;

pub(crate) use action::duration_serde;
pub use action::{ActivityOptions, Awaitable, WorkflowAction};
pub use definition::{Resolution, Workflow, WorkflowError, ORCHESTRATION_FAULT};
pub use event::{HistoryEvent, HistoryRecord};
pub use external::ExternalEvent;
