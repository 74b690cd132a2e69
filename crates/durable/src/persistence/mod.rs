//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`HistoryStore`] trait for history, instance snapshot and task queue persistence
//! - [`InMemoryHistoryStore`] for tests and single-process deployments
//! - [`PostgresHistoryStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryHistoryStore;
pub use postgres::PostgresHistoryStore;
pub use store::{
    ActivityTask, HistoryStore, StoreError, TaskDefinition, TaskStatus, WorkflowInstance,
    WorkflowStatus,
};
