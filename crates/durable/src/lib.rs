//! # Durable Execution Engine
//!
//! Replay-based workflow orchestration for agent applications.
//!
//! ## Features
//!
//! - **Event-sourced workflows**: every decision and every result is an event in
//!   an append-only history; replaying it rebuilds workflow state after a crash
//! - **Activities**: side effects run by a worker pool with retries, exponential
//!   backoff and start-to-close timeouts; delivery is at least once
//! - **Timers, external events and races**: durable timers, FIFO-buffered
//!   external events and a first-of-N combinator over them
//! - **Stores**: in-memory for tests, PostgreSQL for production
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowClient                         │
//! │   (schedule, raise events, status, wait, terminate)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          WorkflowExecutor  ◄──  TimerService                │
//! │  (replays history, records decisions, per-instance lock)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       HistoryStore                          │
//! │  (instances, append-only history, activity task queue)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                            │
//! │  (claims tasks, runs activities, reports results)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use agentflow_durable::prelude::*;
//!
//! struct GreetingWorkflow {
//!     name: String,
//! }
//!
//! impl Workflow for GreetingWorkflow {
//!     const TYPE: &'static str = "greeting";
//!     type Input = String;
//!
//!     fn new(name: String) -> Self {
//!         Self { name }
//!     }
//!
//!     fn on_start(&mut self) -> Vec<WorkflowAction> {
//!         vec![WorkflowAction::schedule_activity("greet", "greet", json!(self.name))]
//!     }
//!
//!     fn on_activity_completed(&mut self, _id: &str, result: Value) -> Vec<WorkflowAction> {
//!         vec![WorkflowAction::complete(result)]
//!     }
//!
//!     fn on_activity_failed(&mut self, _id: &str, error: &ActivityError) -> Vec<WorkflowAction> {
//!         vec![WorkflowAction::fail(WorkflowError::new(&error.message))]
//!     }
//! }
//!
//! let runtime = DurableRuntime::builder(Arc::new(InMemoryHistoryStore::new()))
//!     .register_workflow::<GreetingWorkflow>()
//!     .register_activity(Greet)
//!     .start()
//!     .await?;
//! let client = runtime.client();
//! let id = client.schedule::<GreetingWorkflow>("Ada".into(), None).await?;
//! let instance = client.wait_for_completion(&id, Duration::from_secs(5)).await?;
//! ```

pub mod activity;
pub mod client;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
    pub use crate::client::{ClientError, WorkflowClient};
    pub use crate::engine::{DurableRuntime, RuntimeConfig, RuntimeError};
    pub use crate::persistence::{
        HistoryStore, InMemoryHistoryStore, PostgresHistoryStore, StoreError, WorkflowInstance,
        WorkflowStatus,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::WorkerPoolConfig;
    pub use crate::workflow::{
        ActivityOptions, Awaitable, ExternalEvent, Resolution, Workflow, WorkflowAction,
        WorkflowError,
    };
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
pub use client::{ClientError, WorkflowClient};
pub use engine::{
    DurableRuntime, ExecutorConfig, ExecutorError, RuntimeConfig, RuntimeError, WorkflowExecutor,
    WorkflowRegistry,
};
pub use persistence::{
    HistoryStore, InMemoryHistoryStore, PostgresHistoryStore, StoreError, WorkflowInstance,
    WorkflowStatus,
};
pub use reliability::{RetryDecision, RetryPolicy};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use workflow::{
    ActivityOptions, Awaitable, ExternalEvent, HistoryEvent, HistoryRecord, Resolution, Workflow,
    WorkflowAction, WorkflowError,
};
