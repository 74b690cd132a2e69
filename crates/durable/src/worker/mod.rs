//! Worker pool for activity execution
//!
//! This module provides:
//! - [`WorkerPool`] - Claims activity tasks and runs them with bounded concurrency
//! - [`TaskPoller`] - Task polling with exponential backoff and wakeups
//! - [`ActiveTasks`] - Cancellation handles of running attempts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │ TaskPoller  │  │  Heartbeat  │  │  Stale Reclaimer    │  │
//! │  │  (polling)  │  │  forwarder  │  │     (30s)           │  │
//! │  └──────┬──────┘  └──────▲──────┘  └─────────────────────┘  │
//! │         │                │                                  │
//! │         ▼                │                                  │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │       Activity attempts (Semaphore-limited)         │    │
//! │  │  [Task 1] [Task 2] [Task 3] ... [Task N]            │    │
//! │  └──────────────────────┬──────────────────────────────┘    │
//! └─────────────────────────┼───────────────────────────────────┘
//!                           ▼
//!                   WorkflowExecutor
//!          (records results, advances instances)
//! ```

mod active;
mod poller;
mod pool;

pub use active::ActiveTasks;
pub use poller::{PollerConfig, PollerError, TaskPoller, Wakeup};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
