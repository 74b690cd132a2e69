//! Activity abstractions
//!
//! Activities are the side-effecting units of work a workflow schedules. They:
//! - Run on the worker pool, outside the replay path
//! - Run at least once, so implementations must be idempotent
//! - May fail and be retried according to the retry policy
//! - Observe cancellation when their workflow instance is terminated

mod context;
mod definition;
mod registry;

pub use context::{ActivityContext, CancellationHandle, HeartbeatError};
pub use definition::{Activity, ActivityError};
pub use registry::{ActivityRegistry, AnyActivity};
