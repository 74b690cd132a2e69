//! Activity execution context

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Error from heartbeat operations
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// Heartbeat channel closed (the worker stopped tracking this attempt)
    #[error("heartbeat channel closed")]
    ChannelClosed,

    /// The owning workflow instance was terminated
    #[error("activity was cancelled")]
    Cancelled,
}

#[derive(Debug, Default)]
struct CancelState {
    flag: AtomicBool,
    notify: Notify,
}

/// Context provided to activities during execution
///
/// The context provides:
/// - Information about the current execution attempt
/// - Heartbeats, which keep the task's claim fresh during long attempts
/// - Cancellation detection (raised when the owning instance is terminated)
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ActivityContext, input: Input) -> Result<Output, ActivityError> {
///     for chunk in input.chunks {
///         if ctx.is_cancelled() {
///             return Err(ActivityError::non_retryable("cancelled"));
///         }
///
///         process(chunk).await?;
///         ctx.heartbeat().await?;
///     }
///
///     Ok(Output { ... })
/// }
/// ```
#[derive(Debug)]
pub struct ActivityContext {
    /// Task being executed
    pub task_id: Uuid,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed by the retry policy
    pub max_attempts: u32,

    /// Workflow instance that owns this activity
    pub instance_id: String,

    /// Activity ID within the workflow
    pub activity_id: String,

    heartbeat_tx: Option<mpsc::Sender<Uuid>>,

    cancel: Arc<CancelState>,
}

impl ActivityContext {
    /// Create a new activity context
    pub fn new(
        task_id: Uuid,
        instance_id: impl Into<String>,
        activity_id: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            task_id,
            attempt,
            max_attempts,
            instance_id: instance_id.into(),
            activity_id: activity_id.into(),
            heartbeat_tx: None,
            cancel: Arc::new(CancelState::default()),
        }
    }

    /// Create a context that forwards heartbeats to the worker pool
    pub fn with_heartbeat(mut self, tx: mpsc::Sender<Uuid>) -> Self {
        self.heartbeat_tx = Some(tx);
        self
    }

    /// Get a handle that can be used to cancel this activity
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancel: Arc::clone(&self.cancel),
        }
    }

    /// Record a heartbeat
    ///
    /// Refreshes the task's claim so the stale-task reclaimer leaves a long
    /// running attempt alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the activity has been cancelled or the
    /// heartbeat channel is closed.
    pub async fn heartbeat(&self) -> Result<(), HeartbeatError> {
        if self.is_cancelled() {
            return Err(HeartbeatError::Cancelled);
        }

        if let Some(tx) = &self.heartbeat_tx {
            tx.send(self.task_id)
                .await
                .map_err(|_| HeartbeatError::ChannelClosed)?;
        }

        Ok(())
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.flag.load(Ordering::Acquire)
    }

    /// Resolves when cancellation is requested
    ///
    /// Useful in `select!`:
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = do_work() => { ... }
    ///     _ = ctx.cancelled() => {
    ///         return Err(ActivityError::non_retryable("cancelled"));
    ///     }
    /// }
    /// ```
    pub async fn cancelled(&self) {
        loop {
            let notified = self.cancel.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Handle to cancel an activity
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancel: Arc<CancelState>,
}

impl CancellationHandle {
    /// Cancel the activity
    pub fn cancel(&self) {
        self.cancel.flag.store(true, Ordering::Release);
        self.cancel.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.flag.load(Ordering::Acquire)
    }
}
