//! Workflow executor with replay support
//!
//! The `WorkflowExecutor` owns every write to an instance's history:
//! - Advancing instances by replaying history and recording new decisions
//! - Recording activity results, timer firings and external events
//! - Terminating instances
//! - Turning replay failures and panics into recorded orchestration faults
//!
//! All writes for one instance happen under a per-instance lock, so replay for
//! an instance never runs concurrently with itself.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, error, info, instrument, warn};

use crate::activity::ActivityError;
use crate::persistence::{
    ActivityTask, HistoryStore, StoreError, TaskDefinition, WorkflowInstance, WorkflowStatus,
};
use crate::worker::ActiveTasks;
use crate::workflow::{ExternalEvent, HistoryEvent, HistoryRecord, WorkflowError};

use super::registry::{RegistryError, WorkflowRegistry};
use super::replay::{replay, PendingActivity, PendingTimer, ReplayOutcome, Terminal};
use super::timers::TimerCommand;

/// Error code recorded on instances that were terminated from outside
pub const TERMINATED: &str = "TERMINATED";

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Histories longer than this fault the instance
    pub max_history_events: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_history_events: 10_000,
        }
    }
}

/// Errors from executor operations
///
/// Problems with the workflow itself (non-determinism, panics, unknown types
/// in stored instances) are not errors here: they are recorded on the instance
/// as orchestration faults.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Unit of work for the orchestration loop
#[derive(Debug, Clone, PartialEq)]
pub enum WorkItem {
    /// Replay the instance and record whatever it decides next
    Advance { instance_id: String },

    /// A durable timer reached its fire time
    TimerFired {
        instance_id: String,
        timer_id: String,
    },
}

/// Result of advancing an instance
#[derive(Debug, Clone, PartialEq)]
pub struct AdvanceResult {
    /// Status after the advance
    pub status: WorkflowStatus,

    /// Number of new events written
    pub events_appended: usize,
}

/// Workflow executor
///
/// The executor drives workflow state machines by replaying events and
/// recording the decisions they make. It uses optimistic concurrency in the
/// store on top of the per-instance lock.
///
/// # Example
///
/// ```ignore
/// let mut registry = WorkflowRegistry::new();
/// registry.register::<MyWorkflow>();
///
/// let executor = WorkflowExecutor::new(store, Arc::new(registry), ExecutorConfig::default());
/// executor.create_instance("order-1", MyWorkflow::TYPE, input).await?;
/// executor.advance("order-1").await?;
/// ```
pub struct WorkflowExecutor {
    store: Arc<dyn HistoryStore>,
    registry: Arc<WorkflowRegistry>,
    config: ExecutorConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
    timer_tx: Option<mpsc::UnboundedSender<TimerCommand>>,
    task_notify: Arc<Notify>,
    active: Arc<ActiveTasks>,
    status_tx: watch::Sender<u64>,
}

impl WorkflowExecutor {
    /// Create a new executor
    pub fn new(
        store: Arc<dyn HistoryStore>,
        registry: Arc<WorkflowRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(0);
        Self {
            store,
            registry,
            config,
            locks: DashMap::new(),
            timer_tx: None,
            task_notify: Arc::new(Notify::new()),
            active: Arc::new(ActiveTasks::new()),
            status_tx,
        }
    }

    /// Register pending timers with a timer service
    pub fn with_timer_service(mut self, timer_tx: mpsc::UnboundedSender<TimerCommand>) -> Self {
        self.timer_tx = Some(timer_tx);
        self
    }

    /// Get a reference to the store
    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    /// Get a reference to the workflow registry
    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Notified whenever new activity tasks are enqueued
    pub fn task_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.task_notify)
    }

    /// Cancellation handles of running activity attempts
    pub fn active_tasks(&self) -> Arc<ActiveTasks> {
        Arc::clone(&self.active)
    }

    /// Subscribe to instance status changes
    ///
    /// The value is a change counter; receivers re-read the instances they
    /// care about when it moves.
    pub fn subscribe_status(&self) -> watch::Receiver<u64> {
        self.status_tx.subscribe()
    }

    /// Create a new instance of a registered workflow type
    ///
    /// The input is checked against the workflow's input type before anything
    /// is stored.
    #[instrument(skip(self, input))]
    pub async fn create_instance(
        &self,
        instance_id: &str,
        workflow_type: &str,
        input: Value,
    ) -> Result<WorkflowInstance, ExecutorError> {
        self.registry.create(workflow_type, input.clone())?;

        let instance = self
            .store
            .create_instance(instance_id, workflow_type, input)
            .await?;

        info!(%instance_id, %workflow_type, "workflow instance created");
        self.notify_status();
        Ok(instance)
    }

    /// Handle a work item from the orchestration queue
    pub async fn handle(&self, item: WorkItem) -> Result<(), ExecutorError> {
        match item {
            WorkItem::Advance { instance_id } => {
                self.advance(&instance_id).await?;
            }
            WorkItem::TimerFired {
                instance_id,
                timer_id,
            } => {
                self.record_timer_fired(&instance_id, &timer_id).await?;
            }
        }
        Ok(())
    }

    /// Replay an instance and record the decisions beyond its recorded history
    ///
    /// Idempotent: advancing an instance whose history has not changed appends
    /// nothing.
    #[instrument(skip(self))]
    pub async fn advance(&self, instance_id: &str) -> Result<AdvanceResult, ExecutorError> {
        self.with_instance_lock(instance_id, || self.advance_locked(instance_id))
            .await
    }

    /// Record a successful attempt and advance the instance
    ///
    /// Returns `false` when the result was ignored: the instance already
    /// finished, or history already holds the activity's outcome.
    #[instrument(skip(self, task, result), fields(instance_id = %task.instance_id, activity_id = %task.activity_id))]
    pub async fn record_task_completed(
        &self,
        task: &ActivityTask,
        result: Value,
    ) -> Result<bool, ExecutorError> {
        let event = HistoryEvent::TaskCompleted {
            activity_id: task.activity_id.clone(),
            task_id: task.id,
            result,
        };
        self.with_instance_lock(&task.instance_id, move || {
            self.record_activity_event(&task.instance_id, &task.activity_id, event, true)
        })
        .await
    }

    /// Record a failed attempt
    ///
    /// Only a final failure (`will_retry == false`) advances the instance.
    #[instrument(skip(self, task, error), fields(instance_id = %task.instance_id, activity_id = %task.activity_id))]
    pub async fn record_task_failed(
        &self,
        task: &ActivityTask,
        error: ActivityError,
        will_retry: bool,
    ) -> Result<bool, ExecutorError> {
        let event = HistoryEvent::TaskFailed {
            activity_id: task.activity_id.clone(),
            task_id: task.id,
            attempt: task.attempt,
            error,
            will_retry,
        };
        self.with_instance_lock(&task.instance_id, move || {
            self.record_activity_event(&task.instance_id, &task.activity_id, event, !will_retry)
        })
        .await
    }

    /// Record an external event and advance the instance
    ///
    /// Events for finished instances are ignored and `false` is returned.
    #[instrument(skip(self, payload))]
    pub async fn raise_event(
        &self,
        instance_id: &str,
        event_name: &str,
        payload: Value,
    ) -> Result<bool, ExecutorError> {
        let event = ExternalEvent::new(event_name, payload);
        self.with_instance_lock(instance_id, move || {
            self.raise_event_locked(instance_id, event)
        })
        .await
    }

    /// Record a timer firing and advance the instance
    ///
    /// Firings of unknown, cancelled or already fired timers are ignored.
    #[instrument(skip(self))]
    pub async fn record_timer_fired(
        &self,
        instance_id: &str,
        timer_id: &str,
    ) -> Result<bool, ExecutorError> {
        self.with_instance_lock(instance_id, || {
            self.record_timer_fired_locked(instance_id, timer_id)
        })
        .await
    }

    /// Terminate an instance
    ///
    /// Records `ExecutionTerminated`, cancels its timers and unclaimed tasks and
    /// raises the cancellation flag of its running activities. Returns `false`
    /// when the instance had already finished.
    #[instrument(skip(self))]
    pub async fn terminate(&self, instance_id: &str, reason: &str) -> Result<bool, ExecutorError> {
        self.with_instance_lock(instance_id, || self.terminate_locked(instance_id, reason))
            .await
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    async fn with_instance_lock<'a, T, F, Fut>(&'a self, instance_id: &'a str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + 'a,
    {
        let lock = self
            .locks
            .entry(instance_id.to_string())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            f().await
        };
        drop(lock);
        // Nobody else holds or waits for the lock, so it can be dropped
        self.locks
            .remove_if(instance_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn advance_locked(&self, instance_id: &str) -> Result<AdvanceResult, ExecutorError> {
        let instance = self.store.get_instance(instance_id).await?;
        if instance.status.is_terminal() {
            debug!(%instance_id, status = %instance.status, "instance already finished");
            return Ok(AdvanceResult {
                status: instance.status,
                events_appended: 0,
            });
        }

        let history = self.store.load_history(instance_id).await?;
        let sequence = history.len() as i64;

        // A terminal event whose status update was lost
        if let Some(last) = history.last().filter(|r| r.event.is_terminal()) {
            return self.settle_recorded_terminal(instance_id, &last.event).await;
        }

        if history.len() > self.config.max_history_events {
            let message = format!(
                "history has {} events, more than the limit of {}",
                history.len(),
                self.config.max_history_events
            );
            return self.fault(instance_id, sequence, message).await;
        }

        let outcome = match self.replay_instance(&instance, &history) {
            Ok(outcome) => outcome,
            Err(message) => return self.fault(instance_id, sequence, message).await,
        };

        let ReplayOutcome {
            new_events,
            terminal,
            pending_activities,
            pending_timers,
            cancelled_timers,
        } = outcome;

        let events_appended = new_events.len();
        if !new_events.is_empty() {
            self.store
                .append_events(instance_id, sequence, new_events)
                .await?;
            debug!(%instance_id, events_appended, "recorded new decisions");
        }

        let status = match terminal {
            Some(terminal) => {
                let (status, output, error) = match terminal {
                    Terminal::Completed(result) => (WorkflowStatus::Completed, Some(result), None),
                    Terminal::Failed(error) => (WorkflowStatus::Failed, None, Some(error)),
                    Terminal::Terminated(reason) => {
                        (WorkflowStatus::Terminated, None, Some(terminated_error(&reason)))
                    }
                };
                self.finish(instance_id, status, output, error).await?;
                status
            }
            None => {
                let status = if pending_activities.is_empty() {
                    WorkflowStatus::Waiting
                } else {
                    WorkflowStatus::Running
                };
                self.reconcile(instance_id, pending_activities, &pending_timers, &cancelled_timers)
                    .await?;
                if status != instance.status {
                    self.store
                        .update_status(instance_id, status, None, None)
                        .await?;
                    self.notify_status();
                }
                status
            }
        };

        Ok(AdvanceResult {
            status,
            events_appended,
        })
    }

    fn replay_instance(
        &self,
        instance: &WorkflowInstance,
        history: &[HistoryRecord],
    ) -> Result<ReplayOutcome, String> {
        let mut workflow = self
            .registry
            .create(&instance.workflow_type, instance.input.clone())
            .map_err(|e| e.to_string())?;

        let now = Utc::now();
        match panic::catch_unwind(AssertUnwindSafe(|| {
            replay(workflow.as_mut(), history, now)
        })) {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(panic) => Err(format!("workflow panicked: {}", panic_message(&*panic))),
        }
    }

    /// Make sure every outstanding activity has a task and every pending timer
    /// is registered
    async fn reconcile(
        &self,
        instance_id: &str,
        pending_activities: Vec<PendingActivity>,
        pending_timers: &[PendingTimer],
        cancelled_timers: &[String],
    ) -> Result<(), ExecutorError> {
        let enqueued = !pending_activities.is_empty();
        for activity in pending_activities {
            self.store
                .enqueue_task(TaskDefinition {
                    instance_id: instance_id.to_string(),
                    activity_id: activity.activity_id,
                    activity_type: activity.activity_type,
                    input: activity.input,
                    options: activity.options,
                })
                .await?;
        }
        if enqueued {
            self.task_notify.notify_one();
        }

        for timer in pending_timers {
            self.send_timer_command(TimerCommand::Schedule {
                instance_id: instance_id.to_string(),
                timer_id: timer.timer_id.clone(),
                fire_at: timer.fire_at,
            });
        }
        for timer_id in cancelled_timers {
            self.send_timer_command(TimerCommand::Cancel {
                instance_id: instance_id.to_string(),
                timer_id: timer_id.clone(),
            });
        }
        Ok(())
    }

    async fn record_activity_event(
        &self,
        instance_id: &str,
        activity_id: &str,
        event: HistoryEvent,
        advance: bool,
    ) -> Result<bool, ExecutorError> {
        let instance = self.store.get_instance(instance_id).await?;
        if instance.status.is_terminal() {
            debug!(%instance_id, %activity_id, "ignoring activity result for finished instance");
            return Ok(false);
        }

        let history = self.store.load_history(instance_id).await?;
        let closed = history
            .iter()
            .any(|r| r.event.closes_activity() && r.event.activity_id() == Some(activity_id));
        if closed {
            warn!(%instance_id, %activity_id, "ignoring duplicate activity result");
            return Ok(false);
        }

        self.store
            .append_events(instance_id, history.len() as i64, vec![event])
            .await?;

        if advance {
            self.advance_locked(instance_id).await?;
        }
        Ok(true)
    }

    async fn raise_event_locked(
        &self,
        instance_id: &str,
        event: ExternalEvent,
    ) -> Result<bool, ExecutorError> {
        let instance = self.store.get_instance(instance_id).await?;
        if instance.status.is_terminal() {
            warn!(
                %instance_id,
                event_name = %event.name,
                status = %instance.status,
                "ignoring event raised for finished instance"
            );
            return Ok(false);
        }

        info!(%instance_id, event_name = %event.name, "external event raised");
        self.store
            .append_events(
                instance_id,
                instance.history_len,
                vec![HistoryEvent::ExternalEventRaised { event }],
            )
            .await?;

        self.advance_locked(instance_id).await?;
        Ok(true)
    }

    async fn record_timer_fired_locked(
        &self,
        instance_id: &str,
        timer_id: &str,
    ) -> Result<bool, ExecutorError> {
        let instance = self.store.get_instance(instance_id).await?;
        if instance.status.is_terminal() {
            return Ok(false);
        }

        let history = self.store.load_history(instance_id).await?;
        let mut created = false;
        let mut settled = false;
        for record in &history {
            match &record.event {
                HistoryEvent::TimerCreated { timer_id: id, .. } if id == timer_id => created = true,
                HistoryEvent::TimerFired { timer_id: id }
                | HistoryEvent::TimerCancelled { timer_id: id }
                    if id == timer_id =>
                {
                    settled = true
                }
                _ => {}
            }
        }
        if !created || settled {
            debug!(%instance_id, %timer_id, created, settled, "ignoring timer firing");
            return Ok(false);
        }

        debug!(%instance_id, %timer_id, "recording timer fired");
        self.store
            .append_events(
                instance_id,
                history.len() as i64,
                vec![HistoryEvent::TimerFired {
                    timer_id: timer_id.to_string(),
                }],
            )
            .await?;

        self.advance_locked(instance_id).await?;
        Ok(true)
    }

    async fn terminate_locked(
        &self,
        instance_id: &str,
        reason: &str,
    ) -> Result<bool, ExecutorError> {
        let instance = self.store.get_instance(instance_id).await?;
        if instance.status.is_terminal() {
            debug!(%instance_id, status = %instance.status, "instance already finished");
            return Ok(false);
        }

        self.store
            .append_events(
                instance_id,
                instance.history_len,
                vec![HistoryEvent::ExecutionTerminated {
                    reason: reason.to_string(),
                }],
            )
            .await?;
        self.finish(
            instance_id,
            WorkflowStatus::Terminated,
            None,
            Some(terminated_error(reason)),
        )
        .await?;

        info!(%instance_id, %reason, "workflow terminated");
        Ok(true)
    }

    /// Record an orchestration fault and fail the instance
    async fn fault(
        &self,
        instance_id: &str,
        sequence: i64,
        message: String,
    ) -> Result<AdvanceResult, ExecutorError> {
        error!(%instance_id, %message, "orchestration fault");

        let error = WorkflowError::fault(message);
        self.store
            .append_events(
                instance_id,
                sequence,
                vec![HistoryEvent::ExecutionFailed {
                    error: error.clone(),
                }],
            )
            .await?;
        self.finish(instance_id, WorkflowStatus::Failed, None, Some(error))
            .await?;

        Ok(AdvanceResult {
            status: WorkflowStatus::Failed,
            events_appended: 1,
        })
    }

    async fn settle_recorded_terminal(
        &self,
        instance_id: &str,
        event: &HistoryEvent,
    ) -> Result<AdvanceResult, ExecutorError> {
        let (status, output, error) = match event {
            HistoryEvent::ExecutionCompleted { result } => {
                (WorkflowStatus::Completed, Some(result.clone()), None)
            }
            HistoryEvent::ExecutionFailed { error } => {
                (WorkflowStatus::Failed, None, Some(error.clone()))
            }
            HistoryEvent::ExecutionTerminated { reason } => {
                (WorkflowStatus::Terminated, None, Some(terminated_error(reason)))
            }
            other => {
                return Err(StoreError::Serialization(format!(
                    "{} is not a terminal event",
                    other.type_name()
                ))
                .into())
            }
        };

        self.finish(instance_id, status, output, error).await?;
        Ok(AdvanceResult {
            status,
            events_appended: 0,
        })
    }

    /// Move an instance to a terminal status and release what it holds
    async fn finish(
        &self,
        instance_id: &str,
        status: WorkflowStatus,
        output: Option<Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), ExecutorError> {
        self.store
            .update_status(instance_id, status, output, error)
            .await?;

        let cancelled = self.store.cancel_instance_tasks(instance_id).await?;
        self.send_timer_command(TimerCommand::CancelInstance {
            instance_id: instance_id.to_string(),
        });
        let interrupted = self.active.cancel_instance(instance_id);

        info!(
            %instance_id,
            %status,
            cancelled_tasks = cancelled.len(),
            interrupted_tasks = interrupted,
            "workflow finished"
        );
        self.notify_status();
        Ok(())
    }

    fn send_timer_command(&self, command: TimerCommand) {
        if let Some(tx) = &self.timer_tx {
            if tx.send(command).is_err() {
                warn!("timer service is not running");
            }
        }
    }

    fn notify_status(&self) {
        self.status_tx.send_modify(|version| *version = version.wrapping_add(1));
    }
}

fn terminated_error(reason: &str) -> WorkflowError {
    WorkflowError::new(format!("terminated: {reason}")).with_code(TERMINATED)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
