//! Worker pool for activity execution
//!
//! Claims activity tasks from the store, runs them with bounded concurrency and
//! reports every attempt back to the executor, which records it in history.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{PollerConfig, TaskPoller, Wakeup};
use crate::activity::{ActivityContext, ActivityError, ActivityRegistry};
use crate::engine::{ExecutorError, WorkflowExecutor};
use crate::persistence::{ActivityTask, HistoryStore, StoreError};
use crate::reliability::RetryDecision;
use crate::workflow::duration_serde;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Maximum concurrent activity attempts
    pub max_concurrency: usize,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Stale task reclamation interval
    #[serde(with = "duration_serde")]
    pub stale_reclaim_interval: Duration,

    /// How long a claim may go without a heartbeat before it is reclaimed
    #[serde(with = "duration_serde")]
    pub stale_threshold: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrency: 10,
            poller: PollerConfig::default(),
            stale_reclaim_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(600),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new worker pool configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Reads `DURABLE_WORKER_ID`, `DURABLE_MAX_CONCURRENT_ACTIVITIES` and
    /// `DURABLE_STALE_TASK_THRESHOLD_SECS`; unset or unparsable values keep
    /// their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let worker_id = std::env::var("DURABLE_WORKER_ID").unwrap_or(defaults.worker_id);

        let max_concurrency = std::env::var("DURABLE_MAX_CONCURRENT_ACTIVITIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_concurrency);

        let stale_threshold = std::env::var("DURABLE_STALE_TASK_THRESHOLD_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.stale_threshold);

        Self {
            worker_id,
            max_concurrency: max_concurrency.max(1),
            stale_threshold,
            ..defaults
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    /// Set how often stale claims are looked for
    pub fn with_stale_reclaim_interval(mut self, interval: Duration) -> Self {
        self.stale_reclaim_interval = interval;
        self
    }

    /// Set how long a claim may go without a heartbeat
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Worker is running and accepting tasks
    Running,
    /// Worker is draining (completing current tasks, not accepting new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Executor error
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Worker pool for executing activities
///
/// # Example
///
/// ```ignore
/// let mut activities = ActivityRegistry::new();
/// activities.register(SendEmail::new(mailer));
///
/// let pool = WorkerPool::new(executor, activities, WorkerPoolConfig::default());
/// pool.start().await?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    store: Arc<dyn HistoryStore>,
    executor: Arc<WorkflowExecutor>,
    activities: Arc<ActivityRegistry>,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    status: Mutex<WorkerPoolStatus>,
    permits: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool
    pub fn new(
        executor: Arc<WorkflowExecutor>,
        activities: ActivityRegistry,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            store: Arc::clone(executor.store()),
            executor,
            activities: Arc::new(activities),
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown_tx,
            status: Mutex::new(WorkerPoolStatus::Stopped),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start the worker pool
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.lock();
            if *status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }
        self.shutdown_tx.send_replace(false);

        info!(
            worker_id = %self.config.worker_id,
            activity_types = ?self.activities.activity_types().collect::<Vec<_>>(),
            max_concurrency = self.config.max_concurrency,
            "Starting worker pool"
        );

        // Claims left behind by a previous process
        self.reclaim_stale().await;

        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(256);
        let mut handles = self.handles.lock();
        handles.push(self.start_poll_loop(heartbeat_tx));
        handles.push(self.start_heartbeat_loop(heartbeat_rx));
        handles.push(self.start_reclaim_loop());

        Ok(())
    }

    /// Shutdown the worker pool gracefully
    ///
    /// Stops claiming tasks and waits for running attempts to finish.
    /// Attempts still running at the deadline keep their claims and are
    /// reclaimed once stale.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.lock();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.permits.available_permits();
            if available == self.config.max_concurrency {
                debug!("All tasks completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining_tasks = self.config.max_concurrency - available,
                    "Shutdown timeout reached"
                );
                *self.status.lock() = WorkerPoolStatus::Stopped;
                return Err(WorkerPoolError::ShutdownTimeout);
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker loop ended abnormally: {}", e);
            }
        }

        *self.status.lock() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "Worker pool stopped");
        Ok(())
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.lock()
    }

    /// Number of attempts currently running
    pub fn current_load(&self) -> usize {
        self.config.max_concurrency - self.permits.available_permits()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    async fn reclaim_stale(&self) {
        match self
            .store
            .reclaim_stale_tasks(self.config.stale_threshold)
            .await
        {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                info!(count = reclaimed.len(), "Reclaimed stale tasks");
            }
            Ok(_) => {}
            Err(e) => error!("Stale task reclamation failed: {}", e),
        }
    }

    /// Start the polling loop
    fn start_poll_loop(&self, heartbeat_tx: mpsc::Sender<Uuid>) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let activities = Arc::clone(&self.activities);
        let permits = Arc::clone(&self.permits);
        let config = self.config.clone();
        let mut poller = TaskPoller::new(
            Arc::clone(&self.store),
            config.worker_id.clone(),
            config.poller.clone(),
            self.executor.task_notify(),
            self.shutdown_tx.subscribe(),
        );

        tokio::spawn(async move {
            loop {
                if poller.is_shutdown() {
                    debug!("Poll loop: shutdown requested");
                    break;
                }

                let available = permits.available_permits();
                if available == 0 {
                    // Wait for a running attempt to finish
                    tokio::select! {
                        permit = permits.clone().acquire_owned() => drop(permit),
                        wakeup = poller.wait() => if wakeup == Wakeup::Shutdown { break },
                    }
                    continue;
                }

                match poller.poll(available).await {
                    Ok(tasks) => {
                        let claimed = tasks.len();
                        for task in tasks {
                            let permit = match permits.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    // Claimed more than we can run; the claim goes stale
                                    // and another poll picks the task up again
                                    warn!(task_id = %task.id, "No permit for claimed task");
                                    continue;
                                }
                            };

                            let attempt = Attempt {
                                store: Arc::clone(&store),
                                executor: Arc::clone(&executor),
                                activities: Arc::clone(&activities),
                                heartbeat_tx: heartbeat_tx.clone(),
                                worker_id: config.worker_id.clone(),
                            };
                            tokio::spawn(async move {
                                attempt.run(task).await;
                                drop(permit);
                            });
                        }

                        if claimed > 0 {
                            continue;
                        }
                    }
                    Err(e) => {
                        error!("Poll error: {}", e);
                    }
                }

                if poller.wait().await == Wakeup::Shutdown {
                    break;
                }
            }

            debug!("Poll loop exited");
        })
    }

    /// Forward heartbeats from running activities to the store
    ///
    /// Runs until the poll loop and every attempt have dropped their senders,
    /// so draining attempts keep their claims alive.
    fn start_heartbeat_loop(&self, mut heartbeat_rx: mpsc::Receiver<Uuid>) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let worker_id = self.config.worker_id.clone();

        tokio::spawn(async move {
            while let Some(task_id) = heartbeat_rx.recv().await {
                match store.heartbeat_task(task_id, &worker_id).await {
                    Ok(true) => {}
                    Ok(false) => debug!(%task_id, "Heartbeat for a task no longer held"),
                    Err(e) => error!(%task_id, "Heartbeat failed: {}", e),
                }
            }

            debug!("Heartbeat loop exited");
        })
    }

    /// Start the stale task reclamation loop
    fn start_reclaim_loop(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let interval = self.config.stale_reclaim_interval;
        let threshold = self.config.stale_threshold;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.reclaim_stale_tasks(threshold).await {
                            Ok(reclaimed) => {
                                if !reclaimed.is_empty() {
                                    info!(count = reclaimed.len(), "Reclaimed stale tasks");
                                }
                            }
                            Err(e) => {
                                error!("Stale task reclamation failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Reclaim loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Reclaim loop exited");
        })
    }
}

/// Everything one attempt needs
struct Attempt {
    store: Arc<dyn HistoryStore>,
    executor: Arc<WorkflowExecutor>,
    activities: Arc<ActivityRegistry>,
    heartbeat_tx: mpsc::Sender<Uuid>,
    worker_id: String,
}

impl Attempt {
    #[instrument(
        skip(self, task),
        fields(
            task_id = %task.id,
            instance_id = %task.instance_id,
            activity_type = %task.activity_type,
            attempt = task.attempt
        )
    )]
    async fn run(self, task: ActivityTask) {
        let Some(activity) = self.activities.get(&task.activity_type) else {
            warn!("No activity registered for task");
            let error = ActivityError::unregistered(&task.activity_type);
            self.give_up(&task, error).await;
            return;
        };

        let policy = &task.options.retry_policy;
        let ctx = ActivityContext::new(
            task.id,
            task.instance_id.clone(),
            task.activity_id.clone(),
            task.attempt,
            policy.max_attempts,
        )
        .with_heartbeat(self.heartbeat_tx.clone());
        let cancellation = ctx.cancellation_handle();
        let active = self.executor.active_tasks();
        active.register(&task.instance_id, task.id, cancellation.clone());

        let timeout = task.options.start_to_close_timeout;
        let result = match tokio::time::timeout(
            timeout,
            activity.execute(Arc::new(ctx), task.input.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ActivityError::timed_out(timeout)),
        };
        active.remove(&task.instance_id, task.id);

        if cancellation.is_cancelled() {
            debug!("Attempt finished after its instance was terminated");
            let error = ActivityError::non_retryable("workflow instance was terminated")
                .with_type("cancelled");
            if let Err(e) = self
                .store
                .fail_task(task.id, &self.worker_id, task.attempt, &error)
                .await
            {
                error!("Failed to close cancelled task: {}", e);
            }
            return;
        }

        match result {
            Ok(output) => {
                debug!("Activity completed");
                if let Err(e) = self.executor.record_task_completed(&task, output).await {
                    // Leave the claim to go stale; the attempt is re-run
                    error!("Failed to record completion: {}", e);
                    return;
                }
                if let Err(e) = self
                    .store
                    .complete_task(task.id, &self.worker_id, task.attempt)
                    .await
                {
                    error!("Failed to complete task: {}", e);
                }
            }
            Err(error) => match policy.decide(task.attempt, &error) {
                RetryDecision::Retry { next_attempt, delay } => {
                    warn!(
                        error = %error,
                        next_attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Activity failed, will retry"
                    );
                    if let Err(e) = self
                        .executor
                        .record_task_failed(&task, error.clone(), true)
                        .await
                    {
                        error!("Failed to record failed attempt: {}", e);
                        return;
                    }
                    let available_at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    if let Err(e) = self
                        .store
                        .retry_task(task.id, &self.worker_id, task.attempt, &error, available_at)
                        .await
                    {
                        error!("Failed to requeue task: {}", e);
                    }
                }
                RetryDecision::GiveUp => {
                    warn!(error = %error, "Activity failed, giving up");
                    self.give_up(&task, error).await;
                }
            },
        }
    }

    async fn give_up(&self, task: &ActivityTask, error: ActivityError) {
        if let Err(e) = self
            .executor
            .record_task_failed(task, error.clone(), false)
            .await
        {
            error!(task_id = %task.id, "Failed to record final failure: {}", e);
            return;
        }
        if let Err(e) = self
            .store
            .fail_task(task.id, &self.worker_id, task.attempt, &error)
            .await
        {
            error!(task_id = %task.id, "Failed to fail task: {}", e);
        }
    }
}
