//! Durable runtime
//!
//! Wires the executor, the timer service, the orchestration loop and the
//! activity worker pool together on one history store.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::executor::{ExecutorConfig, ExecutorError, WorkItem, WorkflowExecutor};
use super::registry::WorkflowRegistry;
use super::timers::TimerService;
use crate::activity::{Activity, ActivityRegistry};
use crate::client::WorkflowClient;
use crate::persistence::{HistoryStore, StoreError, WorkflowStatus};
use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
use crate::workflow::{duration_serde, Workflow};

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum number of instances advanced at the same time
    pub max_concurrent_orchestrations: usize,

    /// Histories longer than this fault the instance
    pub max_history_events: usize,

    /// Fallback poll interval of `wait_for_completion`
    #[serde(with = "duration_serde")]
    pub status_poll_interval: Duration,

    /// Activity worker pool configuration
    pub worker: WorkerPoolConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_orchestrations: 32,
            max_history_events: ExecutorConfig::default().max_history_events,
            status_poll_interval: Duration::from_millis(200),
            worker: WorkerPoolConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Reads `DURABLE_MAX_CONCURRENT_ORCHESTRATIONS`,
    /// `DURABLE_MAX_HISTORY_EVENTS` and `DURABLE_STATUS_POLL_INTERVAL_MS`,
    /// plus the worker pool variables (see [`WorkerPoolConfig::from_env`]).
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_concurrent_orchestrations = std::env::var("DURABLE_MAX_CONCURRENT_ORCHESTRATIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_concurrent_orchestrations);

        let max_history_events = std::env::var("DURABLE_MAX_HISTORY_EVENTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_history_events);

        let status_poll_interval = std::env::var("DURABLE_STATUS_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.status_poll_interval);

        Self {
            max_concurrent_orchestrations: max_concurrent_orchestrations.max(1),
            max_history_events,
            status_poll_interval,
            worker: WorkerPoolConfig::from_env(),
        }
    }

    pub fn with_max_concurrent_orchestrations(mut self, max: usize) -> Self {
        self.max_concurrent_orchestrations = max.max(1);
        self
    }

    pub fn with_max_history_events(mut self, max: usize) -> Self {
        self.max_history_events = max;
        self
    }

    pub fn with_status_poll_interval(mut self, interval: Duration) -> Self {
        self.status_poll_interval = interval;
        self
    }

    pub fn with_worker(mut self, worker: WorkerPoolConfig) -> Self {
        self.worker = worker;
        self
    }
}

/// Runtime errors
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Executor error
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Worker pool error
    #[error("worker pool error: {0}")]
    WorkerPool(#[from] WorkerPoolError),
}

/// Collects workflow and activity registrations before the runtime starts
pub struct DurableRuntimeBuilder {
    store: Arc<dyn HistoryStore>,
    workflows: WorkflowRegistry,
    activities: ActivityRegistry,
    config: RuntimeConfig,
}

impl DurableRuntimeBuilder {
    /// Register a workflow type
    pub fn register_workflow<W: Workflow>(mut self) -> Self {
        self.workflows.register::<W>();
        self
    }

    /// Register a typed activity
    pub fn register_activity<A: Activity>(mut self, activity: A) -> Self {
        self.activities.register(activity);
        self
    }

    /// Use a prepared activity registry, replacing earlier registrations
    pub fn with_activities(mut self, activities: ActivityRegistry) -> Self {
        self.activities = activities;
        self
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the runtime
    ///
    /// Every instance that is not finished is advanced once, which re-creates
    /// its outstanding tasks and timers.
    pub async fn start(self) -> Result<DurableRuntime, RuntimeError> {
        DurableRuntime::start(self).await
    }
}

/// A running durable execution engine
///
/// # Example
///
/// ```ignore
/// let runtime = DurableRuntime::builder(store)
///     .register_workflow::<OrderWorkflow>()
///     .register_activity(ChargeCard::new(payments))
///     .start()
///     .await?;
///
/// let client = runtime.client();
/// let id = client.schedule_new_workflow(OrderWorkflow::TYPE, input, None).await?;
/// let done = client.wait_for_completion(&id, Duration::from_secs(60)).await?;
///
/// runtime.shutdown().await?;
/// ```
pub struct DurableRuntime {
    executor: Arc<WorkflowExecutor>,
    pool: WorkerPool,
    work_tx: mpsc::UnboundedSender<WorkItem>,
    shutdown_tx: watch::Sender<bool>,
    permits: Arc<Semaphore>,
    config: RuntimeConfig,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DurableRuntime {
    /// Start building a runtime on `store`
    pub fn builder(store: Arc<dyn HistoryStore>) -> DurableRuntimeBuilder {
        DurableRuntimeBuilder {
            store,
            workflows: WorkflowRegistry::new(),
            activities: ActivityRegistry::new(),
            config: RuntimeConfig::default(),
        }
    }

    #[instrument(skip_all, fields(worker_id = %builder.config.worker.worker_id))]
    async fn start(builder: DurableRuntimeBuilder) -> Result<Self, RuntimeError> {
        let DurableRuntimeBuilder {
            store,
            workflows,
            activities,
            config,
        } = builder;

        info!(
            workflow_types = ?workflows.workflow_types().collect::<Vec<_>>(),
            activity_types = ?activities.activity_types().collect::<Vec<_>>(),
            "Starting durable runtime"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (work_tx, work_rx) = mpsc::unbounded_channel();

        let (timer_handle, timer_tx) = TimerService::start(work_tx.clone(), shutdown_rx.clone());
        let executor = Arc::new(
            WorkflowExecutor::new(
                store,
                Arc::new(workflows),
                ExecutorConfig {
                    max_history_events: config.max_history_events,
                },
            )
            .with_timer_service(timer_tx),
        );

        let permits = Arc::new(Semaphore::new(config.max_concurrent_orchestrations));
        let orchestration_handle = spawn_orchestration_loop(
            Arc::clone(&executor),
            work_rx,
            work_tx.clone(),
            Arc::clone(&permits),
            shutdown_rx,
        );

        let pool = WorkerPool::new(Arc::clone(&executor), activities, config.worker.clone());
        pool.start().await?;

        let runtime = Self {
            executor,
            pool,
            work_tx,
            shutdown_tx,
            permits,
            config,
            handles: Mutex::new(vec![timer_handle, orchestration_handle]),
        };
        runtime.recover().await?;

        Ok(runtime)
    }

    /// Queue an advance for every unfinished instance
    async fn recover(&self) -> Result<(), RuntimeError> {
        let mut recovered = 0;
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            WorkflowStatus::Waiting,
        ] {
            for instance in self.executor.store().list_instances(Some(status)).await? {
                self.enqueue(WorkItem::Advance {
                    instance_id: instance.id,
                });
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!(count = recovered, "Resuming unfinished workflow instances");
        }
        Ok(())
    }

    fn enqueue(&self, item: WorkItem) {
        if self.work_tx.send(item).is_err() {
            warn!("Orchestration loop is not running");
        }
    }

    /// Get a client bound to this runtime
    pub fn client(&self) -> WorkflowClient {
        WorkflowClient::new(
            Arc::clone(&self.executor),
            self.work_tx.clone(),
            self.config.status_poll_interval,
        )
    }

    /// Get the executor
    pub fn executor(&self) -> &Arc<WorkflowExecutor> {
        &self.executor
    }

    /// Get the worker pool
    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Stop the runtime
    ///
    /// Drains the worker pool, then stops the timer service and the
    /// orchestration loop and waits for in-flight advances. Nothing is lost:
    /// a runtime started later on the same store picks up where this one
    /// stopped.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let pool_result = self.pool.shutdown().await;

        self.shutdown_tx.send_replace(true);

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!("Runtime task ended abnormally: {}", e);
            }
        }

        let max = self.config.max_concurrent_orchestrations as u32;
        match tokio::time::timeout(
            self.config.worker.shutdown_timeout,
            self.permits.acquire_many(max),
        )
        .await
        {
            Ok(_) => debug!("All advances finished"),
            Err(_) => warn!("Shutdown timeout reached with advances in flight"),
        }

        info!("Durable runtime stopped");
        pool_result.map_err(RuntimeError::from)
    }
}

fn spawn_orchestration_loop(
    executor: Arc<WorkflowExecutor>,
    mut work_rx: mpsc::UnboundedReceiver<WorkItem>,
    work_tx: mpsc::UnboundedSender<WorkItem>,
    permits: Arc<Semaphore>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                item = work_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
                _ = shutdown_rx.changed() => {
                    debug!("Orchestration loop: shutdown requested");
                    break;
                }
            };

            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.changed() => break,
            };

            let executor = Arc::clone(&executor);
            let work_tx = work_tx.clone();
            tokio::spawn(async move {
                let instance_id = match &item {
                    WorkItem::Advance { instance_id } | WorkItem::TimerFired { instance_id, .. } => {
                        instance_id.clone()
                    }
                };

                match executor.handle(item.clone()).await {
                    Ok(()) => {}
                    Err(ExecutorError::Store(StoreError::ConcurrencyConflict { .. })) => {
                        // Another writer got there first; try again on fresh history
                        debug!(%instance_id, "Concurrency conflict, requeueing");
                        let _ = work_tx.send(item);
                    }
                    Err(e) => {
                        error!(%instance_id, "Failed to process work item: {}", e);
                    }
                }
                drop(permit);
            });
        }

        debug!("Orchestration loop exited");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_concurrent_orchestrations, 32);
        assert_eq!(config.max_history_events, 10_000);
        assert_eq!(config.status_poll_interval, Duration::from_millis(200));
    }

    #[test]
    fn test_config_builder() {
        let config = RuntimeConfig::new()
            .with_max_concurrent_orchestrations(0)
            .with_max_history_events(50)
            .with_status_poll_interval(Duration::from_millis(10))
            .with_worker(WorkerPoolConfig::new().with_worker_id("w-1"));

        assert_eq!(config.max_concurrent_orchestrations, 1);
        assert_eq!(config.max_history_events, 50);
        assert_eq!(config.status_poll_interval, Duration::from_millis(10));
        assert_eq!(config.worker.worker_id, "w-1");
    }

    #[test]
    fn test_config_serializes_poll_interval_as_millis() {
        let json = serde_json::to_value(RuntimeConfig::default()).unwrap();
        assert_eq!(json["status_poll_interval"], serde_json::json!(200));
        assert_eq!(json["worker"]["max_concurrency"], serde_json::json!(10));
    }
}
