//! Task polling with exponential backoff
//!
//! The poller claims tasks from the history store. It sleeps with a growing
//! interval while the queue is empty and wakes early when the executor
//! enqueues new tasks.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tracing::{debug, instrument, trace};

use crate::persistence::{ActivityTask, HistoryStore, StoreError};
use crate::workflow::duration_serde;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when tasks are available)
    #[serde(with = "duration_serde")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "duration_serde")]
    pub max_interval: Duration,

    /// Backoff multiplier when no tasks found
    pub backoff_multiplier: f64,

    /// Maximum tasks to claim per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(2),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Why the poller stopped waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// The backoff interval elapsed
    Interval,
    /// New tasks were enqueued
    Notified,
    /// Shutdown was requested
    Shutdown,
}

/// Task poller with adaptive backoff
///
/// Polls for tasks with exponential backoff when idle and resets to
/// minimum interval when tasks are found.
pub struct TaskPoller {
    store: Arc<dyn HistoryStore>,
    worker_id: String,
    config: PollerConfig,
    current_interval: Duration,
    notify: Arc<Notify>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskPoller {
    /// Create a new task poller
    pub fn new(
        store: Arc<dyn HistoryStore>,
        worker_id: String,
        config: PollerConfig,
        notify: Arc<Notify>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            worker_id,
            current_interval: config.min_interval,
            config,
            notify,
            shutdown_rx,
        }
    }

    /// Poll for available tasks
    ///
    /// Returns claimed tasks and updates internal backoff state.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn poll(&mut self, max_tasks: usize) -> Result<Vec<ActivityTask>, PollerError> {
        if self.is_shutdown() {
            debug!("Poller shutdown requested");
            return Ok(vec![]);
        }

        let batch_size = max_tasks.min(self.config.batch_size);
        if batch_size == 0 {
            return Ok(vec![]);
        }

        let tasks = self.store.claim_tasks(&self.worker_id, batch_size).await?;

        if tasks.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis() as u64,
                "No tasks found, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = tasks.len(), "Claimed tasks");
        }

        Ok(tasks)
    }

    /// Wait for the current backoff interval or a task notification
    ///
    /// A notification resets the backoff.
    pub async fn wait(&mut self) -> Wakeup {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let wakeup = tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => Wakeup::Interval,
            _ = self.notify.notified() => Wakeup::Notified,
            _ = shutdown_rx.changed() => Wakeup::Shutdown,
        };

        if wakeup == Wakeup::Notified {
            self.reset_backoff();
        }
        wakeup
    }

    /// Get the current poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let new_interval = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = new_interval.min(self.config.max_interval);
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryHistoryStore, TaskDefinition};
    use serde_json::json;

    fn poller(
        store: Arc<InMemoryHistoryStore>,
        notify: Arc<Notify>,
    ) -> (TaskPoller, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(10))
            .with_max_interval(Duration::from_millis(40))
            .with_backoff_multiplier(2.0);
        let poller = TaskPoller::new(store, "worker-1".to_string(), config, notify, shutdown_rx);
        (poller, shutdown_tx)
    }

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.min_interval, Duration::from_millis(50));
        assert_eq!(config.max_interval, Duration::from_secs(2));
        assert_eq!(config.backoff_multiplier, 1.5);
        assert_eq!(config.batch_size, 10);
    }

    #[test]
    fn test_config_builder() {
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_secs(10))
            .with_backoff_multiplier(0.5)
            .with_batch_size(0);

        assert_eq!(config.min_interval, Duration::from_millis(50));
        assert_eq!(config.max_interval, Duration::from_secs(10));
        assert_eq!(config.backoff_multiplier, 1.0);
        assert_eq!(config.batch_size, 1);
    }

    #[test]
    fn test_config_serializes_durations_as_millis() {
        let json = serde_json::to_value(PollerConfig::default()).unwrap();
        assert_eq!(json["min_interval"], json!(50));
        assert_eq!(json["max_interval"], json!(2000));
    }

    #[tokio::test]
    async fn test_backoff_grows_and_resets() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let (mut poller, _shutdown) = poller(store.clone(), Arc::new(Notify::new()));

        poller.poll(5).await.unwrap();
        assert_eq!(poller.current_interval(), Duration::from_millis(20));
        poller.poll(5).await.unwrap();
        poller.poll(5).await.unwrap();
        assert_eq!(poller.current_interval(), Duration::from_millis(40));

        store
            .enqueue_task(TaskDefinition {
                instance_id: "i".to_string(),
                activity_id: "a".to_string(),
                activity_type: "noop".to_string(),
                input: json!({}),
                options: Default::default(),
            })
            .await
            .unwrap();

        let tasks = poller.poll(5).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].claimed_by.as_deref(), Some("worker-1"));
        assert_eq!(poller.current_interval(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_notification_wakes_waiter() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let notify = Arc::new(Notify::new());
        let (mut poller, _shutdown) = poller(store, notify.clone());
        poller.poll(1).await.unwrap();

        notify.notify_one();
        assert_eq!(poller.wait().await, Wakeup::Notified);
        assert_eq!(poller.current_interval(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiter() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let (mut poller, shutdown) = poller(store, Arc::new(Notify::new()));

        shutdown.send(true).unwrap();
        assert_eq!(poller.wait().await, Wakeup::Shutdown);
        assert!(poller.is_shutdown());
        assert!(poller.poll(5).await.unwrap().is_empty());
    }
}
