//! Client API for scheduling and controlling workflow instances
//!
//! Obtained from [`DurableRuntime::client`](crate::engine::DurableRuntime::client).
//! Clients are cheap to clone and can be shared across request handlers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::engine::{ExecutorError, RegistryError, WorkItem, WorkflowExecutor};
use crate::persistence::{StoreError, WorkflowInstance, WorkflowStatus};
use crate::workflow::{HistoryRecord, Workflow};

/// Errors returned to clients
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No instance with this id
    #[error("workflow instance not found: {0}")]
    NotFound(String),

    /// An instance with this id already exists
    #[error("workflow instance already exists: {0}")]
    AlreadyExists(String),

    /// Workflow type not registered with the runtime
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Input does not match the workflow's input type
    #[error("invalid workflow input: {0}")]
    InvalidInput(String),

    /// The instance did not finish in time; it keeps running
    #[error("timed out after {timeout:?} waiting for {instance_id}")]
    Timeout {
        instance_id: String,
        timeout: Duration,
    },

    /// Store error
    #[error("store error: {0}")]
    Store(StoreError),

    /// Executor error
    #[error("executor error: {0}")]
    Executor(ExecutorError),
}

impl From<StoreError> for ClientError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InstanceNotFound(id) => Self::NotFound(id),
            StoreError::AlreadyExists(id) => Self::AlreadyExists(id),
            other => Self::Store(other),
        }
    }
}

impl From<ExecutorError> for ClientError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Store(err) => err.into(),
            ExecutorError::Registry(RegistryError::UnknownWorkflowType(name)) => {
                Self::UnknownWorkflowType(name)
            }
            ExecutorError::Registry(RegistryError::Deserialization(err)) => {
                Self::InvalidInput(err.to_string())
            }
            other => Self::Executor(other),
        }
    }
}

/// Handle for scheduling, signalling and observing workflow instances
#[derive(Clone)]
pub struct WorkflowClient {
    executor: Arc<WorkflowExecutor>,
    work_tx: mpsc::UnboundedSender<WorkItem>,
    poll_interval: Duration,
}

impl WorkflowClient {
    pub(crate) fn new(
        executor: Arc<WorkflowExecutor>,
        work_tx: mpsc::UnboundedSender<WorkItem>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            executor,
            work_tx,
            poll_interval,
        }
    }

    /// Schedule a new workflow instance
    ///
    /// Uses `instance_id` when given and a fresh UUID v7 otherwise. Returns the
    /// instance id once the instance is durably recorded; execution starts
    /// asynchronously. Reusing an id fails with [`ClientError::AlreadyExists`]
    /// and leaves the existing instance untouched.
    #[instrument(skip(self, input))]
    pub async fn schedule_new_workflow(
        &self,
        workflow_type: &str,
        input: Value,
        instance_id: Option<String>,
    ) -> Result<String, ClientError> {
        let instance_id = instance_id.unwrap_or_else(|| Uuid::now_v7().to_string());

        self.executor
            .create_instance(&instance_id, workflow_type, input)
            .await?;

        let item = WorkItem::Advance {
            instance_id: instance_id.clone(),
        };
        if self.work_tx.send(item).is_err() {
            debug!(%instance_id, "Orchestration loop stopped, advancing inline");
            self.executor.advance(&instance_id).await?;
        }

        info!(%instance_id, %workflow_type, "Workflow scheduled");
        Ok(instance_id)
    }

    /// Schedule a registered workflow with typed input
    pub async fn schedule<W: Workflow>(
        &self,
        input: W::Input,
        instance_id: Option<String>,
    ) -> Result<String, ClientError> {
        let input =
            serde_json::to_value(input).map_err(|e| ClientError::InvalidInput(e.to_string()))?;
        self.schedule_new_workflow(W::TYPE, input, instance_id).await
    }

    /// Raise an external event on an instance
    ///
    /// The event resolves the oldest wait for `event_name` or is buffered until
    /// the workflow starts one. Returns `false` when the instance has already
    /// finished and the event was dropped.
    pub async fn raise_event(
        &self,
        instance_id: &str,
        event_name: &str,
        payload: Value,
    ) -> Result<bool, ClientError> {
        Ok(self
            .executor
            .raise_event(instance_id, event_name, payload)
            .await?)
    }

    /// Last committed snapshot of an instance
    pub async fn get_status(&self, instance_id: &str) -> Result<WorkflowInstance, ClientError> {
        Ok(self.executor.store().get_instance(instance_id).await?)
    }

    /// Wait until an instance reaches a terminal status
    ///
    /// Returns the final snapshot whether the workflow completed, failed or was
    /// terminated. Running out of time is [`ClientError::Timeout`]; the instance
    /// is not affected.
    #[instrument(skip(self))]
    pub async fn wait_for_completion(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<WorkflowInstance, ClientError> {
        let deadline = Instant::now() + timeout;
        let mut status_rx = self.executor.subscribe_status();

        loop {
            let instance = self.get_status(instance_id).await?;
            if instance.status.is_terminal() {
                return Ok(instance);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout {
                    instance_id: instance_id.to_string(),
                    timeout,
                });
            }

            // Status notifications only cover this process; polling covers
            // instances advanced by other runtimes on the same store
            let wait = (deadline - now).min(self.poll_interval);
            tokio::select! {
                _ = status_rx.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Terminate an instance
    ///
    /// Returns `false` when the instance had already finished.
    pub async fn terminate(&self, instance_id: &str, reason: &str) -> Result<bool, ClientError> {
        Ok(self.executor.terminate(instance_id, reason).await?)
    }

    /// Full recorded history of an instance
    pub async fn get_history(&self, instance_id: &str) -> Result<Vec<HistoryRecord>, ClientError> {
        let store = self.executor.store();
        store.get_instance(instance_id).await?;
        Ok(store.load_history(instance_id).await?)
    }

    /// List instances, optionally filtered by status
    pub async fn list_instances(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInstance>, ClientError> {
        Ok(self.executor.store().list_instances(status).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_client_errors() {
        let err: ClientError = StoreError::InstanceNotFound("a".to_string()).into();
        assert!(matches!(err, ClientError::NotFound(id) if id == "a"));

        let err: ClientError = ExecutorError::Store(StoreError::AlreadyExists("b".to_string())).into();
        assert!(matches!(err, ClientError::AlreadyExists(id) if id == "b"));

        let err: ClientError = StoreError::Database("down".to_string()).into();
        assert!(matches!(err, ClientError::Store(_)));
    }

    #[test]
    fn test_registry_errors_map_to_client_errors() {
        let err: ClientError =
            ExecutorError::Registry(RegistryError::UnknownWorkflowType("x".to_string())).into();
        assert!(matches!(err, ClientError::UnknownWorkflowType(name) if name == "x"));

        let bad = serde_json::from_str::<u32>("\"nope\"").unwrap_err();
        let err: ClientError = ExecutorError::Registry(RegistryError::Deserialization(bad)).into();
        assert!(matches!(err, ClientError::InvalidInput(_)));
    }

    #[test]
    fn test_timeout_message() {
        let err = ClientError::Timeout {
            instance_id: "order-1".to_string(),
            timeout: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "timed out after 2s waiting for order-1");
    }
}
