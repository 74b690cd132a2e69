//! In-memory implementation of HistoryStore

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::activity::ActivityError;
use crate::workflow::{HistoryEvent, HistoryRecord, WorkflowError};

struct InstanceState {
    snapshot: WorkflowInstance,
    history: Vec<HistoryRecord>,
}

/// In-memory implementation of HistoryStore
///
/// Provides the same semantics as the PostgreSQL implementation. Share it
/// through an `Arc` to let a second runtime resume the instances of a
/// stopped one.
///
/// # Example
///
/// ```
/// use agentflow_durable::InMemoryHistoryStore;
///
/// let store = InMemoryHistoryStore::new();
/// ```
pub struct InMemoryHistoryStore {
    instances: RwLock<HashMap<String, InstanceState>>,
    // v7 ids keep the map in creation order
    tasks: RwLock<BTreeMap<Uuid, ActivityTask>>,
}

impl InMemoryHistoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            tasks: RwLock::new(BTreeMap::new()),
        }
    }

    /// Get the number of instances
    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Get the number of tasks waiting to be claimed
    pub fn scheduled_task_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Scheduled)
            .count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.instances.write().clear();
        self.tasks.write().clear();
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(
        &self,
        instance_id: &str,
        workflow_type: &str,
        input: serde_json::Value,
    ) -> Result<WorkflowInstance, StoreError> {
        let mut instances = self.instances.write();
        if instances.contains_key(instance_id) {
            return Err(StoreError::AlreadyExists(instance_id.to_string()));
        }

        let now = Utc::now();
        let snapshot = WorkflowInstance {
            id: instance_id.to_string(),
            workflow_type: workflow_type.to_string(),
            input: input.clone(),
            status: WorkflowStatus::Pending,
            output: None,
            error: None,
            history_len: 1,
            created_at: now,
            updated_at: now,
        };
        let started = HistoryRecord {
            sequence: 0,
            recorded_at: now,
            event: HistoryEvent::OrchestratorStarted {
                workflow_type: workflow_type.to_string(),
                input,
            },
        };

        instances.insert(
            instance_id.to_string(),
            InstanceState {
                snapshot: snapshot.clone(),
                history: vec![started],
            },
        );
        Ok(snapshot)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<WorkflowInstance, StoreError> {
        self.instances
            .read()
            .get(instance_id)
            .map(|i| i.snapshot.clone())
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))
    }

    async fn list_instances(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let mut listed: Vec<_> = self
            .instances
            .read()
            .values()
            .filter(|i| status.map_or(true, |s| i.snapshot.status == s))
            .map(|i| i.snapshot.clone())
            .collect();
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(listed)
    }

    async fn append_events(
        &self,
        instance_id: &str,
        expected_sequence: i64,
        events: Vec<HistoryEvent>,
    ) -> Result<i64, StoreError> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        let current_sequence = instance.history.len() as i64;
        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                instance_id: instance_id.to_string(),
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        let now = Utc::now();
        for event in events {
            let sequence = instance.history.len() as i64;
            instance.history.push(HistoryRecord {
                sequence,
                recorded_at: now,
                event,
            });
        }

        let len = instance.history.len() as i64;
        instance.snapshot.history_len = len;
        instance.snapshot.updated_at = now;
        Ok(len)
    }

    async fn load_history(&self, instance_id: &str) -> Result<Vec<HistoryRecord>, StoreError> {
        self.instances
            .read()
            .get(instance_id)
            .map(|i| i.history.clone())
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))
    }

    async fn update_status(
        &self,
        instance_id: &str,
        status: WorkflowStatus,
        output: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        let current = instance.snapshot.status;
        if !current.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                instance_id: instance_id.to_string(),
                from: current,
                to: status,
            });
        }
        if current.is_terminal() {
            return Ok(());
        }

        let snapshot = &mut instance.snapshot;
        snapshot.status = status;
        if output.is_some() {
            snapshot.output = output;
        }
        if error.is_some() {
            snapshot.error = error;
        }
        snapshot.updated_at = Utc::now();
        Ok(())
    }

    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let mut tasks = self.tasks.write();
        if let Some(existing) = tasks.values().find(|t| {
            t.instance_id == task.instance_id && t.activity_id == task.activity_id
        }) {
            return Ok(existing.id);
        }

        let now = Utc::now();
        let task_id = Uuid::now_v7();
        tasks.insert(
            task_id,
            ActivityTask {
                id: task_id,
                instance_id: task.instance_id,
                activity_id: task.activity_id,
                activity_type: task.activity_type,
                input: task.input,
                options: task.options,
                status: TaskStatus::Scheduled,
                attempt: 0,
                last_error: None,
                claimed_by: None,
                claimed_at: None,
                available_at: now,
                created_at: now,
            },
        );
        Ok(task_id)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<ActivityTask, StoreError> {
        self.tasks
            .read()
            .get(&task_id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn claim_tasks(
        &self,
        worker_id: &str,
        max_tasks: usize,
    ) -> Result<Vec<ActivityTask>, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write();

        let mut claimable: Vec<&mut ActivityTask> = tasks
            .values_mut()
            .filter(|t| t.status == TaskStatus::Scheduled && t.available_at <= now)
            .collect();
        claimable.sort_by_key(|t| t.available_at);

        let mut claimed = vec![];
        for task in claimable.into_iter().take(max_tasks) {
            task.status = TaskStatus::Running;
            task.claimed_by = Some(worker_id.to_string());
            task.claimed_at = Some(now);
            task.attempt += 1;
            claimed.push(task.clone());
        }

        Ok(claimed)
    }

    async fn heartbeat_task(&self, task_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Running || task.claimed_by.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        task.claimed_at = Some(Utc::now());
        Ok(true)
    }

    async fn retry_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
        error: &ActivityError,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if !task.is_held_by(worker_id, attempt) {
            return Ok(());
        }
        task.status = TaskStatus::Scheduled;
        task.last_error = Some(error.clone());
        task.claimed_by = None;
        task.claimed_at = None;
        task.available_at = available_at;
        Ok(())
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
    ) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if !task.is_held_by(worker_id, attempt) {
            return Ok(());
        }
        task.status = TaskStatus::Completed;
        task.claimed_by = None;
        Ok(())
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
        error: &ActivityError,
    ) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if !task.is_held_by(worker_id, attempt) {
            return Ok(());
        }
        task.status = TaskStatus::Failed;
        task.last_error = Some(error.clone());
        task.claimed_by = None;
        Ok(())
    }

    async fn cancel_instance_tasks(&self, instance_id: &str) -> Result<Vec<Uuid>, StoreError> {
        let mut tasks = self.tasks.write();
        let mut cancelled = vec![];
        for task in tasks.values_mut() {
            if task.instance_id == instance_id && task.status == TaskStatus::Scheduled {
                task.status = TaskStatus::Cancelled;
                cancelled.push(task.id);
            }
        }
        Ok(cancelled)
    }

    async fn reclaim_stale_tasks(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let threshold = chrono::Duration::from_std(stale_threshold)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let cutoff = Utc::now() - threshold;

        let mut tasks = self.tasks.write();
        let mut reclaimed = vec![];
        for task in tasks.values_mut() {
            let stale = task.status == TaskStatus::Running
                && task.claimed_at.map_or(true, |at| at <= cutoff);
            if stale {
                task.status = TaskStatus::Scheduled;
                task.claimed_by = None;
                task.claimed_at = None;
                task.available_at = Utc::now();
                reclaimed.push(task.id);
            }
        }
        Ok(reclaimed)
    }

    async fn list_tasks(&self, instance_id: &str) -> Result<Vec<ActivityTask>, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| t.instance_id == instance_id)
            .cloned()
            .collect())
    }
}
