//! Cancellation handles of the activity attempts currently running

use std::collections::HashMap;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::activity::CancellationHandle;

/// Running attempts, grouped by workflow instance
///
/// The worker pool registers every attempt it starts; terminating an instance
/// raises the cancellation flag of all its attempts.
#[derive(Debug, Default)]
pub struct ActiveTasks {
    by_instance: Mutex<HashMap<String, HashMap<Uuid, CancellationHandle>>>,
}

impl ActiveTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instance_id: &str, task_id: Uuid, handle: CancellationHandle) {
        self.by_instance
            .lock()
            .entry(instance_id.to_string())
            .or_default()
            .insert(task_id, handle);
    }

    pub fn remove(&self, instance_id: &str, task_id: Uuid) {
        let mut by_instance = self.by_instance.lock();
        if let Some(tasks) = by_instance.get_mut(instance_id) {
            tasks.remove(&task_id);
            if tasks.is_empty() {
                by_instance.remove(instance_id);
            }
        }
    }

    /// Cancel every running attempt of an instance, returning how many there were
    pub fn cancel_instance(&self, instance_id: &str) -> usize {
        let tasks = self.by_instance.lock().remove(instance_id);
        match tasks {
            Some(tasks) => {
                for handle in tasks.values() {
                    handle.cancel();
                }
                tasks.len()
            }
            None => 0,
        }
    }

    /// Number of attempts currently running
    pub fn len(&self) -> usize {
        self.by_instance.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
