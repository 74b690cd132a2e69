//! In-process durable timer service
//!
//! Keeps a min-heap of pending timers ordered by absolute fire time and emits
//! [`WorkItem::TimerFired`] when wall-clock time reaches it. The heap is only a
//! cache of what history says: the executor re-registers every pending timer
//! on each advance, so a restarted runtime rebuilds it from the store.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::executor::WorkItem;

/// Upper bound on a single sleep, so clock adjustments are picked up
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Commands accepted by the timer service
#[derive(Debug, Clone, PartialEq)]
pub enum TimerCommand {
    /// Fire `timer_id` of `instance_id` at `fire_at`
    Schedule {
        instance_id: String,
        timer_id: String,
        fire_at: DateTime<Utc>,
    },

    /// Drop a timer that was cancelled
    Cancel {
        instance_id: String,
        timer_id: String,
    },

    /// Drop every timer of a finished or terminated instance
    CancelInstance { instance_id: String },
}

type TimerKey = (String, String);

/// Min-heap timer service
pub struct TimerService {
    rx: mpsc::UnboundedReceiver<TimerCommand>,
    work_tx: mpsc::UnboundedSender<WorkItem>,
    /// Live timers and their fire time in millis; heap entries that no longer
    /// match are stale and skipped
    items: HashMap<TimerKey, i64>,
    heap: BinaryHeap<Reverse<(i64, String, String)>>,
}

impl TimerService {
    /// Spawn the service, returning its task handle and command sender
    pub fn start(
        work_tx: mpsc::UnboundedSender<WorkItem>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (JoinHandle<()>, mpsc::UnboundedSender<TimerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut service = TimerService {
            rx,
            work_tx,
            items: HashMap::new(),
            heap: BinaryHeap::new(),
        };
        let handle = tokio::spawn(async move { service.run(shutdown_rx).await });
        (handle, tx)
    }

    async fn run(&mut self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            while let Ok(command) = self.rx.try_recv() {
                self.apply(command);
            }

            self.fire_due(Utc::now().timestamp_millis());

            let sleep_for = match self.next_fire_at() {
                Some(next) => {
                    let wait_ms = next.saturating_sub(Utc::now().timestamp_millis()).max(1);
                    Duration::from_millis(wait_ms as u64).min(MAX_SLEEP)
                }
                None => MAX_SLEEP,
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                command = self.rx.recv() => match command {
                    Some(command) => self.apply(command),
                    None => {
                        debug!("timer command channel closed");
                        break;
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(pending = self.items.len(), "timer service exited");
    }

    fn apply(&mut self, command: TimerCommand) {
        match command {
            TimerCommand::Schedule {
                instance_id,
                timer_id,
                fire_at,
            } => {
                let fire_at_ms = fire_at.timestamp_millis();
                let key = (instance_id, timer_id);
                if self.items.get(&key) == Some(&fire_at_ms) {
                    return;
                }
                trace!(instance_id = %key.0, timer_id = %key.1, %fire_at, "timer scheduled");
                self.heap
                    .push(Reverse((fire_at_ms, key.0.clone(), key.1.clone())));
                self.items.insert(key, fire_at_ms);
            }
            TimerCommand::Cancel {
                instance_id,
                timer_id,
            } => {
                self.items.remove(&(instance_id, timer_id));
            }
            TimerCommand::CancelInstance { instance_id } => {
                self.items.retain(|(instance, _), _| *instance != instance_id);
            }
        }
    }

    fn fire_due(&mut self, now_ms: i64) {
        while let Some(Reverse((fire_at_ms, _, _))) = self.heap.peek() {
            if *fire_at_ms > now_ms {
                break;
            }
            let Some(Reverse((fire_at_ms, instance_id, timer_id))) = self.heap.pop() else {
                break;
            };
            let key = (instance_id, timer_id);
            if self.items.get(&key) != Some(&fire_at_ms) {
                continue;
            }
            self.items.remove(&key);

            let (instance_id, timer_id) = key;
            debug!(%instance_id, %timer_id, "timer fired");
            if self
                .work_tx
                .send(WorkItem::TimerFired {
                    instance_id,
                    timer_id,
                })
                .is_err()
            {
                debug!("orchestration queue closed, dropping timer");
            }
        }
    }

    /// Fire time of the earliest live timer, discarding stale heap entries
    fn next_fire_at(&mut self) -> Option<i64> {
        while let Some(Reverse((fire_at_ms, instance_id, timer_id))) = self.heap.peek() {
            let live = self
                .items
                .get(&(instance_id.clone(), timer_id.clone()))
                .is_some_and(|at| at == fire_at_ms);
            if live {
                return Some(*fire_at_ms);
            }
            self.heap.pop();
        }
        None
    }
}
