//! Deterministic replay of a workflow over its recorded history
//!
//! Replay rebuilds a workflow's state by running its callbacks from the start
//! and feeding recorded inputs (activity results, timer firings, external
//! events) back in history order. Every decision the workflow makes is turned
//! into a decision event and matched, in order, against the decision events
//! already recorded. Decisions beyond the recorded prefix are returned as new
//! events for the caller to append.
//!
//! Replay is a pure function of the history: it performs no I/O and reads the
//! clock only through the `now` argument, which stamps timers that are created
//! for the first time.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::registry::AnyWorkflow;
use crate::workflow::{
    ActivityOptions, Awaitable, ExternalEvent, HistoryEvent, HistoryRecord, Resolution,
    WorkflowAction, WorkflowError,
};

/// Why replay could not reproduce the recorded history
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplayError {
    /// History does not start with `OrchestratorStarted`
    #[error("corrupt history: {0}")]
    CorruptHistory(String),

    /// The workflow produced a different decision than the one recorded
    #[error(
        "non-deterministic workflow at sequence {sequence}: history recorded {recorded}, workflow produced {produced}"
    )]
    NonDeterministic {
        sequence: i64,
        recorded: String,
        produced: String,
    },

    /// History records a decision the workflow no longer makes
    #[error(
        "non-deterministic workflow at sequence {sequence}: history recorded {recorded}, workflow produced nothing"
    )]
    MissingDecision { sequence: i64, recorded: String },

    /// An event or action refers to a primitive that was never started
    #[error("unknown {kind} '{id}'")]
    UnknownReference { kind: &'static str, id: String },

    /// The workflow reused an identifier
    #[error("duplicate {kind} id '{id}'")]
    DuplicateId { kind: &'static str, id: String },

    /// A race member already belongs to another unresolved race
    #[error("{member} is already raced by '{race_id}'")]
    MemberAlreadyRaced { member: Awaitable, race_id: String },
}

/// How the instance ended, as far as history (plus new events) says
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Completed(Value),
    Failed(WorkflowError),
    Terminated(String),
}

/// An activity that was scheduled and has not finished
#[derive(Debug, Clone, PartialEq)]
pub struct PendingActivity {
    pub activity_id: String,
    pub activity_type: String,
    pub input: Value,
    pub options: ActivityOptions,
}

/// A timer that was created and has neither fired nor been cancelled
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTimer {
    pub timer_id: String,
    pub fire_at: DateTime<Utc>,
}

/// Result of replaying a history
#[derive(Debug, Clone, Default)]
pub struct ReplayOutcome {
    /// Decisions beyond the recorded prefix, in order
    pub new_events: Vec<HistoryEvent>,

    /// Set once the workflow finished or was terminated
    pub terminal: Option<Terminal>,

    /// Outstanding activities, in scheduling order
    pub pending_activities: Vec<PendingActivity>,

    /// Outstanding timers
    pub pending_timers: Vec<PendingTimer>,

    /// Timers cancelled at any point
    pub cancelled_timers: Vec<String>,
}

impl ReplayOutcome {
    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }
}

#[derive(Debug, Clone)]
enum SlotState {
    Pending,
    Resolved { resolution: Resolution, order: u64 },
    Cancelled,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    /// Unresolved race this primitive is a member of
    owner: Option<String>,
    /// Whether the resolution has been handed to the workflow
    delivered: bool,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Pending,
            owner: None,
            delivered: false,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self.state, SlotState::Pending)
    }
}

#[derive(Debug)]
struct ActivityMeta {
    activity_type: String,
    input: Value,
    options: ActivityOptions,
}

#[derive(Debug)]
struct Race {
    members: Vec<Awaitable>,
    resolved: bool,
}

/// Replay `history` through `workflow`
///
/// `workflow` must be freshly built from the input recorded in the
/// `OrchestratorStarted` event at the head of `history`.
pub fn replay(
    workflow: &mut dyn AnyWorkflow,
    history: &[HistoryRecord],
    now: DateTime<Utc>,
) -> Result<ReplayOutcome, ReplayError> {
    let Some(first) = history.first() else {
        return Err(ReplayError::CorruptHistory("history is empty".to_string()));
    };
    if !matches!(first.event, HistoryEvent::OrchestratorStarted { .. }) {
        return Err(ReplayError::CorruptHistory(format!(
            "history starts with {} instead of orchestrator_started",
            first.event.type_name()
        )));
    }

    let mut replayer = Replayer::new(workflow, now);

    let actions = replayer.workflow.on_start();
    replayer.apply_actions(actions)?;
    replayer.settle()?;

    for record in &history[1..] {
        if replayer.terminated.is_some() {
            break;
        }
        if record.event.is_decision() {
            replayer.match_decision(record)?;
        } else {
            replayer.apply_input(record)?;
            replayer.settle()?;
        }
    }

    Ok(replayer.finish())
}

struct Replayer<'w> {
    workflow: &'w mut dyn AnyWorkflow,
    now: DateTime<Utc>,

    /// Decisions produced and not yet matched against history
    produced: VecDeque<HistoryEvent>,

    activities: HashMap<String, Slot>,
    activity_meta: HashMap<String, ActivityMeta>,
    activity_order: Vec<String>,
    timers: HashMap<String, Slot>,
    timer_fire_at: HashMap<String, DateTime<Utc>>,
    timer_order: Vec<String>,
    waits: HashMap<String, Slot>,
    wait_names: HashMap<String, String>,
    races: HashMap<String, Race>,

    /// Event name -> unresolved wait ids, oldest first
    waiters: HashMap<String, VecDeque<String>>,
    /// Event name -> events raised with no wait pending, oldest first
    buffered: HashMap<String, VecDeque<ExternalEvent>>,

    /// Resolutions waiting to be handed to the workflow
    ready: VecDeque<Resolution>,
    resolution_counter: u64,

    finished: Option<Terminal>,
    terminated: Option<String>,
}

impl<'w> Replayer<'w> {
    fn new(workflow: &'w mut dyn AnyWorkflow, now: DateTime<Utc>) -> Self {
        Self {
            workflow,
            now,
            produced: VecDeque::new(),
            activities: HashMap::new(),
            activity_meta: HashMap::new(),
            activity_order: Vec::new(),
            timers: HashMap::new(),
            timer_fire_at: HashMap::new(),
            timer_order: Vec::new(),
            waits: HashMap::new(),
            wait_names: HashMap::new(),
            races: HashMap::new(),
            waiters: HashMap::new(),
            buffered: HashMap::new(),
            ready: VecDeque::new(),
            resolution_counter: 0,
            finished: None,
            terminated: None,
        }
    }

    // =========================================================================
    // Actions
    // =========================================================================

    /// Apply a batch of actions; resolutions they cause are delivered later by `settle`
    fn apply_actions(&mut self, actions: Vec<WorkflowAction>) -> Result<(), ReplayError> {
        for action in actions {
            // Nothing the workflow asks for after finishing can take effect
            if self.finished.is_some() {
                break;
            }
            self.apply_action(action)?;
        }
        Ok(())
    }

    fn apply_action(&mut self, action: WorkflowAction) -> Result<(), ReplayError> {
        match action {
            WorkflowAction::ScheduleActivity {
                activity_id,
                activity_type,
                input,
                options,
            } => {
                if self.activities.contains_key(&activity_id) {
                    return Err(ReplayError::DuplicateId {
                        kind: "activity",
                        id: activity_id,
                    });
                }
                self.activities.insert(activity_id.clone(), Slot::new());
                self.activity_order.push(activity_id.clone());
                self.activity_meta.insert(
                    activity_id.clone(),
                    ActivityMeta {
                        activity_type: activity_type.clone(),
                        input: input.clone(),
                        options: options.clone(),
                    },
                );
                self.produced.push_back(HistoryEvent::TaskScheduled {
                    activity_id,
                    activity_type,
                    input,
                    options,
                });
            }

            WorkflowAction::StartTimer { timer_id, duration } => {
                let fire_at = chrono::Duration::from_std(duration)
                    .ok()
                    .and_then(|delta| self.now.checked_add_signed(delta))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                self.start_timer(timer_id, duration.as_millis() as u64, fire_at)?;
            }

            WorkflowAction::StartTimerAt { timer_id, fire_at } => {
                let duration_ms = (fire_at - self.now).num_milliseconds().max(0) as u64;
                self.start_timer(timer_id, duration_ms, fire_at)?;
            }

            WorkflowAction::WaitForEvent {
                wait_id,
                event_name,
            } => {
                if self.waits.contains_key(&wait_id) {
                    return Err(ReplayError::DuplicateId {
                        kind: "event wait",
                        id: wait_id,
                    });
                }
                self.waits.insert(wait_id.clone(), Slot::new());
                self.wait_names.insert(wait_id.clone(), event_name.clone());
                self.produced.push_back(HistoryEvent::EventWaitStarted {
                    wait_id: wait_id.clone(),
                    event_name: event_name.clone(),
                });

                let buffered = self
                    .buffered
                    .get_mut(&event_name)
                    .and_then(|queue| queue.pop_front());
                match buffered {
                    Some(event) => self.resolve(
                        Awaitable::Event(wait_id.clone()),
                        Resolution::EventReceived { wait_id, event },
                    ),
                    None => self
                        .waiters
                        .entry(event_name)
                        .or_default()
                        .push_back(wait_id),
                }
            }

            WorkflowAction::WaitForAny { race_id, members } => {
                self.start_race(race_id, members)?;
            }

            WorkflowAction::CancelTimer { timer_id } => {
                let slot = self
                    .timers
                    .get_mut(&timer_id)
                    .ok_or_else(|| ReplayError::UnknownReference {
                        kind: "timer",
                        id: timer_id.clone(),
                    })?;
                if slot.is_pending() {
                    slot.state = SlotState::Cancelled;
                    slot.owner = None;
                    self.produced
                        .push_back(HistoryEvent::TimerCancelled { timer_id });
                }
            }

            WorkflowAction::CancelEventWait { wait_id } => {
                let slot = self
                    .waits
                    .get_mut(&wait_id)
                    .ok_or_else(|| ReplayError::UnknownReference {
                        kind: "event wait",
                        id: wait_id.clone(),
                    })?;
                if slot.is_pending() {
                    slot.state = SlotState::Cancelled;
                    slot.owner = None;
                    if let Some(queue) = self
                        .wait_names
                        .get(&wait_id)
                        .and_then(|name| self.waiters.get_mut(name))
                    {
                        queue.retain(|w| w != &wait_id);
                    }
                    self.produced
                        .push_back(HistoryEvent::EventWaitCancelled { wait_id });
                }
            }

            WorkflowAction::CompleteWorkflow { result } => {
                self.finished = Some(Terminal::Completed(result.clone()));
                self.produced
                    .push_back(HistoryEvent::ExecutionCompleted { result });
            }

            WorkflowAction::FailWorkflow { error } => {
                self.finished = Some(Terminal::Failed(error.clone()));
                self.produced.push_back(HistoryEvent::ExecutionFailed { error });
            }
        }
        Ok(())
    }

    fn slot_mut(&mut self, handle: &Awaitable) -> Option<&mut Slot> {
        match handle {
            Awaitable::Activity(id) => self.activities.get_mut(id),
            Awaitable::Timer(id) => self.timers.get_mut(id),
            Awaitable::Event(id) => self.waits.get_mut(id),
        }
    }

    fn start_race(&mut self, race_id: String, members: Vec<Awaitable>) -> Result<(), ReplayError> {
        if self.races.contains_key(&race_id) {
            return Err(ReplayError::DuplicateId {
                kind: "race",
                id: race_id,
            });
        }

        // A member that already resolved and was delivered wins straight away;
        // among several, the one that resolved first.
        let mut earliest: Option<(u64, Resolution)> = None;
        for member in &members {
            let kind = match member {
                Awaitable::Activity(_) => "activity",
                Awaitable::Timer(_) => "timer",
                Awaitable::Event(_) => "event wait",
            };
            let slot = self
                .slot_mut(member)
                .ok_or_else(|| ReplayError::UnknownReference {
                    kind,
                    id: member.id().to_string(),
                })?;
            if let Some(owner) = &slot.owner {
                return Err(ReplayError::MemberAlreadyRaced {
                    member: member.clone(),
                    race_id: owner.clone(),
                });
            }
            if let SlotState::Resolved { resolution, order } = &slot.state {
                if slot.delivered && earliest.as_ref().map_or(true, |(o, _)| order < o) {
                    earliest = Some((*order, resolution.clone()));
                }
            }
        }

        for member in &members {
            if let Some(slot) = self.slot_mut(member) {
                slot.owner = Some(race_id.clone());
            }
        }
        self.produced.push_back(HistoryEvent::RaceStarted {
            race_id: race_id.clone(),
            members: members.clone(),
        });
        self.races.insert(
            race_id,
            Race {
                members,
                resolved: false,
            },
        );

        if let Some((_, resolution)) = earliest {
            self.ready.push_front(resolution);
        }
        Ok(())
    }

    fn start_timer(
        &mut self,
        timer_id: String,
        duration_ms: u64,
        fire_at: DateTime<Utc>,
    ) -> Result<(), ReplayError> {
        if self.timers.contains_key(&timer_id) {
            return Err(ReplayError::DuplicateId {
                kind: "timer",
                id: timer_id,
            });
        }
        self.timers.insert(timer_id.clone(), Slot::new());
        self.timer_order.push(timer_id.clone());
        self.timer_fire_at.insert(timer_id.clone(), fire_at);
        self.produced.push_back(HistoryEvent::TimerCreated {
            timer_id,
            duration_ms,
            fire_at,
        });
        Ok(())
    }

    // =========================================================================
    // History
    // =========================================================================

    fn match_decision(&mut self, record: &HistoryRecord) -> Result<(), ReplayError> {
        let Some(produced) = self.produced.pop_front() else {
            return Err(ReplayError::MissingDecision {
                sequence: record.sequence,
                recorded: describe(&record.event),
            });
        };

        if !same_decision(&record.event, &produced) {
            return Err(ReplayError::NonDeterministic {
                sequence: record.sequence,
                recorded: describe(&record.event),
                produced: describe(&produced),
            });
        }

        // The fire time is fixed the first time the timer is recorded
        if let HistoryEvent::TimerCreated {
            timer_id, fire_at, ..
        } = &record.event
        {
            self.timer_fire_at.insert(timer_id.clone(), *fire_at);
        }
        Ok(())
    }

    fn apply_input(&mut self, record: &HistoryRecord) -> Result<(), ReplayError> {
        match &record.event {
            HistoryEvent::TaskCompleted {
                activity_id,
                result,
                ..
            } => {
                let slot = self.activities.get(activity_id).ok_or_else(|| {
                    ReplayError::UnknownReference {
                        kind: "activity",
                        id: activity_id.clone(),
                    }
                })?;
                if slot.is_pending() {
                    self.resolve(
                        Awaitable::Activity(activity_id.clone()),
                        Resolution::ActivityCompleted {
                            activity_id: activity_id.clone(),
                            result: result.clone(),
                        },
                    );
                }
            }

            HistoryEvent::TaskFailed {
                activity_id,
                error,
                will_retry,
                ..
            } => {
                let slot = self.activities.get(activity_id).ok_or_else(|| {
                    ReplayError::UnknownReference {
                        kind: "activity",
                        id: activity_id.clone(),
                    }
                })?;
                if !will_retry && slot.is_pending() {
                    self.resolve(
                        Awaitable::Activity(activity_id.clone()),
                        Resolution::ActivityFailed {
                            activity_id: activity_id.clone(),
                            error: error.clone(),
                        },
                    );
                }
            }

            HistoryEvent::TimerFired { timer_id } => {
                let slot =
                    self.timers
                        .get(timer_id)
                        .ok_or_else(|| ReplayError::UnknownReference {
                            kind: "timer",
                            id: timer_id.clone(),
                        })?;
                // Late firings of cancelled timers are ignored
                if slot.is_pending() {
                    self.resolve(
                        Awaitable::Timer(timer_id.clone()),
                        Resolution::TimerFired {
                            timer_id: timer_id.clone(),
                        },
                    );
                }
            }

            HistoryEvent::ExternalEventRaised { event } => {
                let waiter = self
                    .waiters
                    .get_mut(&event.name)
                    .and_then(|queue| queue.pop_front());
                match waiter {
                    Some(wait_id) => self.resolve(
                        Awaitable::Event(wait_id.clone()),
                        Resolution::EventReceived {
                            wait_id,
                            event: event.clone(),
                        },
                    ),
                    None => self
                        .buffered
                        .entry(event.name.clone())
                        .or_default()
                        .push_back(event.clone()),
                }
            }

            HistoryEvent::ExecutionTerminated { reason } => {
                self.terminated = Some(reason.clone());
            }

            HistoryEvent::OrchestratorStarted { .. } => {
                return Err(ReplayError::CorruptHistory(format!(
                    "orchestrator_started recorded again at sequence {}",
                    record.sequence
                )));
            }

            other => {
                return Err(ReplayError::CorruptHistory(format!(
                    "unexpected {} at sequence {}",
                    other.type_name(),
                    record.sequence
                )));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    fn resolve(&mut self, handle: Awaitable, resolution: Resolution) {
        self.resolution_counter += 1;
        let order = self.resolution_counter;
        if let Some(slot) = self.slot_mut(&handle) {
            slot.state = SlotState::Resolved {
                resolution: resolution.clone(),
                order,
            };
            slot.delivered = false;
        }
        self.ready.push_back(resolution);
    }

    /// Hand ready resolutions to the workflow until none are left
    fn settle(&mut self) -> Result<(), ReplayError> {
        while let Some(resolution) = self.ready.pop_front() {
            if self.finished.is_some() {
                self.ready.clear();
                break;
            }

            let handle = resolution.awaitable();
            let owner = match self.slot_mut(&handle) {
                Some(slot) => {
                    slot.delivered = true;
                    slot.owner.take()
                }
                None => None,
            };

            let actions = match owner {
                Some(race_id) => self.resolve_race(race_id, handle, &resolution),
                None => self.deliver(&resolution),
            };
            self.apply_actions(actions)?;
        }
        Ok(())
    }

    fn resolve_race(
        &mut self,
        race_id: String,
        winner: Awaitable,
        resolution: &Resolution,
    ) -> Vec<WorkflowAction> {
        let members = match self.races.get_mut(&race_id) {
            Some(race) if !race.resolved => {
                race.resolved = true;
                race.members.clone()
            }
            _ => return self.deliver(resolution),
        };

        self.produced.push_back(HistoryEvent::RaceResolved {
            race_id: race_id.clone(),
            winner: winner.clone(),
        });

        for member in members.iter().filter(|m| **m != winner) {
            let Some(slot) = self.slot_mut(member) else {
                continue;
            };
            slot.owner = None;
            if let Awaitable::Timer(timer_id) = member {
                if slot.is_pending() {
                    slot.state = SlotState::Cancelled;
                    self.produced.push_back(HistoryEvent::TimerCancelled {
                        timer_id: timer_id.clone(),
                    });
                }
            }
        }

        self.workflow.on_race_resolved(&race_id, resolution)
    }

    fn deliver(&mut self, resolution: &Resolution) -> Vec<WorkflowAction> {
        match resolution {
            Resolution::ActivityCompleted {
                activity_id,
                result,
            } => self
                .workflow
                .on_activity_completed(activity_id, result.clone()),
            Resolution::ActivityFailed { activity_id, error } => {
                self.workflow.on_activity_failed(activity_id, error)
            }
            Resolution::TimerFired { timer_id } => self.workflow.on_timer_fired(timer_id),
            Resolution::EventReceived { wait_id, event } => self.workflow.on_event(wait_id, event),
        }
    }

    fn finish(self) -> ReplayOutcome {
        let terminal = match self.terminated {
            Some(reason) => Some(Terminal::Terminated(reason)),
            None => self.finished,
        };

        // Nothing new is recorded for a terminated instance
        let new_events = if matches!(terminal, Some(Terminal::Terminated(_))) {
            Vec::new()
        } else {
            self.produced.into_iter().collect()
        };

        let pending_activities = self
            .activity_order
            .iter()
            .filter(|id| self.activities.get(*id).is_some_and(Slot::is_pending))
            .filter_map(|id| {
                self.activity_meta.get(id).map(|meta| PendingActivity {
                    activity_id: id.clone(),
                    activity_type: meta.activity_type.clone(),
                    input: meta.input.clone(),
                    options: meta.options.clone(),
                })
            })
            .collect();

        let mut pending_timers = Vec::new();
        let mut cancelled_timers = Vec::new();
        for timer_id in &self.timer_order {
            match self.timers.get(timer_id).map(|slot| &slot.state) {
                Some(SlotState::Pending) => {
                    if let Some(fire_at) = self.timer_fire_at.get(timer_id) {
                        pending_timers.push(PendingTimer {
                            timer_id: timer_id.clone(),
                            fire_at: *fire_at,
                        });
                    }
                }
                Some(SlotState::Cancelled) => cancelled_timers.push(timer_id.clone()),
                _ => {}
            }
        }

        ReplayOutcome {
            new_events,
            terminal,
            pending_activities,
            pending_timers,
            cancelled_timers,
        }
    }
}

/// Whether a recorded decision matches the one the workflow produced
fn same_decision(recorded: &HistoryEvent, produced: &HistoryEvent) -> bool {
    match (recorded, produced) {
        (
            HistoryEvent::TaskScheduled {
                activity_id: a,
                activity_type: at,
                input: ai,
                ..
            },
            HistoryEvent::TaskScheduled {
                activity_id: b,
                activity_type: bt,
                input: bi,
                ..
            },
        ) => a == b && at == bt && ai == bi,
        // Relative timers keep their duration, absolute ones their fire time
        (
            HistoryEvent::TimerCreated {
                timer_id: a,
                duration_ms: ad,
                fire_at: af,
            },
            HistoryEvent::TimerCreated {
                timer_id: b,
                duration_ms: bd,
                fire_at: bf,
            },
        ) => a == b && (ad == bd || af == bf),
        _ => recorded == produced,
    }
}

/// Short description of a decision for fault messages
fn describe(event: &HistoryEvent) -> String {
    let detail = match event {
        HistoryEvent::TaskScheduled {
            activity_id,
            activity_type,
            ..
        } => format!("{activity_id}, {activity_type}"),
        HistoryEvent::TimerCreated {
            timer_id,
            duration_ms,
            ..
        } => format!("{timer_id}, {duration_ms}ms"),
        HistoryEvent::TimerCancelled { timer_id } => timer_id.clone(),
        HistoryEvent::EventWaitStarted {
            wait_id,
            event_name,
        } => format!("{wait_id}, {event_name}"),
        HistoryEvent::EventWaitCancelled { wait_id } => wait_id.clone(),
        HistoryEvent::RaceStarted { race_id, .. } => race_id.clone(),
        HistoryEvent::RaceResolved { race_id, winner } => format!("{race_id}, {winner}"),
        _ => String::new(),
    };
    format!("{}({detail})", event.type_name())
}
