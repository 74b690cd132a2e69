//! End-to-end tests for the durable runtime on the in-memory store
//!
//! Restarts are simulated by shutting a runtime down and starting a new one on
//! the same `Arc` store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use agentflow_durable::prelude::*;
use agentflow_durable::persistence::TaskStatus;
use agentflow_durable::worker::PollerConfig;
use agentflow_durable::workflow::{HistoryEvent, HistoryRecord};

// ============================================
// Test workflows
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApprovalInput {
    request: String,
    timeout_ms: u64,
}

/// Prepares a request, then races an approval event against a deadline and
/// sends a notification with the outcome
struct ApprovalWorkflow {
    input: ApprovalInput,
    prepared: Option<Value>,
    approved: bool,
}

impl Workflow for ApprovalWorkflow {
    const TYPE: &'static str = "approval";
    type Input = ApprovalInput;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            prepared: None,
            approved: false,
        }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        vec![WorkflowAction::schedule_activity(
            "prepare",
            "prepare",
            json!({ "request": self.input.request }),
        )]
    }

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction> {
        match activity_id {
            "prepare" => {
                self.prepared = Some(result);
                vec![
                    WorkflowAction::wait_for_event("approval", "approved"),
                    WorkflowAction::timer("deadline", Duration::from_millis(self.input.timeout_ms)),
                    WorkflowAction::wait_for_any(
                        "decision",
                        vec![Awaitable::event("approval"), Awaitable::timer("deadline")],
                    ),
                ]
            }
            _ => vec![WorkflowAction::complete(json!({
                "prepared": self.prepared,
                "approved": self.approved,
                "notification": result,
            }))],
        }
    }

    fn on_activity_failed(&mut self, _activity_id: &str, error: &ActivityError) -> Vec<WorkflowAction> {
        vec![WorkflowAction::fail(WorkflowError::new(format!(
            "activity failed: {}",
            error.message
        )))]
    }

    fn on_race_resolved(&mut self, _race_id: &str, winner: &Resolution) -> Vec<WorkflowAction> {
        self.approved = match winner {
            Resolution::EventReceived { event, .. } => event.payload["approved"] == json!(true),
            _ => false,
        };
        vec![WorkflowAction::schedule_activity(
            "notify",
            "notify",
            json!({ "approved": self.approved }),
        )]
    }
}

/// Runs one activity and completes with its result
struct SingleActivityWorkflow;

impl Workflow for SingleActivityWorkflow {
    const TYPE: &'static str = "single_activity";
    type Input = Value;

    fn new(_input: Value) -> Self {
        Self
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        let options = ActivityOptions::default()
            .with_retry(RetryPolicy::fixed(Duration::from_millis(10), 3).with_jitter(0.0));
        vec![WorkflowAction::schedule_activity_with(
            "work",
            "work",
            json!({}),
            options,
        )]
    }

    fn on_activity_completed(&mut self, _activity_id: &str, result: Value) -> Vec<WorkflowAction> {
        vec![WorkflowAction::complete(result)]
    }

    fn on_activity_failed(&mut self, _activity_id: &str, error: &ActivityError) -> Vec<WorkflowAction> {
        vec![WorkflowAction::fail(WorkflowError::new(&error.message))]
    }
}

/// Collects two events with the same name, in order
struct CollectWorkflow {
    received: Vec<Value>,
}

impl Workflow for CollectWorkflow {
    const TYPE: &'static str = "collect";
    type Input = Value;

    fn new(_input: Value) -> Self {
        Self { received: vec![] }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        vec![WorkflowAction::timer("settle", Duration::from_millis(100))]
    }

    fn on_timer_fired(&mut self, _timer_id: &str) -> Vec<WorkflowAction> {
        vec![
            WorkflowAction::wait_for_event("first", "item"),
            WorkflowAction::wait_for_event("second", "item"),
        ]
    }

    fn on_event(&mut self, _wait_id: &str, event: &ExternalEvent) -> Vec<WorkflowAction> {
        self.received.push(event.payload.clone());
        if self.received.len() == 2 {
            vec![WorkflowAction::complete(json!(self.received))]
        } else {
            vec![]
        }
    }

    fn on_activity_completed(&mut self, _: &str, _: Value) -> Vec<WorkflowAction> {
        vec![]
    }

    fn on_activity_failed(&mut self, _: &str, _: &ActivityError) -> Vec<WorkflowAction> {
        vec![]
    }
}

// ============================================
// Helpers
// ============================================

fn test_config() -> RuntimeConfig {
    RuntimeConfig::new()
        .with_status_poll_interval(Duration::from_millis(20))
        .with_worker(
            WorkerPoolConfig::new()
                .with_max_concurrency(4)
                .with_poller(
                    PollerConfig::new()
                        .with_min_interval(Duration::from_millis(5))
                        .with_max_interval(Duration::from_millis(50)),
                )
                .with_shutdown_timeout(Duration::from_secs(2)),
        )
}

fn approval_activities() -> ActivityRegistry {
    let mut activities = ActivityRegistry::new();
    activities
        .register_fn("prepare", |_ctx, input| async move {
            Ok(json!({ "prepared": input["request"] }))
        })
        .register_fn("notify", |_ctx, input| async move {
            Ok(json!({ "sent": true, "approved": input["approved"] }))
        });
    activities
}

async fn start_runtime(store: Arc<InMemoryHistoryStore>) -> DurableRuntime {
    DurableRuntime::builder(store)
        .register_workflow::<ApprovalWorkflow>()
        .register_workflow::<SingleActivityWorkflow>()
        .register_workflow::<CollectWorkflow>()
        .with_activities(approval_activities())
        .with_config(test_config())
        .start()
        .await
        .expect("runtime starts")
}

async fn wait_for_status(client: &WorkflowClient, id: &str, status: WorkflowStatus) {
    for _ in 0..200 {
        if client.get_status(id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{id} never reached {status}");
}

fn approval(timeout_ms: u64) -> ApprovalInput {
    ApprovalInput {
        request: "refund".to_string(),
        timeout_ms,
    }
}

fn count_events(history: &[HistoryRecord], type_name: &str) -> usize {
    history
        .iter()
        .filter(|r| r.event.type_name() == type_name)
        .count()
}

// ============================================
// Scenarios
// ============================================

#[test_log::test(tokio::test)]
async fn test_event_beats_timer() {
    let store = Arc::new(InMemoryHistoryStore::new());
    let runtime = start_runtime(store).await;
    let client = runtime.client();

    let id = client
        .schedule::<ApprovalWorkflow>(approval(60_000), Some("approval-1".to_string()))
        .await
        .unwrap();
    wait_for_status(&client, &id, WorkflowStatus::Waiting).await;

    assert!(client
        .raise_event(&id, "approved", json!({ "approved": true }))
        .await
        .unwrap());

    let instance = client
        .wait_for_completion(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(instance.status, WorkflowStatus::Completed);
    let output = instance.output.unwrap();
    assert_eq!(output["approved"], json!(true));
    assert_eq!(output["notification"]["sent"], json!(true));

    let history = client.get_history(&id).await.unwrap();
    assert_eq!(count_events(&history, "race_resolved"), 1);
    // The losing timer is cancelled
    assert_eq!(count_events(&history, "timer_cancelled"), 1);
    assert_eq!(count_events(&history, "timer_fired"), 0);

    runtime.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_timer_beats_absent_event() {
    let store = Arc::new(InMemoryHistoryStore::new());
    let runtime = start_runtime(store).await;
    let client = runtime.client();

    let id = client
        .schedule::<ApprovalWorkflow>(approval(100), None)
        .await
        .unwrap();

    let instance = client
        .wait_for_completion(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.output.unwrap()["approved"], json!(false));

    // A late approval is ignored
    assert!(!client
        .raise_event(&id, "approved", json!({ "approved": true }))
        .await
        .unwrap());
    let history = client.get_history(&id).await.unwrap();
    assert_eq!(count_events(&history, "external_event_raised"), 0);
    assert_eq!(count_events(&history, "timer_fired"), 1);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_events_are_buffered_in_order() {
    let store = Arc::new(InMemoryHistoryStore::new());
    let runtime = start_runtime(store).await;
    let client = runtime.client();

    let id = client
        .schedule_new_workflow(CollectWorkflow::TYPE, json!({}), Some("collect-1".to_string()))
        .await
        .unwrap();

    // Raised before the workflow waits for them
    client.raise_event(&id, "item", json!("a")).await.unwrap();
    client.raise_event(&id, "item", json!("b")).await.unwrap();

    let instance = client
        .wait_for_completion(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.output, Some(json!(["a", "b"])));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_schedule_is_idempotent_per_instance_id() {
    let store = Arc::new(InMemoryHistoryStore::new());
    let runtime = start_runtime(store).await;
    let client = runtime.client();

    client
        .schedule::<ApprovalWorkflow>(approval(60_000), Some("dup-1".to_string()))
        .await
        .unwrap();
    wait_for_status(&client, "dup-1", WorkflowStatus::Waiting).await;
    let before = client.get_history("dup-1").await.unwrap().len();

    let err = client
        .schedule::<ApprovalWorkflow>(approval(1), Some("dup-1".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::AlreadyExists(id) if id == "dup-1"));

    let history = client.get_history("dup-1").await.unwrap();
    assert_eq!(history.len(), before);
    assert_eq!(count_events(&history, "orchestrator_started"), 1);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_client_errors() {
    let store = Arc::new(InMemoryHistoryStore::new());
    let runtime = start_runtime(store).await;
    let client = runtime.client();

    let err = client
        .schedule_new_workflow("not_registered", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::UnknownWorkflowType(_)));

    let err = client
        .schedule_new_workflow(ApprovalWorkflow::TYPE, json!({ "wrong": 1 }), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidInput(_)));

    assert!(matches!(
        client.get_status("missing").await.unwrap_err(),
        ClientError::NotFound(_)
    ));
    assert!(matches!(
        client.raise_event("missing", "approved", json!({})).await.unwrap_err(),
        ClientError::NotFound(_)
    ));
    assert!(matches!(
        client.get_history("missing").await.unwrap_err(),
        ClientError::NotFound(_)
    ));

    let id = client
        .schedule::<ApprovalWorkflow>(approval(60_000), None)
        .await
        .unwrap();
    let err = client
        .wait_for_completion(&id, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout { .. }));
    // Timing out does not affect the instance
    assert!(!client.get_status(&id).await.unwrap().status.is_terminal());

    runtime.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_terminate_waiting_instance() {
    let store = Arc::new(InMemoryHistoryStore::new());
    let runtime = start_runtime(store).await;
    let client = runtime.client();

    let id = client
        .schedule::<ApprovalWorkflow>(approval(60_000), None)
        .await
        .unwrap();
    wait_for_status(&client, &id, WorkflowStatus::Waiting).await;

    assert!(client.terminate(&id, "customer withdrew").await.unwrap());
    assert!(!client.terminate(&id, "again").await.unwrap());

    let instance = client
        .wait_for_completion(&id, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(instance.status, WorkflowStatus::Terminated);
    assert!(instance.error.unwrap().message.contains("customer withdrew"));

    assert!(!client
        .raise_event(&id, "approved", json!({ "approved": true }))
        .await
        .unwrap());

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retry_exhaustion_fails_workflow() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut activities = ActivityRegistry::new();
    activities.register_fn("work", move |_ctx, _input| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(ActivityError::retryable("upstream unavailable")) }
    });

    let runtime = DurableRuntime::builder(Arc::new(InMemoryHistoryStore::new()))
        .register_workflow::<SingleActivityWorkflow>()
        .with_activities(activities)
        .with_config(test_config())
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let id = client
        .schedule::<SingleActivityWorkflow>(json!({}), None)
        .await
        .unwrap();
    let instance = client
        .wait_for_completion(&id, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert_eq!(instance.error.unwrap().message, "upstream unavailable");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let history = client.get_history(&id).await.unwrap();
    let retries: Vec<bool> = history
        .iter()
        .filter_map(|r| match &r.event {
            HistoryEvent::TaskFailed { will_retry, .. } => Some(*will_retry),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![true, true, false]);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stale_attempt_is_rerun_and_deduplicated() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut activities = ActivityRegistry::new();
    activities.register_fn("work", move |ctx, _input| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if ctx.attempt == 1 {
                // Stalls without heartbeats until its claim goes stale
                tokio::time::sleep(Duration::from_millis(400)).await;
            }
            Ok(json!({ "attempt": ctx.attempt }))
        }
    });

    let mut config = test_config();
    config.worker = config
        .worker
        .with_stale_threshold(Duration::from_millis(100))
        .with_stale_reclaim_interval(Duration::from_millis(50));

    let store = Arc::new(InMemoryHistoryStore::new());
    let runtime = DurableRuntime::builder(store.clone())
        .register_workflow::<SingleActivityWorkflow>()
        .with_activities(activities)
        .with_config(config)
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let id = client
        .schedule::<SingleActivityWorkflow>(json!({}), None)
        .await
        .unwrap();
    let instance = client
        .wait_for_completion(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(instance.output, Some(json!({ "attempt": 2 })));

    // Let the stalled first attempt finish; its late result is dropped
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let history = client.get_history(&id).await.unwrap();
    assert_eq!(count_events(&history, "task_completed"), 1);
    let tasks = store.list_tasks(&id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Completed);

    runtime.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_restart_resumes_pending_timer() {
    let store = Arc::new(InMemoryHistoryStore::new());

    let first = start_runtime(store.clone()).await;
    let id = first
        .client()
        .schedule::<ApprovalWorkflow>(approval(300), Some("restart-timer".to_string()))
        .await
        .unwrap();
    wait_for_status(&first.client(), &id, WorkflowStatus::Waiting).await;
    first.shutdown().await.unwrap();

    // The deadline passes while nothing is running
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        store.get_instance(&id).await.unwrap().status,
        WorkflowStatus::Waiting
    );

    let second = start_runtime(store.clone()).await;
    let instance = second
        .client()
        .wait_for_completion(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.output.unwrap()["approved"], json!(false));

    // The recorded decisions were replayed, not repeated
    let history = store.load_history(&id).await.unwrap();
    assert_eq!(count_events(&history, "timer_created"), 1);
    assert_eq!(count_events(&history, "task_scheduled"), 2);

    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_accepts_event_for_waiting_instance() {
    let store = Arc::new(InMemoryHistoryStore::new());

    let first = start_runtime(store.clone()).await;
    let id = first
        .client()
        .schedule::<ApprovalWorkflow>(approval(60_000), Some("restart-event".to_string()))
        .await
        .unwrap();
    wait_for_status(&first.client(), &id, WorkflowStatus::Waiting).await;
    first.shutdown().await.unwrap();

    let second = start_runtime(store.clone()).await;
    let client = second.client();
    client
        .raise_event(&id, "approved", json!({ "approved": true }))
        .await
        .unwrap();

    let instance = client
        .wait_for_completion(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(instance.status, WorkflowStatus::Completed);
    let output = instance.output.unwrap();
    assert_eq!(output["approved"], json!(true));
    assert_eq!(output["prepared"], json!({ "prepared": "refund" }));

    second.shutdown().await.unwrap();
}
