//! Support ticket scenarios through the HTTP routes and the workflow client

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use agentflow_durable::prelude::*;
use agentflow_durable::worker::PollerConfig;
use agentflow_support_desk::activities::{self, CustomerNotificationActivity};
use agentflow_support_desk::{
    routes, start_runtime, AnalysisStore, AppState, CustomerDirectory, SupportTicket,
    SupportTicketWorkflow,
};

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

async fn start() -> (DurableRuntime, AppState) {
    let directory = Arc::new(CustomerDirectory::with_sample_data());
    let analyses = Arc::new(AnalysisStore::new());
    let runtime = start_runtime(
        Arc::new(InMemoryHistoryStore::new()),
        test_config(),
        directory.clone(),
        analyses.clone(),
    )
    .await
    .expect("runtime starts");
    let state = AppState::new(runtime.client(), directory, analyses);
    (runtime, state)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn wait_for_status(client: &WorkflowClient, id: &str, status: WorkflowStatus) {
    for _ in 0..200 {
        if client.get_status(id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{id} never reached {status:?}");
}

#[test_log::test(tokio::test)]
async fn test_ticket_without_review_times_out() {
    let (runtime, _) = start().await;
    let client = runtime.client();

    let ticket = SupportTicket::new("T1", "CUST001", "Sidecar connection timeout to state store")
        .with_approval_timeout(Duration::from_millis(100));
    let id = client
        .schedule::<SupportTicketWorkflow>(ticket, Some("support-T1".to_string()))
        .await
        .unwrap();

    let instance = client
        .wait_for_completion(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(instance.status, WorkflowStatus::Completed);

    let output = instance.output.unwrap();
    assert_eq!(output["status"], "completed");
    assert_eq!(output["ticket_id"], "T1");
    assert_eq!(output["triage_result"]["has_entitlement"], true);
    assert_eq!(output["expert_result"]["topic"], "connection");
    assert_eq!(output["final_solution"]["approved"], false);
    assert_eq!(
        output["final_solution"]["support_notes"],
        "Case requires additional review time"
    );
    assert_eq!(output["notification_result"]["status"], "customer_notified");

    runtime.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_approval_over_http_beats_timeout() {
    let (runtime, state) = start().await;
    let client = runtime.client();
    let app = routes(state);

    let (status, body) = send(
        &app,
        "POST",
        "/support/ticket",
        Some(json!({
            "ticket_id": "T2",
            "customer_id": "CUST002",
            "description": "Invalid component YAML",
            "approval_timeout_secs": 60,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["instance_id"], "support-T2");
    assert_eq!(body["status"], "workflow_started");

    wait_for_status(&client, "support-T2", WorkflowStatus::Waiting).await;

    let (status, body) = send(
        &app,
        "POST",
        "/support/approve/T2",
        Some(json!({ "final_solution": "Fix the component metadata" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "approval_sent");

    let instance = client
        .wait_for_completion("support-T2", Duration::from_secs(5))
        .await
        .unwrap();
    let output = instance.output.unwrap();
    assert_eq!(output["final_solution"]["approved"], true);
    assert_eq!(output["final_solution"]["final_solution"], "Fix the component metadata");
    assert_eq!(output["final_solution"]["support_notes"], "Reviewed by support team");

    let (status, body) = send(&app, "GET", "/support/status/T2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["output"]["status"], "completed");

    // Reviewing a finished ticket is a conflict
    let (status, _) = send(&app, "POST", "/support/approve/T2", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    runtime.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_early_approval_is_buffered() {
    let (runtime, state) = start().await;
    let client = runtime.client();
    let app = routes(state);

    let (status, _) = send(
        &app,
        "POST",
        "/support/ticket",
        Some(json!({
            "ticket_id": "T3",
            "customer_id": "CUST001",
            "description": "Upgrade broke compatibility",
            "approval_timeout_secs": 60,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // No body: the workflow falls back to its defaults
    let (status, _) = send(&app, "POST", "/support/approve/T3", None).await;
    assert_eq!(status, StatusCode::OK);

    let instance = client
        .wait_for_completion("support-T3", Duration::from_secs(5))
        .await
        .unwrap();
    let output = instance.output.unwrap();
    assert_eq!(output["final_solution"]["approved"], true);
    assert_eq!(output["final_solution"]["final_solution"], "Solution approved");

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_customer_without_entitlement() {
    let (runtime, _) = start().await;
    let client = runtime.client();

    let id = client
        .schedule::<SupportTicketWorkflow>(SupportTicket::new("T4", "CUST003", "help"), None)
        .await
        .unwrap();
    let instance = client
        .wait_for_completion(&id, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.output.unwrap()["status"], "no_entitlement");

    let history = client.get_history(&id).await.unwrap();
    assert!(history
        .iter()
        .all(|r| r.event.activity_id() != Some("expert_analysis")));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_customer_is_setup_error() {
    let (runtime, _) = start().await;
    let client = runtime.client();

    let id = client
        .schedule::<SupportTicketWorkflow>(SupportTicket::new("T5", "CUST999", "help"), None)
        .await
        .unwrap();
    let instance = client
        .wait_for_completion(&id, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    let output = instance.output.unwrap();
    assert_eq!(output["status"], "setup_error");
    assert_eq!(output["ticket_id"], "T5");
    assert!(output["error"]
        .as_str()
        .unwrap()
        .starts_with("Customer data not found for CUST999"));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_notification_is_partial_success() {
    let mut registry = activities::registry(
        Arc::new(CustomerDirectory::with_sample_data()),
        Arc::new(AnalysisStore::new()),
    );
    registry.register_fn(CustomerNotificationActivity::TYPE, |_ctx, _input| async {
        Err::<Value, _>(ActivityError::non_retryable("mail relay unavailable"))
    });
    let runtime = DurableRuntime::builder(Arc::new(InMemoryHistoryStore::new()))
        .register_workflow::<SupportTicketWorkflow>()
        .with_activities(registry)
        .with_config(test_config())
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let ticket = SupportTicket::new("T7", "CUST002", "Version upgrade failed")
        .with_approval_timeout(Duration::from_millis(50));
    let id = client
        .schedule::<SupportTicketWorkflow>(ticket, None)
        .await
        .unwrap();
    let instance = client
        .wait_for_completion(&id, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(instance.status, WorkflowStatus::Completed);
    let output = instance.output.unwrap();
    assert_eq!(output["status"], "partial_success");
    assert_eq!(
        output["error"],
        "Customer notification failed: mail relay unavailable"
    );
    assert_eq!(output["final_solution"]["approved"], false);

    runtime.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_data_lists_customers_analyses_and_tickets() {
    let (runtime, state) = start().await;
    let client = runtime.client();
    let app = routes(state);

    let (status, body) = send(&app, "GET", "/data", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["counts"]["customers"], 3);
    assert_eq!(body["counts"]["systems"], 2);
    assert_eq!(body["counts"]["analysis"], 0);
    assert_eq!(body["counts"]["tickets"], 0);
    assert_eq!(body["data"]["customers"][0]["key"], "CUST001");
    assert_eq!(body["data"]["systems"][1]["data"]["cloud_provider"], "AWS");

    let (status, _) = send(
        &app,
        "POST",
        "/support/ticket",
        Some(json!({
            "ticket_id": "T8",
            "customer_id": "CUST001",
            "description": "Component YAML rejected",
            "approval_timeout_secs": 60,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    wait_for_status(&client, "support-T8", WorkflowStatus::Waiting).await;

    let (_, body) = send(&app, "GET", "/data", None).await;
    assert_eq!(body["counts"]["analysis"], 1);
    assert_eq!(body["counts"]["tickets"], 1);
    assert_eq!(body["data"]["analysis"][0]["key"], "analysis-T8");
    assert_eq!(body["data"]["analysis"][0]["data"]["topic"], "configuration");
    assert_eq!(body["data"]["tickets"][0]["key"], "support-T8");
    assert_eq!(body["data"]["tickets"][0]["data"]["status"], "waiting");

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_http_errors() {
    let (runtime, state) = start().await;
    let app = routes(state);

    let ticket = json!({
        "ticket_id": "T6",
        "customer_id": "CUST001",
        "description": "timeout",
    });
    let (status, _) = send(&app, "POST", "/support/ticket", Some(ticket.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = send(&app, "POST", "/support/ticket", Some(ticket)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &app,
        "POST",
        "/support/ticket",
        Some(json!({ "ticket_id": " ", "customer_id": "CUST001", "description": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "GET", "/support/status/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "POST", "/support/approve/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);

    runtime.shutdown().await.unwrap();
}
