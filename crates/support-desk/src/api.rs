// Support ticket HTTP routes

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use agentflow_durable::prelude::*;

use crate::activities::ExpertAnalysis;
use crate::analyses::AnalysisStore;
use crate::customers::{Customer, CustomerDirectory, SystemInfo};
use crate::workflow::{SupportTicket, SupportTicketWorkflow, SOLUTION_APPROVED};

/// Workflow instance id for a ticket
pub fn instance_id(ticket_id: &str) -> String {
    format!("support-{ticket_id}")
}

/// Request to open a support ticket
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTicketRequest {
    pub ticket_id: String,
    pub customer_id: String,
    pub description: String,
    /// Review window, defaults to 30 seconds
    #[serde(default)]
    pub approval_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketCreatedResponse {
    pub instance_id: String,
    pub ticket_id: String,
    pub status: String,
}

/// Support team review of the proposed solution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApproveSolutionRequest {
    #[serde(default)]
    pub final_solution: Option<String>,
    #[serde(default)]
    pub support_notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSentResponse {
    pub status: String,
    pub ticket_id: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketStatusResponse {
    pub ticket_id: String,
    pub instance_id: String,
    pub status: WorkflowStatus,
    pub output: Option<Value>,
    pub error: Option<WorkflowError>,
}

/// A keyed record in the data listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataEntry<T> {
    pub key: String,
    pub data: T,
}

impl<T> DataEntry<T> {
    fn new(key: impl Into<String>, data: T) -> Self {
        Self {
            key: key.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataListing {
    pub customers: Vec<DataEntry<Customer>>,
    pub systems: Vec<DataEntry<SystemInfo>>,
    pub analysis: Vec<DataEntry<ExpertAnalysis>>,
    pub tickets: Vec<DataEntry<WorkflowInstance>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataCounts {
    pub customers: usize,
    pub systems: usize,
    pub analysis: usize,
    pub tickets: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataResponse {
    pub status: String,
    pub counts: DataCounts,
    pub data: DataListing,
}

/// App state for support routes
#[derive(Clone)]
pub struct AppState {
    pub client: WorkflowClient,
    pub directory: Arc<CustomerDirectory>,
    pub analyses: Arc<AnalysisStore>,
}

impl AppState {
    pub fn new(
        client: WorkflowClient,
        directory: Arc<CustomerDirectory>,
        analyses: Arc<AnalysisStore>,
    ) -> Self {
        Self {
            client,
            directory,
            analyses,
        }
    }
}

/// Create support routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/support/ticket", post(create_ticket))
        .route("/support/approve/:ticket_id", post(approve_solution))
        .route("/support/status/:ticket_id", get(get_ticket_status))
        .route("/data", get(list_data))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// POST /support/ticket - Start the support workflow for a ticket
pub async fn create_ticket(
    State(state): State<AppState>,
    Json(req): Json<CreateTicketRequest>,
) -> Result<(StatusCode, Json<TicketCreatedResponse>), StatusCode> {
    if req.ticket_id.trim().is_empty() || req.customer_id.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let mut ticket = SupportTicket::new(&req.ticket_id, req.customer_id, req.description);
    if let Some(secs) = req.approval_timeout_secs {
        ticket = ticket.with_approval_timeout(std::time::Duration::from_secs(secs));
    }

    let instance_id = state
        .client
        .schedule::<SupportTicketWorkflow>(ticket, Some(instance_id(&req.ticket_id)))
        .await
        .map_err(|e| match e {
            ClientError::AlreadyExists(_) => StatusCode::CONFLICT,
            e => {
                tracing::error!("Failed to start support workflow: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })?;

    tracing::info!(ticket_id = %req.ticket_id, %instance_id, "Support workflow started");
    Ok((
        StatusCode::CREATED,
        Json(TicketCreatedResponse {
            instance_id,
            ticket_id: req.ticket_id,
            status: "workflow_started".to_string(),
        }),
    ))
}

/// POST /support/approve/:ticket_id - Approve the proposed solution
///
/// The body is optional; missing fields fall back to the workflow defaults.
/// Approvals that arrive before the workflow starts waiting are buffered.
pub async fn approve_solution(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    body: Option<Json<ApproveSolutionRequest>>,
) -> Result<Json<ApprovalSentResponse>, StatusCode> {
    let Json(req) = body.unwrap_or_default();
    let instance_id = instance_id(&ticket_id);
    let payload = json!({
        "approved": true,
        "final_solution": req.final_solution,
        "support_notes": req.support_notes,
    });

    let delivered = state
        .client
        .raise_event(&instance_id, SOLUTION_APPROVED, payload)
        .await
        .map_err(|e| match e {
            ClientError::NotFound(_) => StatusCode::NOT_FOUND,
            e => {
                tracing::error!("Failed to raise approval: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })?;

    // The workflow already finished, most likely through the review timeout
    if !delivered {
        return Err(StatusCode::CONFLICT);
    }

    Ok(Json(ApprovalSentResponse {
        status: "approval_sent".to_string(),
        ticket_id,
        instance_id,
    }))
}

/// GET /support/status/:ticket_id - Current workflow status and result
pub async fn get_ticket_status(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
) -> Result<Json<TicketStatusResponse>, StatusCode> {
    let instance = state
        .client
        .get_status(&instance_id(&ticket_id))
        .await
        .map_err(|e| match e {
            ClientError::NotFound(_) => StatusCode::NOT_FOUND,
            e => {
                tracing::error!("Failed to get ticket status: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })?;

    Ok(Json(TicketStatusResponse {
        ticket_id,
        instance_id: instance.id,
        status: instance.status,
        output: instance.output,
        error: instance.error,
    }))
}

/// GET /data - Customers, systems, stored analyses and support tickets
pub async fn list_data(State(state): State<AppState>) -> Result<Json<DataResponse>, StatusCode> {
    let instances = state.client.list_instances(None).await.map_err(|e| {
        tracing::error!("Failed to list support tickets: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let mut customers = vec![];
    let mut systems = vec![];
    for (customer, system) in state.directory.entries() {
        customers.push(DataEntry::new(&customer.customer_id, customer.clone()));
        if let Some(system) = system {
            systems.push(DataEntry::new(&customer.customer_id, system.clone()));
        }
    }

    let analysis: Vec<_> = state
        .analyses
        .list()
        .into_iter()
        .map(|(key, analysis)| DataEntry::new(key, analysis))
        .collect();

    let tickets: Vec<_> = instances
        .into_iter()
        .filter(|instance| instance.workflow_type == SupportTicketWorkflow::TYPE)
        .map(|instance| DataEntry::new(instance.id.clone(), instance))
        .collect();

    Ok(Json(DataResponse {
        status: "success".to_string(),
        counts: DataCounts {
            customers: customers.len(),
            systems: systems.len(),
            analysis: analysis.len(),
            tickets: tickets.len(),
        },
        data: DataListing {
            customers,
            systems,
            analysis,
            tickets,
        },
    }))
}
