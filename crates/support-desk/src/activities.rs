//! Support agents exposed as durable activities
//!
//! Each agent is a deterministic stand-in for an LLM-backed service: triage
//! checks the customer's entitlement, the expert consults a small knowledge
//! base and the notifier drafts the customer message. Activities may run more
//! than once for one ticket. The only side effect is the expert saving its
//! analysis, which overwrites by ticket.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use agentflow_durable::prelude::*;

use crate::analyses::AnalysisStore;
use crate::customers::{CustomerDirectory, SystemInfo};
use crate::workflow::{FinalSolution, SupportTicket};

/// Error type of a triage for a customer missing from the directory
pub const CUSTOMER_NOT_FOUND: &str = "customer_not_found";

/// Outcome of triaging a ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageResult {
    pub ticket_id: String,
    pub customer_id: String,
    pub customer_name: String,
    pub plan: String,
    pub has_entitlement: bool,
    pub user_reported_issue: String,
    pub system_info: Option<SystemInfo>,
}

/// Expert diagnosis with a proposed fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertAnalysis {
    pub ticket_id: String,
    pub topic: String,
    pub issue_analysis: String,
    pub proposed_solution: String,
    pub confidence_score: f64,
    pub status: String,
}

/// Message sent to the customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationResult {
    pub ticket_id: String,
    pub customer_message: String,
    pub status: String,
}

/// Looks up the customer and their support entitlement
pub struct TriageActivity {
    directory: Arc<CustomerDirectory>,
}

impl TriageActivity {
    pub fn new(directory: Arc<CustomerDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl Activity for TriageActivity {
    const TYPE: &'static str = "triage";
    type Input = SupportTicket;
    type Output = TriageResult;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        ticket: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        debug!(ticket_id = %ticket.ticket_id, attempt = ctx.attempt, "Triaging ticket");

        let customer = self.directory.customer(&ticket.customer_id).ok_or_else(|| {
            ActivityError::non_retryable(format!(
                "customer not found: {}",
                ticket.customer_id
            ))
            .with_type(CUSTOMER_NOT_FOUND)
        })?;

        let result = TriageResult {
            ticket_id: ticket.ticket_id,
            customer_id: customer.customer_id.clone(),
            customer_name: customer.name.clone(),
            plan: customer.plan.clone(),
            has_entitlement: customer.support_entitlement,
            user_reported_issue: ticket.description,
            system_info: self.directory.system_info(&customer.customer_id).cloned(),
        };

        info!(
            ticket_id = %result.ticket_id,
            has_entitlement = result.has_entitlement,
            "Triage completed"
        );
        Ok(result)
    }
}

struct KnowledgeEntry {
    topic: &'static str,
    keywords: &'static [&'static str],
    analysis: &'static str,
    solution: &'static str,
    confidence: f64,
}

const KNOWLEDGE_BASE: &[KnowledgeEntry] = &[
    KnowledgeEntry {
        topic: "connection",
        keywords: &["connection", "connect", "timeout", "refused", "network"],
        analysis: "Connection issues usually stem from network configuration, firewall rules or service discovery",
        solution: "Increase the component connection timeout and verify connectivity to the backing store",
        confidence: 0.88,
    },
    KnowledgeEntry {
        topic: "configuration",
        keywords: &["config", "component", "yaml", "metadata"],
        analysis: "Configuration errors are common in component metadata, connection strings and YAML formatting",
        solution: "Validate the component definition and check that all required metadata fields are present",
        confidence: 0.86,
    },
    KnowledgeEntry {
        topic: "version",
        keywords: &["version", "upgrade", "compatibility"],
        analysis: "Version mismatches between the runtime and its components cause unexpected failures",
        solution: "Check the compatibility matrix and upgrade components to matching versions",
        confidence: 0.73,
    },
];

fn lookup(description: &str) -> &'static KnowledgeEntry {
    let description = description.to_lowercase();
    KNOWLEDGE_BASE
        .iter()
        .find(|entry| entry.keywords.iter().any(|k| description.contains(k)))
        .unwrap_or(&KNOWLEDGE_BASE[0])
}

/// Diagnoses the triaged issue against the knowledge base
pub struct ExpertAnalysisActivity {
    analyses: Arc<AnalysisStore>,
}

impl ExpertAnalysisActivity {
    pub fn new(analyses: Arc<AnalysisStore>) -> Self {
        Self { analyses }
    }
}

#[async_trait]
impl Activity for ExpertAnalysisActivity {
    const TYPE: &'static str = "expert_analysis";
    type Input = TriageResult;
    type Output = ExpertAnalysis;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        triage: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let entry = lookup(&triage.user_reported_issue);

        let mut issue_analysis = entry.analysis.to_string();
        if let Some(system) = &triage.system_info {
            issue_analysis.push_str(&format!(
                " ({} environment on {}, runtime {})",
                system.environment, system.cloud_provider, system.runtime_version
            ));
        }

        let analysis = ExpertAnalysis {
            ticket_id: triage.ticket_id,
            topic: entry.topic.to_string(),
            issue_analysis,
            proposed_solution: entry.solution.to_string(),
            confidence_score: entry.confidence,
            status: "analysis_complete".to_string(),
        };
        let key = self.analyses.save(&analysis);

        info!(
            ticket_id = %analysis.ticket_id,
            topic = entry.topic,
            %key,
            "Expert analysis completed"
        );
        Ok(analysis)
    }
}

/// Drafts the customer update for the reviewed solution
#[derive(Default)]
pub struct CustomerNotificationActivity;

#[async_trait]
impl Activity for CustomerNotificationActivity {
    const TYPE: &'static str = "customer_notification";
    type Input = FinalSolution;
    type Output = NotificationResult;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        solution: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        if !solution.approved {
            warn!(ticket_id = %solution.ticket_id, "Timed out waiting for solution approval");
        }

        let customer_message = if solution.approved {
            format!(
                "Dear Customer, your support ticket {} has been resolved. {} Notes from our team: {}. Thank you for your patience.",
                solution.ticket_id, solution.final_solution, solution.support_notes
            )
        } else {
            format!(
                "Dear Customer, your support ticket {} is being processed. {}. Thank you for your patience.",
                solution.ticket_id, solution.final_solution
            )
        };

        info!(ticket_id = %solution.ticket_id, approved = solution.approved, "Customer notified");
        Ok(NotificationResult {
            ticket_id: solution.ticket_id,
            customer_message,
            status: "customer_notified".to_string(),
        })
    }
}

/// Registry with all support agents
pub fn registry(
    directory: Arc<CustomerDirectory>,
    analyses: Arc<AnalysisStore>,
) -> ActivityRegistry {
    let mut activities = ActivityRegistry::new();
    activities
        .register(TriageActivity::new(directory))
        .register(ExpertAnalysisActivity::new(analyses))
        .register(CustomerNotificationActivity);
    activities
}
