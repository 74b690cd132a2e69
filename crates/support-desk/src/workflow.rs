//! The customer support ticket workflow
//!
//! ```text
//! triage ──▶ expert_analysis ──▶ race(solution_approved, approval timeout) ──▶ customer_notification
//!    │
//!    └── no entitlement: complete early
//! ```
//!
//! Every outcome completes the instance with a JSON result whose `status`
//! field tells the branches apart:
//!
//! | status | when |
//! |--------|------|
//! | `completed` | the customer was notified |
//! | `no_entitlement` | the customer's plan has no support |
//! | `setup_error` | the customer is missing from the directory |
//! | `partial_success` | everything but the notification succeeded |
//! | `failed` | triage or expert analysis failed |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use agentflow_durable::prelude::*;

use crate::activities::{
    CustomerNotificationActivity, ExpertAnalysisActivity, TriageActivity, TriageResult,
    CUSTOMER_NOT_FOUND,
};

/// Event raised by the support team when a solution has been reviewed
pub const SOLUTION_APPROVED: &str = "solution_approved";

/// How long the workflow waits for a review before answering the customer anyway
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(30);

const TRIAGE: &str = "triage";
const ANALYSIS: &str = "expert_analysis";
const NOTIFICATION: &str = "customer_notification";
const APPROVAL_WAIT: &str = "approval";
const APPROVAL_TIMER: &str = "approval_timeout";
const APPROVAL_RACE: &str = "approval_decision";

fn default_approval_timeout_ms() -> u64 {
    DEFAULT_APPROVAL_TIMEOUT.as_millis() as u64
}

/// A ticket opened by a customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportTicket {
    pub ticket_id: String,
    pub customer_id: String,
    pub description: String,

    /// Review window in milliseconds
    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,
}

impl SupportTicket {
    pub fn new(
        ticket_id: impl Into<String>,
        customer_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            customer_id: customer_id.into(),
            description: description.into(),
            approval_timeout_ms: default_approval_timeout_ms(),
        }
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

/// Payload of the [`SOLUTION_APPROVED`] event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolutionApproval {
    #[serde(default)]
    pub final_solution: Option<String>,
    #[serde(default)]
    pub support_notes: Option<String>,
}

/// The answer the customer gets, approved or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalSolution {
    pub ticket_id: String,
    pub final_solution: String,
    pub support_notes: String,
    pub approved: bool,
}

impl FinalSolution {
    pub fn approved(
        ticket_id: impl Into<String>,
        final_solution: Option<String>,
        support_notes: Option<String>,
    ) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            final_solution: final_solution.unwrap_or_else(|| "Solution approved".to_string()),
            support_notes: support_notes.unwrap_or_else(|| "Reviewed by support team".to_string()),
            approved: true,
        }
    }

    pub fn timed_out(ticket_id: impl Into<String>) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            final_solution: "Your case is still under review by our support team".to_string(),
            support_notes: "Case requires additional review time".to_string(),
            approved: false,
        }
    }
}

/// Triage, expert analysis, human review with a deadline, customer notification
pub struct SupportTicketWorkflow {
    ticket: SupportTicket,
    triage_result: Option<Value>,
    expert_result: Option<Value>,
    final_solution: Option<FinalSolution>,
}

impl SupportTicketWorkflow {
    fn failed(&self, error: impl Into<String>) -> Vec<WorkflowAction> {
        vec![WorkflowAction::complete(json!({
            "status": "failed",
            "ticket_id": self.ticket.ticket_id,
            "error": error.into(),
        }))]
    }

    fn on_triaged(&mut self, result: Value) -> Vec<WorkflowAction> {
        let triage: TriageResult = match serde_json::from_value(result.clone()) {
            Ok(triage) => triage,
            Err(e) => return self.failed(format!("Triage failed: {e}")),
        };
        self.triage_result = Some(result.clone());

        if !triage.has_entitlement {
            return vec![WorkflowAction::complete(json!({
                "status": "no_entitlement",
                "message": "Customer does not have support entitlement",
                "ticket_id": self.ticket.ticket_id,
            }))];
        }

        vec![WorkflowAction::schedule_activity(
            ANALYSIS,
            ExpertAnalysisActivity::TYPE,
            result,
        )]
    }

    fn on_analysed(&mut self, result: Value) -> Vec<WorkflowAction> {
        self.expert_result = Some(result);

        let timeout = Duration::from_millis(self.ticket.approval_timeout_ms);
        vec![
            WorkflowAction::wait_for_event(APPROVAL_WAIT, SOLUTION_APPROVED),
            WorkflowAction::timer(APPROVAL_TIMER, timeout),
            WorkflowAction::wait_for_any(
                APPROVAL_RACE,
                vec![Awaitable::event(APPROVAL_WAIT), Awaitable::timer(APPROVAL_TIMER)],
            ),
        ]
    }

    fn notify(&mut self, solution: FinalSolution) -> Vec<WorkflowAction> {
        let input = match serde_json::to_value(&solution) {
            Ok(input) => input,
            Err(e) => return self.failed(format!("Customer notification failed: {e}")),
        };
        self.final_solution = Some(solution);

        vec![WorkflowAction::schedule_activity(
            NOTIFICATION,
            CustomerNotificationActivity::TYPE,
            input,
        )]
    }
}

impl Workflow for SupportTicketWorkflow {
    const TYPE: &'static str = "customer_support";
    type Input = SupportTicket;

    fn new(ticket: Self::Input) -> Self {
        Self {
            ticket,
            triage_result: None,
            expert_result: None,
            final_solution: None,
        }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        vec![WorkflowAction::schedule_activity(
            TRIAGE,
            TriageActivity::TYPE,
            json!({
                "ticket_id": self.ticket.ticket_id,
                "customer_id": self.ticket.customer_id,
                "description": self.ticket.description,
            }),
        )]
    }

    fn on_activity_completed(&mut self, activity_id: &str, result: Value) -> Vec<WorkflowAction> {
        match activity_id {
            TRIAGE => self.on_triaged(result),
            ANALYSIS => self.on_analysed(result),
            NOTIFICATION => vec![WorkflowAction::complete(json!({
                "status": "completed",
                "ticket_id": self.ticket.ticket_id,
                "triage_result": self.triage_result,
                "expert_result": self.expert_result,
                "notification_result": result,
                "final_solution": self.final_solution,
            }))],
            other => self.failed(format!("unexpected activity completion: {other}")),
        }
    }

    fn on_activity_failed(&mut self, activity_id: &str, error: &ActivityError) -> Vec<WorkflowAction> {
        match activity_id {
            TRIAGE if error.error_type.as_deref() == Some(CUSTOMER_NOT_FOUND) => {
                vec![WorkflowAction::complete(json!({
                    "status": "setup_error",
                    "error": format!(
                        "Customer data not found for {}. Load the customer directory first.",
                        self.ticket.customer_id
                    ),
                    "ticket_id": self.ticket.ticket_id,
                }))]
            }
            // The solution exists, only the customer update is missing
            NOTIFICATION => vec![WorkflowAction::complete(json!({
                "status": "partial_success",
                "ticket_id": self.ticket.ticket_id,
                "error": format!("Customer notification failed: {}", error.message),
                "final_solution": self.final_solution,
            }))],
            TRIAGE => self.failed(format!("Triage failed: {}", error.message)),
            ANALYSIS => self.failed(format!("Expert analysis failed: {}", error.message)),
            other => self.failed(format!("{other} failed: {}", error.message)),
        }
    }

    fn on_race_resolved(&mut self, _race_id: &str, winner: &Resolution) -> Vec<WorkflowAction> {
        let ticket_id = self.ticket.ticket_id.clone();
        match winner {
            Resolution::EventReceived { event, .. } => {
                let approval: SolutionApproval = event.payload_as().unwrap_or_default();
                self.notify(FinalSolution::approved(
                    ticket_id,
                    approval.final_solution,
                    approval.support_notes,
                ))
            }
            _ => {
                // A late approval must not resurface through on_event
                let mut actions = vec![WorkflowAction::cancel_event_wait(APPROVAL_WAIT)];
                actions.extend(self.notify(FinalSolution::timed_out(ticket_id)));
                actions
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow() -> SupportTicketWorkflow {
        SupportTicketWorkflow::new(SupportTicket::new("T1", "CUST001", "timeout"))
    }

    fn triage(has_entitlement: bool) -> Value {
        json!({
            "ticket_id": "T1",
            "customer_id": "CUST001",
            "customer_name": "Acme Corporation",
            "plan": "Enterprise",
            "has_entitlement": has_entitlement,
            "user_reported_issue": "timeout",
            "system_info": null,
        })
    }

    #[test]
    fn test_ticket_timeout_defaults_to_thirty_seconds() {
        let ticket: SupportTicket = serde_json::from_value(json!({
            "ticket_id": "T1",
            "customer_id": "CUST001",
            "description": "help",
        }))
        .unwrap();
        assert_eq!(ticket.approval_timeout_ms, 30_000);
    }

    #[test]
    fn test_starts_with_triage() {
        let actions = workflow().on_start();
        assert!(matches!(
            &actions[..],
            [WorkflowAction::ScheduleActivity { activity_type, input, .. }]
                if activity_type == "triage" && input["customer_id"] == "CUST001"
        ));
    }

    #[test]
    fn test_no_entitlement_completes_early() {
        let mut wf = workflow();
        let actions = wf.on_activity_completed("triage", triage(false));
        match &actions[..] {
            [WorkflowAction::CompleteWorkflow { result }] => {
                assert_eq!(result["status"], "no_entitlement");
            }
            other => panic!("unexpected actions {other:?}"),
        }
    }

    #[test]
    fn test_analysis_starts_approval_race() {
        let mut wf = workflow();
        wf.on_activity_completed("triage", triage(true));
        let actions = wf.on_activity_completed("expert_analysis", json!({ "topic": "connection" }));

        assert_eq!(actions.len(), 3);
        assert!(matches!(
            &actions[1],
            WorkflowAction::StartTimer { duration, .. } if *duration == DEFAULT_APPROVAL_TIMEOUT
        ));
        assert!(matches!(
            &actions[2],
            WorkflowAction::WaitForAny { members, .. } if members.len() == 2
        ));
    }

    #[test]
    fn test_approval_uses_event_payload() {
        let mut wf = workflow();
        let event = ExternalEvent::new(
            SOLUTION_APPROVED,
            json!({ "approved": true, "final_solution": "Raise the timeout" }),
        );
        let actions = wf.on_race_resolved(
            APPROVAL_RACE,
            &Resolution::EventReceived {
                wait_id: APPROVAL_WAIT.to_string(),
                event,
            },
        );

        let solution = wf.final_solution.clone().unwrap();
        assert!(solution.approved);
        assert_eq!(solution.final_solution, "Raise the timeout");
        assert_eq!(solution.support_notes, "Reviewed by support team");
        assert!(matches!(
            &actions[..],
            [WorkflowAction::ScheduleActivity { activity_type, .. }]
                if activity_type == "customer_notification"
        ));
    }

    #[test]
    fn test_timeout_cancels_approval_wait() {
        let mut wf = workflow();
        let actions = wf.on_race_resolved(
            APPROVAL_RACE,
            &Resolution::TimerFired {
                timer_id: APPROVAL_TIMER.to_string(),
            },
        );

        assert!(!wf.final_solution.clone().unwrap().approved);
        assert!(matches!(
            &actions[0],
            WorkflowAction::CancelEventWait { wait_id } if wait_id == APPROVAL_WAIT
        ));
    }

    #[test]
    fn test_activity_failure_completes_with_failed_status() {
        let mut wf = workflow();
        let actions = wf.on_activity_failed(
            "expert_analysis",
            &ActivityError::non_retryable("knowledge base offline"),
        );
        match &actions[..] {
            [WorkflowAction::CompleteWorkflow { result }] => {
                assert_eq!(result["status"], "failed");
                assert_eq!(result["error"], "Expert analysis failed: knowledge base offline");
            }
            other => panic!("unexpected actions {other:?}"),
        }
    }

    #[test]
    fn test_missing_customer_is_setup_error() {
        let mut wf = workflow();
        let error = ActivityError::non_retryable("customer not found: CUST001")
            .with_type(CUSTOMER_NOT_FOUND);
        let actions = wf.on_activity_failed("triage", &error);
        match &actions[..] {
            [WorkflowAction::CompleteWorkflow { result }] => {
                assert_eq!(result["status"], "setup_error");
                assert_eq!(result["ticket_id"], "T1");
                assert!(result["error"]
                    .as_str()
                    .unwrap()
                    .starts_with("Customer data not found for CUST001"));
            }
            other => panic!("unexpected actions {other:?}"),
        }

        // Other triage errors are plain failures
        let actions = wf.on_activity_failed("triage", &ActivityError::non_retryable("boom"));
        assert!(matches!(
            &actions[..],
            [WorkflowAction::CompleteWorkflow { result }] if result["status"] == "failed"
        ));
    }

    #[test]
    fn test_notification_failure_is_partial_success() {
        let mut wf = workflow();
        wf.on_race_resolved(
            APPROVAL_RACE,
            &Resolution::TimerFired {
                timer_id: APPROVAL_TIMER.to_string(),
            },
        );
        let actions = wf.on_activity_failed(
            "customer_notification",
            &ActivityError::non_retryable("mail relay down"),
        );
        match &actions[..] {
            [WorkflowAction::CompleteWorkflow { result }] => {
                assert_eq!(result["status"], "partial_success");
                assert_eq!(result["error"], "Customer notification failed: mail relay down");
                assert_eq!(result["final_solution"]["approved"], false);
            }
            other => panic!("unexpected actions {other:?}"),
        }
    }
}
