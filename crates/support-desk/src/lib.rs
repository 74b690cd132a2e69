//! Customer support desk on the agentflow durable engine
//!
//! Tickets opened over HTTP start a [`SupportTicketWorkflow`]: triage, expert
//! analysis, a support team review raced against a deadline and a customer
//! notification. The review arrives as the `solution_approved` external event.

pub mod activities;
pub mod analyses;
pub mod api;
pub mod config;
pub mod customers;
pub mod workflow;

use std::sync::Arc;

use agentflow_durable::{DurableRuntime, HistoryStore, RuntimeConfig, RuntimeError};

pub use analyses::AnalysisStore;
pub use api::{routes, AppState};
pub use config::{ConfigError, SupportDeskConfig};
pub use customers::CustomerDirectory;
pub use workflow::{FinalSolution, SupportTicket, SupportTicketWorkflow, SOLUTION_APPROVED};

/// Start a durable runtime with the support workflow and agents registered
///
/// The expert agent saves its analyses into `analyses`.
pub async fn start_runtime(
    store: Arc<dyn HistoryStore>,
    config: RuntimeConfig,
    directory: Arc<CustomerDirectory>,
    analyses: Arc<AnalysisStore>,
) -> Result<DurableRuntime, RuntimeError> {
    DurableRuntime::builder(store)
        .register_workflow::<SupportTicketWorkflow>()
        .with_activities(activities::registry(directory, analyses))
        .with_config(config)
        .start()
        .await
}
