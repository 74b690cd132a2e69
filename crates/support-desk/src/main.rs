use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use agentflow_durable::{HistoryStore, InMemoryHistoryStore, PostgresHistoryStore};
use agentflow_support_desk::{
    routes, start_runtime, AnalysisStore, AppState, CustomerDirectory, SupportDeskConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure logging via environment variables:
    // - RUST_LOG: full filter directive
    // - LOG_LEVEL: level for the support desk itself (default: "debug")
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        EnvFilter::new(format!(
            "agentflow_support_desk={log_level},agentflow_durable=info,tower_http=debug"
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("agentflow-support-desk starting...");

    let config = SupportDeskConfig::from_env().context("Invalid configuration")?;

    let store: Arc<dyn HistoryStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresHistoryStore::connect(url)
                .await
                .context("Failed to connect to database")?;
            store.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Using PostgreSQL history store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, workflow history is kept in memory");
            Arc::new(InMemoryHistoryStore::new())
        }
    };

    let directory = Arc::new(CustomerDirectory::with_sample_data());
    let analyses = Arc::new(AnalysisStore::new());
    let runtime = start_runtime(
        store,
        config.runtime.clone(),
        directory.clone(),
        analyses.clone(),
    )
    .await
    .context("Failed to start durable runtime")?;

    let app = routes(AppState::new(runtime.client(), directory, analyses))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("HTTP server listening on {}", config.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Received shutdown signal");
        })
        .await
        .context("Server error")?;

    runtime
        .shutdown()
        .await
        .context("Durable runtime did not stop cleanly")?;

    tracing::info!("Support desk shutdown complete");
    Ok(())
}
