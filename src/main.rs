//! Calendar agent - conversational assistant over a user's calendar
//!
//! Every user message runs through a validator, an agent and a tool loop
//! driven by a pure state machine; progress streams back over SSE.

mod api;
mod calendar;
mod config;
mod db;
mod decoder;
mod llm;
mod runtime;
mod state_machine;
mod system_prompt;
mod telemetry;
mod tools;

use api::{create_router, AppState};
use calendar::google::GoogleCalendar;
use config::AppConfig;
use db::Database;
use llm::ModelRegistry;
use runtime::{DatabaseStorage, RegistryLlmClient, RuntimeManager, ToolRegistryExecutor};
use std::net::SocketAddr;
use std::sync::Arc;
use telemetry::Telemetry;
use tools::{ToolKind, ToolRegistry};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env();
    let telemetry = Arc::new(Telemetry::init(config.log_format));

    // Ensure database directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(&config.db_path)?;

    // Interrupted turns are repaired lazily when the conversation is next used
    let in_flight = db.list_in_flight()?;
    if !in_flight.is_empty() {
        tracing::warn!(
            count = in_flight.len(),
            conversations = ?in_flight,
            "Found turns interrupted by the last shutdown"
        );
    }

    let llm_registry = Arc::new(ModelRegistry::new(&config.llm));
    if llm_registry.has_models() {
        tracing::info!(
            models = ?llm_registry.available_models(),
            default = %llm_registry.default_model_id(),
            "LLM registry initialized"
        );
    } else {
        tracing::warn!("No LLM configured. Set OPENAI_API_KEY or LLM_GATEWAY.");
    }
    let model_id = llm_registry.default_model_id().to_string();

    let calendar = GoogleCalendar::new(
        config.calendar.token.clone(),
        config.calendar.api_base.clone(),
        config.calendar.people_base.clone(),
    )?;
    if !calendar.is_configured() {
        tracing::warn!("GOOGLE_CALENDAR_TOKEN not set; calendar tools will fail");
    }

    let tools = ToolRegistry::from_kinds(&config.turn.tools);
    tracing::info!(
        tools = ?config.turn.tools.iter().copied().map(ToolKind::name).collect::<Vec<_>>(),
        validator = config.turn.validator_enabled,
        tool_budget = config.turn.tool_budget,
        "Agent configured"
    );

    let runtime = RuntimeManager::new(
        Arc::new(DatabaseStorage::new(db.clone())),
        Arc::new(RegistryLlmClient::new(llm_registry, model_id)),
        Arc::new(ToolRegistryExecutor::new(tools, Arc::new(calendar))),
        config.turn.clone(),
        telemetry.clone(),
    )
    .with_timeouts(config.timeouts);

    let state = AppState::new(Arc::new(runtime), db);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state)
        .layer(cors)
        .layer(compression)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "Calendar agent listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    telemetry.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
