//! Server wiring: shared state, the route table and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agent::{AgentConnector, CliConnector};
use crate::config::Config;
use crate::jobs::{create_job_store, JobOrchestrator, JobStoreKind};
use crate::pipeline::build_executor_registry;
use crate::session::{ActivityBus, ContinuationBridge, SessionRegistry};

use super::jobs;
use super::sessions;
use super::types::HealthResponse;

/// How long workers get to finish their current job on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<SessionRegistry>,
    pub activity: Arc<ActivityBus>,
    pub orchestrator: Arc<JobOrchestrator>,
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let connector: Arc<dyn AgentConnector> = Arc::new(CliConnector::new(
        config.agent_cmd.clone(),
        config.agent_model.clone(),
    ));

    let activity = Arc::new(ActivityBus::new());
    let registry = Arc::new(SessionRegistry::new(
        &config,
        Arc::clone(&connector),
        Arc::clone(&activity),
    ));

    let bridge = Arc::new(ContinuationBridge::new(
        Arc::clone(&registry),
        config.continuation_retry,
        config.continuation_max_attempts,
    ));

    let store_kind = JobStoreKind::from_str(&config.job_store)?;
    let store = create_job_store(store_kind, &config.data_dir.join("jobs")).await?;
    let executors = build_executor_registry(&config);
    let orchestrator = Arc::new(JobOrchestrator::new(
        store,
        executors,
        config.max_concurrent_jobs,
        Some(bridge),
    ));

    // Requeue interrupted jobs before the workers come up so nothing races
    // a half-reset record.
    orchestrator.recover().await?;
    orchestrator.start().await;

    registry.spawn_sweeper(config.sweep_interval);

    let state = Arc::new(AppState {
        config: config.clone(),
        registry,
        activity,
        orchestrator,
    });

    let app = Router::new()
        .route("/api/health", get(health))
        // Session endpoints
        .route("/api/sessions/:id/open", post(sessions::open_session))
        .route("/api/sessions/:id/messages", post(sessions::send_message))
        .route("/api/sessions/:id", get(sessions::session_status))
        .route("/api/sessions/:id", delete(sessions::close_session))
        .route(
            "/api/sessions/:id/activity/stream",
            get(sessions::activity_stream),
        )
        .route("/api/sessions/:id/activity", get(sessions::activity_snapshot))
        // Job endpoints
        .route("/api/jobs", post(jobs::submit_job))
        .route("/api/jobs", get(jobs::list_jobs))
        .route("/api/jobs/:id", get(jobs::get_job))
        .route("/api/jobs/:id/cancel", post(jobs::cancel_job))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    // Setup graceful shutdown on SIGTERM/SIGINT
    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown_state).await;
        })
        .await?;

    Ok(())
}

/// Wait for a shutdown signal, then stop the worker pool.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping job workers...");

    state.orchestrator.shutdown(SHUTDOWN_GRACE).await;

    tracing::info!("Graceful shutdown complete");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        max_concurrent_jobs: state.config.max_concurrent_jobs,
    })
}
