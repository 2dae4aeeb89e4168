//! HTTP surface for the dispatch engine.
//!
//! Deliberately thin: every route delegates straight to the dispatcher or
//! the registry, and all policy lives below this layer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::classifier::{ClassifierConfig, HttpReasoningClient, IntentClassifier};
use crate::dispatcher::{DispatchRequest, Dispatcher, DispatcherConfig};
use crate::error::DispatchError;
use crate::memory::{ConversationMemory, ShortTermCache};
use crate::registry::{AgentRegistry, HealthMonitor};
use crate::settings::Settings;
use crate::worker::{HttpWorkerClient, WorkerClient};

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<AgentRegistry>,
}

/// Create the HTTP router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(service_health))
        .route("/api/registry", get(list_registry))
        .route("/api/agents/:id/health", get(agent_health))
        .route("/api/request", post(submit_request))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Service liveness endpoint
#[instrument(skip(state))]
async fn service_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "agent_count": state.registry.len(),
    }))
}

/// List all registered agents with their live status
#[instrument(skip(state))]
async fn list_registry(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "agents": state.registry.list() }))
}

/// Live status of a single agent
#[instrument(skip(state))]
async fn agent_health(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id) {
        Some(agent) => Json(json!({ "agent_id": agent.id, "status": agent.status })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "status": "error",
                "code": "unknown_agent",
                "message": format!("agent '{id}' not found in registry"),
            })),
        )
            .into_response(),
    }
}

/// Dispatch entry point
#[instrument(skip(state, payload), fields(user_id = %payload.user_id))]
async fn submit_request(
    State(state): State<AppState>,
    Json(payload): Json<DispatchRequest>,
) -> Response {
    match state.dispatcher.dispatch(payload).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: DispatchError) -> Response {
    let status = match &err {
        DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        DispatchError::UnknownAgent(_) => StatusCode::NOT_FOUND,
        DispatchError::NoHealthyAgent(_) => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::Forwarding { .. } => StatusCode::BAD_GATEWAY,
    };

    (
        status,
        Json(json!({
            "status": "error",
            "code": err.code(),
            "message": err.to_string(),
        })),
    )
        .into_response()
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|origin| origin == "*") {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Start the HTTP server, the health monitor, and wait for shutdown.
pub async fn serve(settings: Settings) -> Result<()> {
    let registry = Arc::new(AgentRegistry::load(&settings.registry.manifest_path)?);

    let worker: Arc<dyn WorkerClient> = Arc::new(HttpWorkerClient::new(
        Duration::from_secs(settings.registry.probe_timeout_seconds),
        Duration::from_secs(settings.dispatcher.forward_timeout_seconds),
    )?);

    if settings.classifier.api_key.is_none() {
        warn!("No classifier API key configured; the reasoning endpoint is called unauthenticated");
    }
    let reasoning = Arc::new(HttpReasoningClient::new(
        settings.classifier.base_url.clone(),
        settings.classifier.model.clone(),
        settings.classifier.api_key.clone(),
        Duration::from_secs(settings.classifier.request_timeout_seconds),
    )?);

    let classifier = IntentClassifier::new(
        reasoning,
        ClassifierConfig {
            fallback_agent_id: settings.dispatcher.fallback_agent_id.clone(),
            confidence_threshold: settings.classifier.confidence_threshold,
            min_acceptable_confidence: settings.classifier.min_acceptable_confidence,
            context_turns: settings.classifier.context_turns,
        },
    );

    let memory = Arc::new(ConversationMemory::new(settings.memory.max_history_per_user));
    let cache = Arc::new(ShortTermCache::new(settings.memory.short_term_cache_size));

    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        memory,
        cache,
        classifier,
        worker.clone(),
        DispatcherConfig {
            fallback_agent_id: settings.dispatcher.fallback_agent_id.clone(),
            max_clarification_attempts: settings.dispatcher.max_clarification_attempts,
            recent_lookback: settings.dispatcher.recent_lookback,
        },
    ));

    // Probe loop runs independently of request traffic from here on.
    let monitor = HealthMonitor::start(
        registry.clone(),
        worker,
        Duration::from_secs(settings.registry.health_check_interval_seconds),
    );

    let state = AppState {
        dispatcher,
        registry,
    };
    let mut app = create_router(state);
    if settings.server.enable_cors {
        app = app.layer(cors_layer(&settings.server.cors_origins));
    }

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    monitor.shutdown().await;
    info!("HTTP server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C)
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), shutting down gracefully");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down gracefully");
    }
}
