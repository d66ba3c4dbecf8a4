//! HTTP API for health checks, Prometheus metrics and discovery state

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use discovery_lib::{
    health::{components, ComponentHealth, ComponentStatus, HealthRegistry},
    ConfigHandler, Discoverer, Leadership, LeadershipGate, RuleSummary, TargetSummary,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub node_name: String,
    pub health_registry: HealthRegistry,
    pub discoverer: Arc<Discoverer>,
    pub leadership: Arc<Leadership>,
    pub config: Arc<ConfigHandler>,
}

/// Filters for the targets endpoint
#[derive(Debug, Default, Deserialize)]
pub struct TargetQuery {
    /// Plugin type, for example `prometheus` or `telegraf/redis`
    #[serde(rename = "type")]
    pub plugin_type: Option<String>,
    pub namespace: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_name: String,
    pub daemon: bool,
    pub leading: bool,
    pub leader: String,
    pub rules: usize,
    pub targets: usize,
    pub runtime_sources: usize,
    /// Registered targets per registry
    pub registries: BTreeMap<String, usize>,
}

/// Health check response - returns 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state
        .health_registry
        .update(
            components::LEADERSHIP,
            ComponentHealth::of_leadership(&state.leadership),
        )
        .await;
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(error = %e, "failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

async fn targets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TargetQuery>,
) -> Json<Vec<TargetSummary>> {
    let targets = state
        .discoverer
        .targets()
        .into_iter()
        .filter(|t| query.plugin_type.as_ref().map_or(true, |p| &t.plugin_type == p))
        .filter(|t| {
            query
                .namespace
                .as_ref()
                .map_or(true, |ns| t.config.tags().get("namespace") == Some(ns))
        })
        .collect();
    Json(targets)
}

async fn rules(State(state): State<Arc<AppState>>) -> Json<Vec<RuleSummary>> {
    Json(state.discoverer.rules())
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let registries = state
        .discoverer
        .registries()
        .all()
        .into_iter()
        .map(|r| (r.name().to_string(), r.count()))
        .collect();

    Json(StatusResponse {
        node_name: state.node_name.clone(),
        daemon: state.leadership.daemon(),
        leading: state.leadership.leading(),
        leader: state.leadership.leader(),
        rules: state.discoverer.count(),
        targets: state.discoverer.targets().len(),
        runtime_sources: state.config.runtime_sources(),
        registries,
    })
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/targets", get(targets))
        .route("/api/v1/rules", get(rules))
        .route("/api/v1/status", get(status))
        .with_state(state)
}

/// Serve the API until shutdown
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
