//! HTTP API for health checks and Prometheus metrics

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use exporter_lib::{
    exposition::{self, CONTENT_TYPE},
    health::{ComponentStatus, HealthRegistry},
    Orchestrator,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub health_registry: HealthRegistry,
    pub extra_labels: BTreeMap<String, String>,
    pub telemetry_path: String,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        health_registry: HealthRegistry,
        telemetry_path: impl Into<String>,
    ) -> Self {
        Self {
            orchestrator,
            health_registry,
            extra_labels: BTreeMap::new(),
            telemetry_path: telemetry_path.into(),
        }
    }

    pub fn with_extra_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.extra_labels = labels;
        self
    }
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint. Every request runs one scrape.
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.orchestrator.scrape().await;

    match exposition::encode_text(&snapshot, &state.extra_labels) {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode metrics: {e}"),
            )
                .into_response()
        }
    }
}

async fn landing(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(format!(
        "<html>\n<head><title>Libvirt Exporter</title></head>\n<body>\n\
         <h1>Libvirt Exporter</h1>\n\
         <p><a href=\"{path}\">Metrics</a></p>\n\
         <p><a href=\"/healthz\">Health</a> | <a href=\"/readyz\">Readiness</a></p>\n\
         </body>\n</html>\n",
        path = state.telemetry_path
    ))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(&state.telemetry_path, get(metrics))
        .with_state(state)
}

/// Serve the API until `shutdown` resolves
pub async fn serve(
    listen_address: &str,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(listen_address)
        .await
        .with_context(|| format!("Failed to bind {listen_address}"))?;
    info!(addr = %listen_address, "Starting API server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
