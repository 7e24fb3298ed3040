//! Integration tests for the exporter API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use exporter_lib::{
    health::{components, HealthRegistry},
    testing::{FakeDomainSpec, FakeHypervisor},
    BackoffStrategy, ConnectionGuardian, ExporterState, Orchestrator, ReconnectPolicy,
};
use libvirt_exporter::api::{create_router, AppState};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn test_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        strategy: BackoffStrategy::Linear,
        call_timeout: Duration::from_secs(2),
    }
}

async fn setup_test_app(hv: &FakeHypervisor) -> (Router, Arc<AppState>) {
    let state = Arc::new(ExporterState::new());
    let guardian = ConnectionGuardian::connect(
        "test:///default",
        hv.connector(),
        test_policy(),
        state.clone(),
    )
    .await
    .unwrap();

    let health_registry = HealthRegistry::new();
    health_registry.set_healthy(components::CONNECTION).await;
    health_registry.set_healthy(components::COLLECTOR).await;

    let orchestrator = Orchestrator::builder()
        .guardian(Arc::new(guardian))
        .state(state)
        .health(health_registry.clone())
        .build()
        .unwrap();

    let mut labels = BTreeMap::new();
    labels.insert("site".to_string(), "fra1".to_string());

    let app_state = Arc::new(
        AppState::new(Arc::new(orchestrator), health_registry, "/metrics")
            .with_extra_labels(labels),
    );
    let router = create_router(app_state.clone());

    (router, app_state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Option<String>, String) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let content_type = response
        .headers()
        .get("content-type")
        .map(|v| v.to_str().unwrap().to_string());
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    (status, content_type, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let hv = FakeHypervisor::with_domains(vec![
        FakeDomainSpec::running("alpha"),
        FakeDomainSpec::stopped("beta"),
    ]);
    let (app, _state) = setup_test_app(&hv).await;

    let (status, content_type, text) = get(app, "/metrics").await;

    assert_eq!(status, StatusCode::OK);
    assert!(content_type.unwrap().contains("text/plain"));
    assert!(text.contains("# TYPE libvirt_vm_running gauge"));
    assert!(text.contains("libvirt_vm_running{domain=\"alpha\""));
    assert!(text.contains("libvirt_vm_running{domain=\"beta\""));
    assert!(text.contains("libvirt_up{site=\"fra1\"} 1"));
    assert!(text.contains("libvirt_host_info{"));
}

#[tokio::test]
async fn test_metrics_when_hypervisor_unreachable() {
    let hv = FakeHypervisor::with_domains(vec![FakeDomainSpec::running("alpha")]);
    let (app, state) = setup_test_app(&hv).await;

    hv.drop_connections();
    hv.fail_next_connects(10);

    let (status, _, text) = get(app.clone(), "/metrics").await;

    // the backend always gets a valid exposition
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("libvirt_up{site=\"fra1\"} 0"));
    assert!(text.contains("libvirt_exporter_scrape_errors_total{site=\"fra1\"} 1"));
    assert!(!text.contains("libvirt_vm_running"));

    let readiness = state.health_registry.readiness().await;
    assert!(!readiness.ready);

    let (status, _, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let health: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["components"]["libvirt_connection"]["status"], "unhealthy");
}

#[tokio::test]
async fn test_custom_telemetry_path() {
    let hv = FakeHypervisor::with_domains(vec![FakeDomainSpec::running("alpha")]);
    let (_, state) = setup_test_app(&hv).await;

    let custom = AppState {
        telemetry_path: "/probe".to_string(),
        ..(*state).clone()
    };
    let app = create_router(Arc::new(custom));

    let (status, _, text) = get(app.clone(), "/probe").await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("libvirt_up"));

    let (status, _, _) = get(app, "/metrics").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_landing_page_links_metrics() {
    let hv = FakeHypervisor::new();
    let (app, _state) = setup_test_app(&hv).await;

    let (status, content_type, body) = get(app, "/").await;

    assert_eq!(status, StatusCode::OK);
    assert!(content_type.unwrap().contains("text/html"));
    assert!(body.contains("href=\"/metrics\""));
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let hv = FakeHypervisor::new();
    let (app, _state) = setup_test_app(&hv).await;

    let (status, _, body) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    let health: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["libvirt_connection"].is_object());
    assert!(health["components"]["collector"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let hv = FakeHypervisor::with_domains(vec![
        FakeDomainSpec::running("alpha").failing("memory_stats")
    ]);
    let (app, _state) = setup_test_app(&hv).await;

    // a failing collector degrades the collector component
    let (status, _, _) = get(app.clone(), "/metrics").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    let health: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["status"], "degraded");
    assert!(health["components"]["collector"]["message"]
        .as_str()
        .unwrap()
        .contains("memory"));
}

#[tokio::test]
async fn test_readyz_returns_503_when_not_ready() {
    let hv = FakeHypervisor::new();
    let (app, _state) = setup_test_app(&hv).await;

    let (status, _, body) = get(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let readiness: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let hv = FakeHypervisor::new();
    let (app, state) = setup_test_app(&hv).await;

    state.health_registry.set_ready(true).await;

    let (status, _, body) = get(app, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    let readiness: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(readiness["ready"], true);
}
