//! Integration tests for the daemon API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use factory_lib::{
    health::components, FactoryMetrics, HealthRegistry, LogicalMachine, MachineState,
};
use factoryd::api::{create_router, AppState};
use std::sync::Arc;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::SLOT_MANAGER).await;
    health_registry.register(components::REAPER).await;
    health_registry.register(components::RESPONDER).await;
    health_registry.register(components::PROVISIONER).await;

    let metrics = FactoryMetrics::new();
    let state = Arc::new(AppState::new(health_registry, metrics));
    let router = create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::REAPER, "2 operations failed in the last pass")
        .await;

    let (status, body) = get(app, "/healthz").await;

    // Degraded still returns 200
    assert_eq!(status, StatusCode::OK);
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::RESPONDER, "Address already in use")
        .await;

    let (status, body) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "unhealthy");
    assert_eq!(
        health["components"]["responder"]["message"],
        "Address already in use"
    );
}

#[tokio::test]
async fn test_readyz_returns_503_until_first_cycle() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;

    let (status, body) = get(app, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_ready_but_unhealthy() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;
    state
        .health_registry
        .set_unhealthy(components::SLOT_MANAGER, "Failed to write factory heartbeat")
        .await;

    let (status, _) = get(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    let mut running = LogicalMachine::unknown(0, "vac01-00.example.com".to_string());
    running.state = MachineState::Running;
    let idle = LogicalMachine::unknown(1, "vac01-01.example.com".to_string());
    state.metrics.set_slot_states(&[running, idle], 0);
    state.metrics.inc_slots_created();
    state.metrics.observe_cycle_latency(0.25);
    state.metrics.inc_protocol_queries_answered("machines_query");
    state.metrics.inc_protocol_datagrams_discarded();

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("factoryd_slots{state=\"running\"}"));
    assert!(metrics_text.contains("factoryd_slots_created_total"));
    assert!(metrics_text.contains("factoryd_protocol_queries_answered_total"));
    assert!(metrics_text.contains("factoryd_protocol_datagrams_discarded_total"));
}

#[tokio::test]
async fn test_metrics_contains_histogram_buckets() {
    let (app, state) = setup_test_app().await;

    state.metrics.observe_cycle_latency(0.1);
    state.metrics.observe_cycle_latency(1.5);
    state.metrics.observe_cycle_latency(12.0);

    let (_, body) = get(app, "/metrics").await;
    let metrics_text = String::from_utf8(body).unwrap();

    assert!(metrics_text.contains("factoryd_cycle_latency_seconds_bucket"));
    assert!(metrics_text.contains("factoryd_cycle_latency_seconds_count"));
    assert!(metrics_text.contains("factoryd_cycle_latency_seconds_sum"));
}

#[tokio::test]
async fn test_healthz_includes_component_details() {
    let (app, _state) = setup_test_app().await;

    let (_, body) = get(app, "/healthz").await;
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert!(health["components"].is_object());
    for name in ["slot_manager", "reaper", "responder", "provisioner"] {
        assert!(health["components"][name].is_object(), "missing {}", name);
    }
}
