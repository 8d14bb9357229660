//! Health endpoints over a live pipeline.

use axum::http::StatusCode;
use axum_test::TestServer;
use broker::MemoryBroker;
use enrich_core::TaskKind;
use integration_tests::setup::TestContext;
use quota::{MemoryQuotaStore, SystemClock};
use std::sync::Arc;
use worker::Outcome;

/// Test /health endpoint returns proper structure
#[tokio::test]
async fn test_health_endpoint_structure() {
    let ctx = TestContext::new(TaskKind::DomainEmail, 333).await;
    let (router, _) = ctx.health_router();
    let server = TestServer::new(router).expect("Failed to create test server");

    let response = server.get("/health").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    for field in [
        "status",
        "broker_connected",
        "store_connected",
        "components",
        "usage",
        "version",
    ] {
        assert!(body.get(field).is_some(), "Response should have '{}' field", field);
    }
    assert_eq!(body["status"], "unhealthy", "nothing checked yet");
}

/// Usage in the report follows the tasks the pipeline completed
#[tokio::test]
async fn test_health_reports_pipeline_usage() {
    let ctx = TestContext::new(TaskKind::DomainEmail, 333).await;
    let (router, health) = ctx.health_router();
    health.broker.set_healthy();
    health.store.set_healthy();
    let server = TestServer::new(router).expect("Failed to create test server");

    let worker = ctx.worker("worker-a");
    ctx.publish("a.example").await;
    ctx.publish("b.example").await;
    assert_eq!(ctx.step(&worker).await, Outcome::Succeeded);
    assert_eq!(ctx.step(&worker).await, Outcome::Succeeded);

    let body: serde_json::Value = server.get("/health").await.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(
        body["usage"],
        serde_json::json!([{ "kind": "domain_email", "used": 2, "limit": 333 }])
    );
}

/// Readiness needs both the broker and the store
#[tokio::test]
async fn test_ready_endpoint() {
    let ctx = TestContext::new(TaskKind::Serp, 2500).await;
    let (router, health) = ctx.health_router();
    let server = TestServer::new(router).expect("Failed to create test server");

    server
        .get("/health/ready")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);

    health.broker.set_healthy();
    server
        .get("/health/ready")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);

    health.store.set_healthy();
    server.get("/health/ready").await.assert_status_ok();

    health.broker.set_unhealthy("connection reset");
    let body: serde_json::Value = server.get("/health").await.json();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["broker_connected"], false);
}

/// Test /health/live endpoint always returns 200 when service is running
#[tokio::test]
async fn test_live_endpoint() {
    let ctx = TestContext::new(TaskKind::Serp, 2500).await;
    let (router, _) = ctx.health_router();
    let server = TestServer::new(router).expect("Failed to create test server");

    server.get("/health/live").await.assert_status_ok();
}

/// The periodic health check feeds the process-wide registry
#[tokio::test]
async fn test_health_check_updates_global_registry() {
    let broker = MemoryBroker::new();
    let store = MemoryQuotaStore::new(Arc::new(SystemClock));

    worker::check_components(&broker, &store).await;
    assert!(telemetry::health().is_ready());

    store.set_offline(true);
    worker::check_components(&broker, &store).await;
    assert!(!telemetry::health().is_ready());
    assert_eq!(
        telemetry::health().store.message().as_deref(),
        Some("quota store unreachable")
    );
}
