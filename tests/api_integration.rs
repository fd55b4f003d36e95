//! Integration tests for the status API.
//!
//! These tests verify the full request/response cycle through the HTTP API.

use std::sync::Arc;

use axum_test::TestServer;
use serde_json::json;

use edge_agent::api::{AppState, router};
use edge_agent::envelope::build_envelope;
use edge_agent::state::RuntimeStatus;
use edge_agent::storage::Outbox;

async fn create_test_server() -> (TestServer, AppState) {
    let state = AppState {
        status: Arc::new(RuntimeStatus::new()),
        outbox: Outbox::new("sqlite::memory:").await.unwrap(),
        store_id: "store-1".to_string(),
        agent_id: "agent-1".to_string(),
    };
    let server = TestServer::new(router(state.clone())).unwrap();
    (server, state)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (server, _) = create_test_server().await;

    let response = server.get("/health").await;

    response.assert_status_ok();
}

#[tokio::test]
async fn test_status_initial() {
    let (server, _) = create_test_server().await;

    let response = server.get("/status").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["store_id"], "store-1");
    assert_eq!(body["agent_running"], false);
    assert_eq!(body["sent_ok"], 0);
    assert_eq!(body["outbox_pending"], 0);
    assert!(body["last_send_at"].is_null());
}

#[tokio::test]
async fn test_status_reflects_runtime() {
    let (server, state) = create_test_server().await;
    state.status.set_running(true, true);
    state.status.record_success(201);
    state.status.record_failure(Some(503), "HTTP 503: down", false);

    let env = build_envelope(
        "edge_heartbeat",
        "edge-agent:agent-1",
        json!({"store_id": "store-1", "ts": "2024-01-01T00:00:00Z"}),
        json!({}),
        1,
    );
    state.outbox.enqueue(&env).await.unwrap();

    let body: serde_json::Value = server.get("/status").await.json();
    assert_eq!(body["agent_running"], true);
    assert_eq!(body["heartbeat_only"], true);
    assert_eq!(body["sent_ok"], 1);
    assert_eq!(body["sent_fail"], 1);
    assert_eq!(body["last_send_ok"], false);
    assert_eq!(body["last_send_http_status"], 503);
    assert_eq!(body["last_send_error"], "HTTP 503: down");
    assert!(body["last_backend_seen_ok_at"].is_string());
    assert_eq!(body["outbox_pending"], 1);
}

#[tokio::test]
async fn test_unknown_route() {
    let (server, _) = create_test_server().await;

    let response = server.get("/signal").await;

    response.assert_status(axum::http::StatusCode::NOT_FOUND);
}
