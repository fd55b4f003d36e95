//! Local status surface.
//!
//! Read-only endpoints for whoever runs the box:
//!
//! - **GET /health**: liveness, always `200 OK` while the process serves.
//! - **GET /status**: runtime status snapshot plus the outbox backlog.
//!
//! Nothing here echoes configuration; the edge token never leaves the process.

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{instrument, warn};

use crate::state::{RuntimeStatus, StatusSnapshot};
use crate::storage::Outbox;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub status: Arc<RuntimeStatus>,
    pub outbox: Outbox,
    pub store_id: String,
    pub agent_id: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub store_id: String,
    pub agent_id: String,
    #[serde(flatten)]
    pub runtime: StatusSnapshot,
    pub outbox_pending: i64,
}

/// Router with all status routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// GET /status - Current runtime status.
///
/// # Response
///
/// ```json
/// {
///     "store_id": "store-1",
///     "agent_id": "edge-agent",
///     "agent_running": true,
///     "heartbeat_only": false,
///     "last_send_at": "2024-01-15T10:30:00Z",
///     "last_send_ok": true,
///     "last_send_http_status": 201,
///     "last_send_error": null,
///     "last_backend_seen_ok_at": "2024-01-15T10:30:00Z",
///     "sent_ok": 42,
///     "sent_fail": 0,
///     "consecutive_auth_failures": 0,
///     "outbox_pending": 0
/// }
/// ```
#[instrument(skip(state))]
pub async fn get_status(
    State(state): State<AppState>,
) -> Result<Json<StatusResponse>, StatusCode> {
    let outbox_pending = match state.outbox.pending_count().await {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "Failed to count outbox records");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    Ok(Json(StatusResponse {
        store_id: state.store_id.clone(),
        agent_id: state.agent_id.clone(),
        runtime: state.status.snapshot(),
        outbox_pending,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_routes_respond() {
        let state = AppState {
            status: Arc::new(RuntimeStatus::new()),
            outbox: Outbox::new("sqlite::memory:").await.unwrap(),
            store_id: "s".to_string(),
            agent_id: "a".to_string(),
        };
        let app = router(state);

        for uri in ["/health", "/status"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }
    }
}
