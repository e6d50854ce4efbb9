//! Local node API: the coordinator's direct HTTP path into this agent.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::forwarder::PacketForwarder;
use crate::health::HealthCheck;

#[derive(Clone)]
pub struct NodeApiState {
    pub forwarder: Arc<PacketForwarder>,
    pub health: Arc<HealthCheck>,
}

/// Packet pushed by the coordinator when no relay channel is available
#[derive(Debug, Deserialize)]
pub struct PacketFromServer {
    pub session_id: Option<Uuid>,
    #[allow(dead_code)]
    pub client_id: Option<Uuid>,
    /// Base64-encoded IP datagram
    pub payload: String,
}

pub fn create_node_router(state: NodeApiState) -> Router {
    Router::new()
        .route("/api/v1/packets/from-server", post(packets_from_server))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[instrument(skip(state, packet))]
async fn packets_from_server(
    State(state): State<NodeApiState>,
    Json(packet): Json<PacketFromServer>,
) -> Response {
    let Ok(payload) = BASE64.decode(&packet.payload) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "bad base64 payload" })),
        )
            .into_response();
    };

    let session_id = packet.session_id.unwrap_or_else(Uuid::nil);
    match state.forwarder.handle_outbound(session_id, &payload).await {
        Ok(()) => {
            debug!(session_id = %session_id, bytes = payload.len(), "Direct packet forwarded");
            Json(serde_json::json!({ "status": "ok" })).into_response()
        }
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn health(State(state): State<NodeApiState>) -> Response {
    let report = state.health.check_health().await;
    let status = if report.healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if report.healthy() { "healthy" } else { "unhealthy" },
            "nat": report.nat_ok,
            "routing": report.routing_ok,
            "relay_attached": report.relay_attached,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
        .into_response()
}
