//! HTTP API surface of the coordinator.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::auth::TokenAuthority;
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::heartbeat::HeartbeatManager;
use crate::metrics_store::{MetricsSample, MetricsStore};
use crate::registry::NodeRegistry;
use crate::relay::{Dispatcher, ForwardRequest, UdpRelay, WsRelay};
use crate::routing::RouteSelector;
use crate::sessions::SessionStore;
use veilmesh_common::{
    HeartbeatRequest, HeartbeatResponse, NodeAction, NodeRecord, RegisterRequest,
    RegisterResponse, RouteKind, RouteRequest, RouteResponse, SelectedRoute,
};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<CoordinatorConfig>,
    pub registry: Arc<NodeRegistry>,
    pub heartbeats: Arc<HeartbeatManager>,
    pub sessions: Arc<SessionStore>,
    pub selector: Arc<RouteSelector>,
    pub dispatcher: Arc<Dispatcher>,
    pub ws_relay: Arc<WsRelay>,
    pub udp_relay: Option<Arc<UdpRelay>>,
    pub metrics_store: Arc<MetricsStore>,
    pub auth: Arc<TokenAuthority>,
    pub wireguard_peers: Arc<DashMap<String, WireGuardPeer>>,
    pub started_at: DateTime<Utc>,
}

/// WireGuard peer bookkeeping entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireGuardPeer {
    pub public_key: String,
    pub session_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub endpoint: Option<std::net::SocketAddr>,
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
}

/// Inbound packet submission (both directions)
#[derive(Debug, Clone, Deserialize)]
pub struct PacketSubmission {
    pub session_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub node_id: Option<Uuid>,
    /// Base64-encoded payload
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    100
}

/// Build the coordinator API router
pub fn create_api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/nodes/register", post(register_node))
        .route("/api/v1/nodes/:node_id/heartbeat", post(node_heartbeat))
        .route("/api/v1/nodes/:node_id/terminate", post(terminate_node))
        .route("/api/v1/nodes/:node_id", get(get_node).delete(delete_node))
        .route("/api/v1/nodes", get(list_nodes))
        .route("/api/v1/routing/request", post(request_route))
        .route("/api/v1/metrics", post(submit_metrics))
        .route("/api/v1/metrics/:node_id/latest", get(metrics_latest))
        .route("/api/v1/metrics/:node_id/history", get(metrics_history))
        .route(
            "/api/v1/metrics/:node_id/aggregated",
            get(metrics_aggregated),
        )
        .route("/api/v1/packets", post(packets_to_client))
        .route("/api/v1/packets/from-client", post(packets_from_client))
        .route("/api/v1/wireguard/register", post(wireguard_register))
        .route("/api/v1/wireguard/unregister", post(wireguard_unregister))
        .route("/api/v1/turn/servers", get(turn_servers))
        .route("/api/v1/turn/stun", get(stun_servers))
        .route("/api/v1/turn/ice", get(ice_servers))
        .route("/api/v1/fleet/stats", get(fleet_stats))
        .route("/api/v1/health", get(health))
        .route("/health", get(health))
        .route("/health/ready", get(health_ready))
        .route("/health/live", get(health_live))
        .route("/relay/:session_id", get(relay_upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Check the bearer token on a node-scoped route
fn authorize_node(headers: &HeaderMap, node_id: Uuid, auth: &TokenAuthority) -> Result<()> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| CoordinatorError::Unauthorized("missing bearer token".to_string()))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| CoordinatorError::Unauthorized("malformed authorization".to_string()))?;

    if auth.verify(node_id, token) {
        Ok(())
    } else {
        Err(CoordinatorError::Unauthorized("invalid token".to_string()))
    }
}

fn decode_payload(payload: &str) -> Result<Bytes> {
    BASE64
        .decode(payload)
        .map(Bytes::from)
        .map_err(|e| CoordinatorError::Validation(format!("bad base64 payload: {}", e)))
}

#[instrument(skip(state, request))]
async fn register_node(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>)> {
    if let Some(interval) = request.heartbeat_interval {
        if !(10..=300).contains(&interval) {
            return Err(CoordinatorError::Validation(format!(
                "heartbeat_interval {} outside [10, 300]",
                interval
            )));
        }
    }
    if request.network_info.local_port == 0 {
        return Err(CoordinatorError::Validation(
            "local_port cannot be 0".to_string(),
        ));
    }
    if request.public_key.is_empty() {
        return Err(CoordinatorError::Validation(
            "public_key cannot be empty".to_string(),
        ));
    }

    let node = state.registry.register(request).await?;
    let (session_token, expires_at) = state.auth.mint(node.node_id);

    let response = RegisterResponse {
        node_id: node.node_id,
        status: node.status,
        relay_servers: vec![format!(
            "{}://{}:{}",
            state.config.relay.protocol,
            state
                .config
                .server
                .hostname
                .clone()
                .or_else(|| state.config.server.public_ip.clone())
                .unwrap_or_else(|| state.config.relay.host.clone()),
            state.config.relay.port
        )],
        stun_servers: state.config.ice.stun_servers.clone(),
        session_token,
        expires_at,
    };

    Ok((StatusCode::CREATED, Json(response)))
}

#[instrument(skip(state, headers, request))]
async fn node_heartbeat(
    State(state): State<AppState>,
    Path(node_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>> {
    authorize_node(&headers, node_id, &state.auth)?;
    let response = state.heartbeats.process(node_id, request).await?;
    Ok(Json(response))
}

#[instrument(skip(state))]
async fn get_node(
    State(state): State<AppState>,
    Path(node_id): Path<Uuid>,
) -> Result<Json<NodeRecord>> {
    let node = state.registry.get(node_id).await?;
    Ok(Json(node))
}

#[instrument(skip(state))]
async fn list_nodes(State(state): State<AppState>) -> Result<Json<Vec<NodeRecord>>> {
    let nodes = state.registry.list_all().await?;
    Ok(Json(nodes))
}

#[instrument(skip(state, headers))]
async fn delete_node(
    State(state): State<AppState>,
    Path(node_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    authorize_node(&headers, node_id, &state.auth)?;
    if !state.registry.delete(node_id).await? {
        return Err(CoordinatorError::NotFound(format!("node {}", node_id)));
    }
    state.metrics_store.forget(node_id);
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// Queue a terminate action for the node's next heartbeat
#[instrument(skip(state))]
async fn terminate_node(
    State(state): State<AppState>,
    Path(node_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    state.registry.get(node_id).await?;
    state.heartbeats.queue_action(
        node_id,
        NodeAction {
            action: "terminate".to_string(),
            parameters: serde_json::Value::Null,
        },
    );
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[instrument(skip(state, request))]
async fn request_route(
    State(state): State<AppState>,
    Json(request): Json<RouteRequest>,
) -> Result<Json<RouteResponse>> {
    let selection = state.selector.select(&request).await?;

    let session_id = Uuid::new_v4();
    let expires_at = Utc::now() + ChronoDuration::seconds(state.config.sessions.ttl_seconds as i64);
    let relay_endpoint = state.config.relay_endpoint(session_id);

    state
        .sessions
        .create(
            session_id,
            selection.node.node_id,
            request.client_id,
            Some(selection.selected.id.clone()),
            expires_at,
            Some(relay_endpoint.clone()),
        )
        .await?;

    let (session_token, _) = state.auth.mint(session_id);
    let node_endpoint = match selection.selected.kind {
        RouteKind::Direct => Some(format!(
            "{}:{}",
            selection
                .node
                .network_info
                .public_ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| selection.node.network_info.ipv4.to_string()),
            selection.node.network_info.local_port
        )),
        _ => None,
    };

    Ok(Json(RouteResponse {
        routes: selection.routes,
        selected_route: SelectedRoute {
            id: selection.selected.id,
            session_id,
            relay_endpoint,
            node_endpoint,
            session_token,
            expires_at,
        },
    }))
}

#[instrument(skip(state, sample))]
async fn submit_metrics(
    State(state): State<AppState>,
    Json(sample): Json<MetricsSample>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    state.metrics_store.ingest(sample);
    Ok((StatusCode::CREATED, Json(serde_json::json!({"status": "ok"}))))
}

#[instrument(skip(state))]
async fn metrics_latest(
    State(state): State<AppState>,
    Path(node_id): Path<Uuid>,
) -> Result<Json<MetricsSample>> {
    state
        .metrics_store
        .latest(node_id)
        .map(Json)
        .ok_or_else(|| CoordinatorError::NotFound(format!("metrics for node {}", node_id)))
}

#[instrument(skip(state))]
async fn metrics_history(
    State(state): State<AppState>,
    Path(node_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<MetricsSample>>> {
    Ok(Json(state.metrics_store.history(node_id, query.limit)))
}

#[instrument(skip(state))]
async fn metrics_aggregated(
    State(state): State<AppState>,
    Path(node_id): Path<Uuid>,
) -> Result<Json<crate::metrics_store::MetricsAggregate>> {
    state
        .metrics_store
        .aggregated(node_id)
        .map(Json)
        .ok_or_else(|| CoordinatorError::NotFound(format!("metrics for node {}", node_id)))
}

/// Route inbound data toward a client. Address discovery is session-first,
/// UDP-binding second; without either the packet is dropped.
#[instrument(skip(state, submission))]
async fn packets_to_client(
    State(state): State<AppState>,
    Json(submission): Json<PacketSubmission>,
) -> Result<Json<serde_json::Value>> {
    let payload = decode_payload(&submission.payload)?;

    let (session_id, client_id, node_id) = match submission.session_id {
        Some(session_id) => {
            let session = state.sessions.get(session_id).await?;
            (Some(session_id), session.client_id, session.node_id)
        }
        None => {
            let client_id = submission.client_id.ok_or_else(|| {
                CoordinatorError::Validation(
                    "either session_id or client_id is required".to_string(),
                )
            })?;
            let node_id = submission.node_id.ok_or_else(|| {
                CoordinatorError::Validation("node_id is required without session_id".to_string())
            })?;
            (None, client_id, node_id)
        }
    };

    let path = state
        .dispatcher
        .send_to_client(session_id, client_id, node_id, payload)
        .await?;
    Ok(Json(serde_json::json!({ "status": "ok", "path": format!("{:?}", path) })))
}

/// Client-to-node relay over HTTP
#[instrument(skip(state, submission))]
async fn packets_from_client(
    State(state): State<AppState>,
    Json(submission): Json<PacketSubmission>,
) -> Result<Json<serde_json::Value>> {
    let payload = decode_payload(&submission.payload)?;

    let (session_id, client_id, node_id) = match submission.session_id {
        Some(session_id) => {
            let session = state.sessions.get(session_id).await?;
            (Some(session_id), session.client_id, session.node_id)
        }
        None => {
            let client_id = submission.client_id.ok_or_else(|| {
                CoordinatorError::Validation(
                    "either session_id or client_id is required".to_string(),
                )
            })?;
            let node_id = submission.node_id.ok_or_else(|| {
                CoordinatorError::Validation("node_id is required without session_id".to_string())
            })?;
            (None, client_id, node_id)
        }
    };

    let path = state
        .dispatcher
        .forward_to_node(ForwardRequest {
            node_id,
            client_id,
            session_id,
            payload,
        })
        .await?;
    Ok(Json(serde_json::json!({ "status": "ok", "path": format!("{:?}", path) })))
}

#[instrument(skip(state, peer))]
async fn wireguard_register(
    State(state): State<AppState>,
    Json(peer): Json<WireGuardPeer>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    if peer.public_key.is_empty() {
        return Err(CoordinatorError::Validation(
            "public_key cannot be empty".to_string(),
        ));
    }

    // A peer with a known endpoint and session seeds the UDP binding table
    if let (Some(endpoint), Some(session_id), Some(udp)) =
        (peer.endpoint, peer.session_id, state.udp_relay.as_ref())
    {
        if let Ok(session) = state.sessions.get(session_id).await {
            udp.register_binding(endpoint, session.node_id, session.client_id, Some(session_id));
        }
    }

    info!(public_key = %peer.public_key, "WireGuard peer registered");
    state
        .wireguard_peers
        .insert(peer.public_key.clone(), peer);
    Ok((StatusCode::CREATED, Json(serde_json::json!({"status": "ok"}))))
}

#[instrument(skip(state, peer))]
async fn wireguard_unregister(
    State(state): State<AppState>,
    Json(peer): Json<WireGuardPeer>,
) -> Result<Json<serde_json::Value>> {
    if state.wireguard_peers.remove(&peer.public_key).is_none() {
        return Err(CoordinatorError::NotFound(format!(
            "wireguard peer {}",
            peer.public_key
        )));
    }
    Ok(Json(serde_json::json!({"status": "ok"})))
}

#[instrument(skip(state))]
async fn turn_servers(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "turn_servers": state.config.ice.turn_servers }))
}

#[instrument(skip(state))]
async fn stun_servers(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "stun_servers": state.config.ice.stun_servers }))
}

#[instrument(skip(state))]
async fn ice_servers(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "stun_servers": state.config.ice.stun_servers,
        "turn_servers": state.config.ice.turn_servers,
    }))
}

/// Fleet statistics aggregated over the registry
#[instrument(skip(state))]
async fn fleet_stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let nodes = state.registry.list_all().await?;
    let active = state.registry.list_active().await?;
    let offline = nodes
        .iter()
        .filter(|n| n.status == veilmesh_common::NodeStatus::Offline)
        .count();

    Ok(Json(serde_json::json!({
        "total_nodes": nodes.len(),
        "active_nodes": active.len(),
        "offline_nodes": offline,
        "attached_sessions": state.ws_relay.attached_count(),
        "udp_bindings": state.udp_relay.as_ref().map(|u| u.binding_count()).unwrap_or(0),
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
    })))
}

/// Liveness plus a degraded hint when no nodes are active
async fn health(State(state): State<AppState>) -> Response {
    let active = state
        .registry
        .list_active()
        .await
        .map(|nodes| nodes.len())
        .unwrap_or(0);
    let status = if active > 0 { "healthy" } else { "degraded" };

    Json(serde_json::json!({
        "status": status,
        "active_nodes": active,
        "timestamp": Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

async fn health_ready(State(state): State<AppState>) -> Response {
    // Ready once the relay seams are wired
    let ready = state.udp_relay.is_some();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(serde_json::json!({ "ready": ready }))).into_response()
}

async fn health_live() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "alive": true }))
}

#[instrument(skip(state, ws))]
async fn relay_upgrade(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    let relay = state.ws_relay.clone();
    ws.on_upgrade(move |socket| relay.handle_socket(socket, session_id))
}
