use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use metrics::{describe_counter, describe_gauge};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use coordinator_node::api::{create_api_router, AppState};
use coordinator_node::auth::TokenAuthority;
use coordinator_node::config::CoordinatorConfig;
use coordinator_node::heartbeat::HeartbeatManager;
use coordinator_node::metrics_store::MetricsStore;
use coordinator_node::registry::NodeRegistry;
use coordinator_node::relay::{Dispatcher, RelayEvent, UdpRelay, WsRelay, WsRelayConfig};
use coordinator_node::routing::RouteSelector;
use coordinator_node::sessions::SessionStore;
use coordinator_node::store::{MemStore, TtlCache};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coordinator_node=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!(
        "Starting Veilmesh Coordinator v{} - overlay control plane and relay core",
        env!("CARGO_PKG_VERSION")
    );

    // Configuration: explicit path, then the conventional locations
    let config_name =
        std::env::var("VEILMESH_CONFIG").unwrap_or_else(|_| "config/default".to_string());
    let config_paths = vec![
        config_name.clone(),
        format!("coordinator-node/{}", config_name),
    ];

    let mut config = None;
    for config_path in &config_paths {
        match CoordinatorConfig::from_file(config_path) {
            Ok(loaded) => {
                info!("Configuration loaded from {}.toml", config_path);
                config = Some(loaded);
                break;
            }
            Err(e) => {
                debug!("Failed to load config from {}: {}", config_path, e);
            }
        }
    }
    let config = config.unwrap_or_else(|| {
        warn!("No configuration file found, using defaults");
        let mut defaults = CoordinatorConfig::default();
        defaults.apply_env_overrides();
        defaults
    });

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(anyhow::anyhow!("Invalid configuration: {}", e));
    }
    let config = Arc::new(config);

    // Metrics exporter
    initialize_metrics();
    if config.metrics.enabled {
        let metrics_addr: std::net::SocketAddr = config
            .metrics
            .listen_addr
            .parse()
            .context("Invalid metrics listen address")?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(metrics_addr = %config.metrics.listen_addr, "Prometheus metrics exporter started");
    }

    // Storage tiers
    let store = Arc::new(MemStore::new());
    let cache = Arc::new(TtlCache::new());

    // Registry and liveness
    let registry = Arc::new(NodeRegistry::new(
        store.clone(),
        cache.clone(),
        config.node_cache_ttl(),
        ChronoDuration::seconds(config.registry.offline_threshold_seconds as i64),
    ));
    let heartbeats = Arc::new(HeartbeatManager::new(registry.clone()));
    let _registry_sweeper = heartbeats.clone().spawn_sweeper(
        Duration::from_secs(config.registry.sweep_interval_seconds),
        ChronoDuration::seconds(config.registry.offline_threshold_seconds as i64),
        ChronoDuration::seconds(config.registry.purge_threshold_seconds as i64),
    );

    // Sessions
    let sessions = Arc::new(SessionStore::new(
        store.clone(),
        cache.clone(),
        config.session_cache_ttl(),
    ));
    let _session_sweeper = sessions
        .clone()
        .spawn_sweeper(Duration::from_secs(config.sessions.sweep_interval_seconds));

    // Routing
    let selector = Arc::new(RouteSelector::new(
        registry.clone(),
        store.clone(),
        ChronoDuration::seconds(config.routing.route_ttl_seconds as i64),
    ));

    // Relay seams: dispatcher first, relays register themselves
    let (dispatcher, events_rx) = Dispatcher::new(
        sessions.clone(),
        registry.clone(),
        config.node_api.port,
        config.node_api.default_url.clone(),
        Duration::from_secs(config.node_api.http_timeout_seconds),
    );
    tokio::spawn(drain_relay_events(events_rx));

    let ws_relay = WsRelay::new(
        sessions.clone(),
        dispatcher.clone(),
        WsRelayConfig {
            heartbeat_interval: Duration::from_secs(config.relay.heartbeat_interval_seconds),
            batch_max: config.relay.ws_batch_max,
            batch_window: Duration::from_millis(config.relay.ws_batch_window_ms),
            writer_queue_depth: config.relay.writer_queue_depth,
        },
    );
    dispatcher.register_session_sender(ws_relay.clone()).await;

    let wireguard_addr = config
        .wireguard_addr()
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let udp_relay = UdpRelay::bind(
        wireguard_addr,
        sessions.clone(),
        dispatcher.clone(),
        ws_relay.clone(),
        Duration::from_secs(config.wireguard.udp_session_timeout_seconds),
    )
    .await
    .with_context(|| format!("Failed to bind UDP relay on {}", wireguard_addr))?;
    dispatcher.register_datagram_sender(udp_relay.clone()).await;
    tokio::spawn(udp_relay.clone().run());
    let _udp_sweeper = udp_relay.clone().spawn_sweeper(Duration::from_secs(60));

    // Cache reaper shares the registry sweep cadence
    let reaper_cache = cache.clone();
    let reaper_interval = Duration::from_secs(config.registry.sweep_interval_seconds);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reaper_interval);
        loop {
            ticker.tick().await;
            reaper_cache.purge_expired();
        }
    });

    let state = AppState {
        config: config.clone(),
        registry,
        heartbeats,
        sessions,
        selector,
        dispatcher,
        ws_relay,
        udp_relay: Some(udp_relay),
        metrics_store: Arc::new(MetricsStore::new()),
        auth: Arc::new(TokenAuthority::new(
            &config.auth.jwt_secret,
            config.auth.jwt_expiry_seconds,
        )),
        wireguard_peers: Arc::new(DashMap::new()),
        started_at: Utc::now(),
    };

    let app = create_api_router(state);
    let server_addr = config.server_addr().map_err(|e| anyhow::anyhow!("{}", e))?;

    info!(listen_addr = %server_addr, "Starting coordinator API server");
    let listener = tokio::net::TcpListener::bind(&server_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", server_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    info!("Coordinator shut down cleanly");
    Ok(())
}

/// Platform event consumer: relay drops become log lines and counters
async fn drain_relay_events(mut events: tokio::sync::mpsc::Receiver<RelayEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            RelayEvent::NoPathToNode { node_id, client_id } => {
                warn!(node_id = %node_id, client_id = %client_id, "No path to node");
            }
            RelayEvent::NoPathToClient {
                client_id,
                session_id,
            } => {
                warn!(client_id = %client_id, session_id = ?session_id, "No path to client");
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install shutdown signal handler");
    }
    info!("Shutdown signal received");
}

/// Initialize metrics descriptions
fn initialize_metrics() {
    describe_counter!(
        "coordinator_nodes_registered_total",
        "Total number of nodes registered"
    );
    describe_counter!(
        "coordinator_heartbeats_received_total",
        "Total number of heartbeats received"
    );
    describe_counter!(
        "coordinator_nodes_marked_offline_total",
        "Total number of nodes transitioned to offline by the sweeper"
    );
    describe_counter!(
        "coordinator_nodes_purged_total",
        "Total number of inactive nodes removed"
    );
    describe_counter!(
        "coordinator_sessions_created_total",
        "Total number of sessions created"
    );
    describe_counter!(
        "coordinator_sessions_closed_total",
        "Total number of sessions closed"
    );
    describe_counter!(
        "coordinator_sessions_expired_total",
        "Total number of sessions removed by the expiry sweeper"
    );
    describe_counter!(
        "coordinator_routes_selected_total",
        "Total number of routes selected"
    );
    describe_counter!(
        "coordinator_route_requests_failed_total",
        "Total number of route requests that found no node or route"
    );
    describe_counter!(
        "coordinator_packets_forwarded_total",
        "Total packets forwarded toward nodes, labeled by path"
    );
    describe_counter!(
        "coordinator_packets_returned_total",
        "Total packets returned toward clients, labeled by path"
    );
    describe_counter!(
        "coordinator_packets_dropped_total",
        "Total packets dropped with no viable path"
    );
    describe_counter!(
        "coordinator_ws_attachments_total",
        "Total relay WebSocket attachments accepted"
    );
    describe_counter!(
        "coordinator_ws_rejections_total",
        "Total relay WebSocket attachments rejected at admission"
    );
    describe_counter!(
        "coordinator_ws_writer_overflow_total",
        "Frames dropped because a session writer queue was full"
    );
    describe_counter!(
        "coordinator_udp_received_total",
        "Total datagrams accepted on the UDP relay"
    );
    describe_counter!(
        "coordinator_udp_dropped_total",
        "Total datagrams dropped by the UDP relay, labeled by reason"
    );
    describe_counter!(
        "coordinator_udp_remaps_learned_total",
        "Client endpoint remaps learned by the UDP relay"
    );
    describe_gauge!(
        "coordinator_total_nodes",
        "Current total number of nodes in the registry"
    );
    describe_gauge!(
        "coordinator_active_sessions",
        "Sessions currently resident in the hot tier"
    );
    describe_gauge!(
        "coordinator_ws_attached",
        "Currently attached relay WebSocket sessions"
    );
}
