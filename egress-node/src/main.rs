use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use egress_node::api::{create_node_router, NodeApiState};
use egress_node::config::EgressConfig;
use egress_node::coordinator::{collect_system_metrics, CoordinatorClient};
use egress_node::forwarder::PacketForwarder;
use egress_node::health::HealthCheck;
use egress_node::identity::NodeIdentity;
use egress_node::nat::NatManager;
use egress_node::relay_link::RelayLink;
use egress_node::shutdown::{CleanupStack, ShutdownSignal};
use egress_node::stun;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "egress_node=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!(
        "Starting Veilmesh Egress Node v{} - overlay gateway agent",
        env!("CARGO_PKG_VERSION")
    );

    // Configuration: explicit path, then the conventional locations
    let config_name =
        std::env::var("EGRESS_CONFIG").unwrap_or_else(|_| "config/default".to_string());
    let config_paths = vec![config_name.clone(), format!("egress-node/{}", config_name)];

    let mut config = None;
    for config_path in &config_paths {
        match EgressConfig::from_file(config_path) {
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
        let mut defaults = EgressConfig::default();
        defaults.apply_env_overrides();
        defaults
    });

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(anyhow::anyhow!("Invalid configuration: {}", e));
    }

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

    let shutdown = ShutdownSignal::new();
    let cleanup = Arc::new(CleanupStack::new());

    // Step 1: NAT traversal discovery; no answer means symmetric
    let nat_probe = stun::detect_nat(
        &config.stun.servers,
        Duration::from_secs(config.stun.timeout_seconds),
    )
    .await;

    // Step 2: long-term identity
    let configured_id = config
        .coordinator
        .node_id
        .as_deref()
        .and_then(|id| Uuid::parse_str(id).ok());
    let identity = NodeIdentity::load_or_generate(
        Path::new(&config.coordinator.identity_path),
        configured_id,
    )
    .context("Failed to load node identity")?;

    // Step 3: OS forwarding; a gateway that cannot forward is useless
    let nat = Arc::new(NatManager::new(&config.nat.interface, config.nat.skip_setup));
    nat.enable()
        .await
        .context("Failed to enable NAT and forwarding")?;
    {
        let nat = nat.clone();
        cleanup
            .register("nat", move || async move {
                let _ = nat.disable().await;
            })
            .await;
    }

    // Step 4: optimistic registration; failures retry in the background
    let coordinator = CoordinatorClient::new(config.clone(), identity, nat_probe.clone());
    match coordinator.register_once().await {
        Ok(_) => {}
        Err(e) => {
            warn!(error = %e, "Initial registration failed, retrying in the background");
            let background = coordinator.clone();
            let background_shutdown = shutdown.clone();
            tokio::spawn(async move {
                background.register_with_backoff(&background_shutdown).await;
            });
        }
    }

    // Step 5: forwarder and its workers
    let (forwarder, forwarder_events) = PacketForwarder::new(
        config.tcp_connect_timeout(),
        Duration::from_secs(config.forwarder.idle_timeout_seconds),
        config.forwarder.event_queue_depth,
    )
    .await
    .context("Failed to start packet forwarder")?;
    let udp_reader = forwarder.start_udp_reader();
    let forwarder_sweeper = forwarder
        .clone()
        .spawn_sweeper(Duration::from_secs(config.forwarder.sweep_interval_seconds));
    {
        cleanup
            .register("forwarder", move || async move {
                udp_reader.abort();
                forwarder_sweeper.abort();
            })
            .await;
    }

    // Step 6: relay attachment and heartbeats
    let relay_link = RelayLink::new(
        config.clone(),
        coordinator.clone(),
        forwarder.clone(),
        nat_probe,
    );
    let relay_task = relay_link
        .clone()
        .spawn(shutdown.clone(), forwarder_events);
    {
        cleanup
            .register("relay", move || async move {
                relay_task.abort();
            })
            .await;
    }

    let metrics_forwarder = forwarder.clone();
    let heartbeat_task = coordinator.clone().spawn_heartbeat_loop(
        shutdown.clone(),
        move || collect_system_metrics(metrics_forwarder.flow_count() as u64, 0),
    );
    {
        cleanup
            .register("heartbeat", move || async move {
                heartbeat_task.abort();
            })
            .await;
    }

    // Step 7: health checks and the local node API
    let health = HealthCheck::new(nat.clone(), relay_link.clone(), config.health.failure_threshold);
    let health_task = health.clone().spawn(
        Duration::from_secs(config.health.check_interval_seconds),
        shutdown.clone(),
    );
    {
        cleanup
            .register("health", move || async move {
                health_task.abort();
            })
            .await;
    }

    let api_state = NodeApiState {
        forwarder: forwarder.clone(),
        health: health.clone(),
    };
    let api_addr: std::net::SocketAddr = config
        .api
        .listen_addr
        .parse()
        .context("Invalid node API listen address")?;
    let listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("Failed to bind node API on {}", api_addr))?;
    info!(listen_addr = %api_addr, "Node API listening");
    let api_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, create_node_router(api_state)).await {
            error!(error = %e, "Node API server failed");
        }
    });
    {
        cleanup
            .register("api", move || async move {
                api_task.abort();
            })
            .await;
    }

    // Connection cleanup registered last, so it runs first on shutdown
    {
        let coordinator = coordinator.clone();
        cleanup
            .register("connection", move || async move {
                if coordinator.is_registered() {
                    if let Err(e) = coordinator.unregister().await {
                        warn!(error = %e, "Unregister during shutdown failed");
                    }
                }
            })
            .await;
    }

    info!("Egress node started");
    wait_for_shutdown(&shutdown).await;

    shutdown.request();
    cleanup.run().await;
    info!("Egress node shut down cleanly");
    Ok(())
}

/// Block until Ctrl-C or a coordinator-driven termination
async fn wait_for_shutdown(shutdown: &ShutdownSignal) {
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Shutdown signal received");
                return;
            }
            _ = ticker.tick() => {
                if shutdown.is_requested() {
                    info!("Shutdown requested internally");
                    return;
                }
            }
        }
    }
}

/// Initialize metrics descriptions
fn initialize_metrics() {
    describe_counter!(
        "egress_registrations_total",
        "Successful registrations with the coordinator"
    );
    describe_counter!(
        "egress_registration_rate_limited_total",
        "Registrations deferred by coordinator rate limiting"
    );
    describe_counter!(
        "egress_heartbeats_sent_total",
        "Heartbeats delivered to the coordinator"
    );
    describe_counter!(
        "egress_heartbeats_failed_total",
        "Heartbeats that failed to reach the coordinator"
    );
    describe_counter!(
        "egress_relay_attachments_total",
        "Relay WebSocket attachments established"
    );
    describe_counter!(
        "egress_relay_reconnects_total",
        "Relay link reconnect cycles"
    );
    describe_counter!(
        "egress_packets_forwarded_total",
        "Packets decoded and emitted to the Internet, labeled by protocol"
    );
    describe_counter!(
        "egress_packets_dropped_total",
        "Packets dropped by the forwarder, labeled by reason"
    );
    describe_counter!(
        "egress_packets_invalid_total",
        "Datagrams rejected before forwarding"
    );
    describe_counter!(
        "egress_replies_total",
        "Replies captured from the Internet"
    );
    describe_counter!(
        "egress_replies_relayed_total",
        "Replies sent back over the relay link"
    );
    describe_counter!(
        "egress_tcp_flows_opened_total",
        "Tracked TCP flows opened"
    );
    describe_counter!(
        "egress_tcp_flows_closed_total",
        "Tracked TCP flows closed or evicted"
    );
    describe_counter!(
        "egress_health_failures_total",
        "Failed health check cycles"
    );
    describe_counter!(
        "egress_recoveries_attempted_total",
        "Automatic recovery attempts"
    );
    describe_gauge!("egress_healthy", "1 when the last health check passed");
}
