//! End-to-end: an egress agent against an in-process coordinator.
//!
//! Exercises the full loop: registration, heartbeats, relay attachment, a
//! client packet pushed through the coordinator's HTTP path into the node
//! API, egress to a local UDP echo service, and the reply traveling back
//! over the relay link to the client's UDP endpoint.

use chrono::Utc;
use dashmap::DashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use coordinator_node::api::{create_api_router, AppState};
use coordinator_node::auth::TokenAuthority;
use coordinator_node::config::CoordinatorConfig;
use coordinator_node::heartbeat::HeartbeatManager;
use coordinator_node::metrics_store::MetricsStore;
use coordinator_node::registry::NodeRegistry;
use coordinator_node::relay::{Dispatcher, UdpRelay, WsRelay, WsRelayConfig};
use coordinator_node::routing::RouteSelector;
use coordinator_node::sessions::SessionStore;
use coordinator_node::store::{MemStore, TtlCache};

use egress_node::api::{create_node_router, NodeApiState};
use egress_node::config::EgressConfig;
use egress_node::coordinator::CoordinatorClient;
use egress_node::forwarder::PacketForwarder;
use egress_node::health::HealthCheck;
use egress_node::identity::NodeIdentity;
use egress_node::nat::NatManager;
use egress_node::relay_link::RelayLink;
use egress_node::shutdown::ShutdownSignal;
use egress_node::stun::NatProbe;

use veilmesh_common::NatType;

async fn start_coordinator(node_api_port: u16) -> (String, AppState) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut config = CoordinatorConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = addr.port();
    config.server.hostname = Some("127.0.0.1".to_string());
    config.relay.host = "127.0.0.1".to_string();
    config.relay.port = addr.port();
    config.node_api.port = node_api_port;
    config.metrics.enabled = false;
    let config = Arc::new(config);

    let store = Arc::new(MemStore::new());
    let cache = Arc::new(TtlCache::new());
    let registry = Arc::new(NodeRegistry::new(
        store.clone(),
        cache.clone(),
        config.node_cache_ttl(),
        chrono::Duration::minutes(2),
    ));
    let heartbeats = Arc::new(HeartbeatManager::new(registry.clone()));
    let sessions = Arc::new(SessionStore::new(
        store.clone(),
        cache.clone(),
        config.session_cache_ttl(),
    ));
    let selector = Arc::new(RouteSelector::new(
        registry.clone(),
        store.clone(),
        chrono::Duration::hours(1),
    ));

    let (dispatcher, mut events) = Dispatcher::new(
        sessions.clone(),
        registry.clone(),
        config.node_api.port,
        None,
        Duration::from_secs(5),
    );
    tokio::spawn(async move { while events.recv().await.is_some() {} });

    let ws_relay = WsRelay::new(sessions.clone(), dispatcher.clone(), WsRelayConfig::default());
    dispatcher.register_session_sender(ws_relay.clone()).await;

    let udp_relay = UdpRelay::bind(
        "127.0.0.1:0".parse().unwrap(),
        sessions.clone(),
        dispatcher.clone(),
        ws_relay.clone(),
        Duration::from_secs(300),
    )
    .await
    .unwrap();
    dispatcher.register_datagram_sender(udp_relay.clone()).await;
    tokio::spawn(udp_relay.clone().run());

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
        auth: Arc::new(TokenAuthority::new("e2e-secret", 3600)),
        wireguard_peers: Arc::new(DashMap::new()),
        started_at: Utc::now(),
    };

    let app = create_api_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), state)
}

fn build_ipv4_udp(dst_ip: Ipv4Addr, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let total_len = 28 + payload.len();
    let mut packet = vec![0u8; total_len];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&Ipv4Addr::new(10, 8, 0, 2).octets());
    packet[16..20].copy_from_slice(&dst_ip.octets());
    packet[20..22].copy_from_slice(&40000u16.to_be_bytes());
    packet[22..24].copy_from_slice(&dst_port.to_be_bytes());
    packet[24..26].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    packet[28..].copy_from_slice(payload);
    packet
}

#[tokio::test]
async fn test_full_relay_loop() {
    // Node API socket first: the coordinator needs its port at build time
    let api_listener = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
    let api_port = api_listener.local_addr().unwrap().port();

    let (base_url, state) = start_coordinator(api_port).await;

    // Egress agent wiring
    let mut config = EgressConfig::default();
    config.coordinator.server_url = base_url.clone();
    config.nat.skip_setup = true;
    let probe = NatProbe {
        nat_type: NatType::PortRestricted,
        mapped_addr: None,
    };

    let identity = NodeIdentity::generate(None);
    let coordinator = CoordinatorClient::new(config.clone(), identity, probe.clone());
    coordinator.register_once().await.expect("registration");
    assert!(coordinator.is_registered());

    // Heartbeat round trip through the real API
    let heartbeat = coordinator
        .send_heartbeat(egress_node::coordinator::collect_system_metrics(0, 0))
        .await
        .expect("heartbeat");
    assert_eq!(heartbeat.status, "ok");
    assert_eq!(heartbeat.next_heartbeat, 30);

    // Forwarder, node API, relay link
    let (forwarder, events) =
        PacketForwarder::new(Duration::from_secs(10), Duration::from_secs(300), 64)
            .await
            .unwrap();
    let _udp_reader = forwarder.start_udp_reader();

    let nat = Arc::new(NatManager::new("eth0", true));
    nat.enable().await.unwrap();
    let link = RelayLink::new(config.clone(), coordinator.clone(), forwarder.clone(), probe);
    let health = HealthCheck::new(nat, link.clone(), 3);

    let api_state = NodeApiState {
        forwarder: forwarder.clone(),
        health,
    };
    tokio::spawn(async move {
        axum::serve(api_listener, create_node_router(api_state))
            .await
            .unwrap();
    });

    let shutdown = ShutdownSignal::new();
    let _link_task = link.clone().spawn(shutdown.clone(), events);

    // Wait for the relay attachment
    let mut attached = false;
    for _ in 0..50 {
        if link.is_attached() {
            attached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(attached, "relay link should attach");

    // A local "Internet" echo service
    let echo = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buffer = [0u8; 1024];
        while let Ok((len, src)) = echo.recv_from(&mut buffer).await {
            let mut reply = b"echo:".to_vec();
            reply.extend_from_slice(&buffer[..len]);
            let _ = echo.send_to(&reply, src).await;
        }
    });

    // Client obtains a route; the registered egress node carries it
    let http = reqwest::Client::new();
    let client_id = Uuid::new_v4();
    let route: serde_json::Value = http
        .post(format!("{}/api/v1/routing/request", base_url))
        .json(&serde_json::json!({
            "client_id": client_id,
            "client_network_info": {
                "ipv4": "127.0.0.1",
                "nat_type": "full_cone",
                "stun_mapped_address": null
            }
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id: Uuid = route["selected_route"]["session_id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(
        route["selected_route"]["expires_at"].as_str().is_some(),
        true
    );

    // Client's UDP endpoint, seeded through the WireGuard registration
    let client_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_endpoint = client_socket.local_addr().unwrap();
    let seeded = http
        .post(format!("{}/api/v1/wireguard/register", base_url))
        .json(&serde_json::json!({
            "public_key": "client-pk",
            "session_id": session_id,
            "client_id": client_id,
            "endpoint": client_endpoint.to_string(),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(seeded.status(), 201);
    assert_eq!(
        state.udp_relay.as_ref().unwrap().binding_count(),
        1,
        "wireguard registration should seed the client binding"
    );

    // Push a client packet through the coordinator toward the node
    let datagram = build_ipv4_udp(
        "127.0.0.1".parse().unwrap(),
        echo_addr.port(),
        b"ping-from-client",
    );
    let forwarded: serde_json::Value = http
        .post(format!("{}/api/v1/packets/from-client", base_url))
        .json(&serde_json::json!({
            "session_id": session_id,
            "payload": base64_encode(&datagram),
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(forwarded["status"], "ok");

    // The echo reply travels node -> relay link -> coordinator -> client UDP
    let mut buffer = [0u8; 1024];
    let (len, _) = tokio::time::timeout(
        Duration::from_secs(5),
        client_socket.recv_from(&mut buffer),
    )
    .await
    .expect("reply should reach the client endpoint")
    .unwrap();
    assert_eq!(&buffer[..len], b"echo:ping-from-client");

    // Terminate action delivery on the next heartbeat
    let terminate = http
        .post(format!(
            "{}/api/v1/nodes/{}/terminate",
            base_url,
            coordinator.node_id()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(terminate.status(), 200);

    let heartbeat = coordinator
        .send_heartbeat(egress_node::coordinator::collect_system_metrics(0, 0))
        .await
        .unwrap();
    assert_eq!(heartbeat.actions.len(), 1);
    assert_eq!(heartbeat.actions[0].action, "terminate");

    // Unregister drops the node from the registry
    coordinator.unregister().await.unwrap();
    let listed: serde_json::Value = http
        .get(format!("{}/api/v1/nodes", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed.as_array().unwrap().is_empty());
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
