use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use uuid::Uuid;

/// NAT type observed for an endpoint, as reported by STUN probing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    FullCone,
    RestrictedCone,
    PortRestricted,
    Symmetric,
}

impl NatType {
    pub fn is_symmetric(&self) -> bool {
        matches!(self, NatType::Symmetric)
    }
}

/// Node status enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Node is active and heartbeating within limits
    Online,
    /// Node is heartbeating but reported resource pressure or loss
    Degraded,
    /// Node missed its liveness window
    Offline,
}

/// Session status enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    /// Terminal; a closed session never reactivates
    Closed,
    Error,
}

/// Route plan type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    Direct,
    Relay,
    Cascade,
}

/// Network reachability information for a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub ipv4: Ipv4Addr,
    pub ipv6: Option<Ipv6Addr>,
    pub nat_type: NatType,
    pub stun_mapped_addr: Option<SocketAddr>,
    /// WireGuard listen port on the node (1..65535)
    pub local_port: u16,
    pub public_ip: Option<IpAddr>,
}

/// Declared forwarding capacity of a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub max_connections: u32,
    /// Uplink capacity in Mbps
    pub bandwidth_up: u64,
    /// Downlink capacity in Mbps
    pub bandwidth_down: u64,
    pub routing: bool,
    pub natting: bool,
}

/// Geographic placement of a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    /// ISO 3166-1 alpha-2 country code
    pub country: String,
    pub region: String,
    pub coords: Option<(f64, f64)>,
}

/// Node entry held by the coordinator registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: Uuid,
    pub public_key: String,
    pub network_info: NetworkInfo,
    pub capabilities: Capabilities,
    pub location: Location,
    pub status: NodeStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl NodeRecord {
    /// Whether the node counts toward the active set at `now`
    pub fn is_active(&self, now: DateTime<Utc>, liveness_window: chrono::Duration) -> bool {
        matches!(self.status, NodeStatus::Online | NodeStatus::Degraded)
            && now - self.last_heartbeat < liveness_window
    }
}

/// Ephemeral route plan produced by the selector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RouteKind,
    /// Ordered node ids; direct routes have exactly one hop
    pub path: Vec<Uuid>,
    pub estimated_latency_ms: u32,
    pub estimated_bandwidth_mbps: u64,
    pub cost: u32,
    pub priority: u32,
    pub expires_at: DateTime<Utc>,
}

/// Session binding one client to one node for a bounded lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub node_id: Uuid,
    pub client_id: Uuid,
    pub route_id: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub relay_endpoint: Option<String>,
}

impl SessionRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Heartbeat metrics reported by a node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatMetrics {
    /// CPU usage percentage (0-100)
    pub cpu_usage: f64,
    /// Memory usage percentage (0-100)
    pub memory_usage: f64,
    /// Packet loss percentage (0-100)
    pub packet_loss: f64,
    pub active_connections: u64,
    pub packets_per_second: u64,
    pub bytes_forwarded: u64,
}

/// Registration request from a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: Uuid,
    pub public_key: String,
    pub network_info: NetworkInfo,
    pub capabilities: Capabilities,
    pub location: Location,
    /// Requested heartbeat interval in seconds, clamped to [10, 300]
    pub heartbeat_interval: Option<u64>,
}

/// Registration response to a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub node_id: Uuid,
    pub status: NodeStatus,
    pub relay_servers: Vec<String>,
    pub stun_servers: Vec<String>,
    /// Bearer token for subsequent authenticated calls
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Heartbeat request body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub metrics: Option<HeartbeatMetrics>,
    /// Explicit status override; takes precedence over derived status
    pub status: Option<NodeStatus>,
}

/// Action pushed to a node in a heartbeat response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAction {
    pub action: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Heartbeat response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    pub next_heartbeat: u64,
    pub actions: Vec<NodeAction>,
}

/// Client-side network information attached to a route request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientNetworkInfo {
    pub ipv4: Ipv4Addr,
    pub nat_type: NatType,
    pub stun_mapped_address: Option<SocketAddr>,
}

impl ClientNetworkInfo {
    /// A direct path needs the client to be reachable (non-symmetric NAT, or
    /// a STUN-discovered mapping to offer) and is never permitted when both
    /// sides sit behind symmetric NAT.
    pub fn permits_direct(&self, node_nat: NatType) -> bool {
        if self.nat_type.is_symmetric() && node_nat.is_symmetric() {
            return false;
        }
        self.stun_mapped_address.is_some() || !self.nat_type.is_symmetric()
    }
}

/// Requirements narrowing route candidates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteRequirements {
    /// Minimum downlink bandwidth in Mbps
    pub min_bandwidth: Option<u64>,
    pub preferred_country: Option<String>,
    pub preferred_location: Option<String>,
}

/// Route request from a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    pub client_id: Uuid,
    pub target_node_id: Option<Uuid>,
    pub requirements: Option<RouteRequirements>,
    pub client_network_info: ClientNetworkInfo,
}

/// Selected route returned to a client, with its session attachment point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedRoute {
    pub id: String,
    pub session_id: Uuid,
    pub relay_endpoint: String,
    pub node_endpoint: Option<String>,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Route response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResponse {
    pub routes: Vec<RouteRecord>,
    pub selected_route: SelectedRoute,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nat_type_serialization() {
        let json = serde_json::to_string(&NatType::FullCone).unwrap();
        assert_eq!(json, "\"full_cone\"");
        let back: NatType = serde_json::from_str("\"symmetric\"").unwrap();
        assert_eq!(back, NatType::Symmetric);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&NodeStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&SessionStatus::Closed).unwrap(),
            "\"closed\""
        );
    }

    #[test]
    fn test_heartbeat_metrics_camel_case() {
        let metrics: HeartbeatMetrics =
            serde_json::from_str(r#"{"cpuUsage": 95.0, "memoryUsage": 20.0, "packetLoss": 0.5}"#)
                .unwrap();
        assert_eq!(metrics.cpu_usage, 95.0);
        assert_eq!(metrics.packet_loss, 0.5);
        assert_eq!(metrics.active_connections, 0);
    }

    #[test]
    fn test_direct_feasibility_rules() {
        let mut client = ClientNetworkInfo {
            ipv4: "10.0.0.1".parse().unwrap(),
            nat_type: NatType::Symmetric,
            stun_mapped_address: None,
        };
        // Symmetric client with nothing to offer: no direct path at all
        assert!(!client.permits_direct(NatType::Symmetric));
        assert!(!client.permits_direct(NatType::FullCone));

        // A STUN mapping restores directness, except against another
        // symmetric NAT
        client.stun_mapped_address = Some("198.51.100.1:5000".parse().unwrap());
        assert!(client.permits_direct(NatType::FullCone));
        assert!(!client.permits_direct(NatType::Symmetric));

        // Non-symmetric clients are direct-capable toward any node
        client.stun_mapped_address = None;
        client.nat_type = NatType::PortRestricted;
        assert!(client.permits_direct(NatType::Symmetric));
        assert!(client.permits_direct(NatType::FullCone));
    }

    #[test]
    fn test_route_record_type_field() {
        let route = RouteRecord {
            id: "relay-abc".into(),
            kind: RouteKind::Relay,
            path: vec![Uuid::new_v4()],
            estimated_latency_ms: 100,
            estimated_bandwidth_mbps: 100,
            cost: 2,
            priority: 50,
            expires_at: Utc::now(),
        };
        let json = serde_json::to_value(&route).unwrap();
        assert_eq!(json["type"], "relay");
    }
}
