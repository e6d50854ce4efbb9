use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration for the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// HTTP API server
    pub server: ServerConfig,
    /// WebSocket relay endpoint advertised to clients and nodes
    pub relay: RelayConfig,
    /// UDP side channel for WireGuard-format datagrams
    pub wireguard: WireguardConfig,
    /// How the coordinator reaches node agents directly
    pub node_api: NodeApiConfig,
    /// Node registry and liveness tracking
    pub registry: RegistryConfig,
    /// Session lifecycle
    pub sessions: SessionsConfig,
    /// Route materialization
    pub routing: RoutingConfig,
    /// Bearer token authority
    pub auth: AuthConfig,
    /// STUN/TURN servers advertised to nodes and clients
    pub ice: IceConfig,
    /// Prometheus metrics exporter
    pub metrics: MetricsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// HTTP API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public IP advertised in relay/node endpoints, when known
    pub public_ip: Option<String>,
    /// Public hostname advertised in relay endpoints, preferred over IP
    pub hostname: Option<String>,
}

/// Relay endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// ws or wss
    pub protocol: String,
    /// Server heartbeat interval on attached sessions, seconds
    pub heartbeat_interval_seconds: u64,
    /// Maximum packets grouped into one outbound batch
    pub ws_batch_max: usize,
    /// Batching window in milliseconds
    pub ws_batch_window_ms: u64,
    /// Bounded depth of the per-session writer queue
    pub writer_queue_depth: usize,
}

/// UDP relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireguardConfig {
    pub port: u16,
    /// Idle eviction for client endpoint bindings, seconds
    pub udp_session_timeout_seconds: u64,
}

/// Direct node API access configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeApiConfig {
    pub port: u16,
    /// Fallback node base URL when a node has no routable address
    pub default_url: Option<String>,
    /// Timeout for direct HTTP posts to nodes, seconds
    pub http_timeout_seconds: u64,
}

/// Node registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Node cache TTL, seconds
    pub cache_ttl_seconds: u64,
    /// Silence after which a node is marked offline, seconds
    pub offline_threshold_seconds: u64,
    /// Silence after which a node is removed, seconds
    pub purge_threshold_seconds: u64,
    /// Sweeper period, seconds
    pub sweep_interval_seconds: u64,
}

/// Session store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Session lifetime, seconds
    pub ttl_seconds: u64,
    /// Session cache TTL, seconds
    pub cache_ttl_seconds: u64,
    /// Sweeper period, seconds
    pub sweep_interval_seconds: u64,
}

/// Routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Route plan lifetime, seconds
    pub route_ttl_seconds: u64,
}

/// Token authority configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for session tokens
    pub jwt_secret: String,
    /// Token lifetime, seconds
    pub jwt_expiry_seconds: u64,
}

/// STUN/TURN advertisement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<String>,
}

/// Metrics exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                public_ip: None,
                hostname: None,
            },
            relay: RelayConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                protocol: "ws".to_string(),
                heartbeat_interval_seconds: 30,
                ws_batch_max: 10,
                ws_batch_window_ms: 10,
                writer_queue_depth: 1024,
            },
            wireguard: WireguardConfig {
                port: 51820,
                udp_session_timeout_seconds: 300,
            },
            node_api: NodeApiConfig {
                port: 8088,
                default_url: None,
                http_timeout_seconds: 5,
            },
            registry: RegistryConfig {
                cache_ttl_seconds: 60,
                offline_threshold_seconds: 120,
                purge_threshold_seconds: 600,
                sweep_interval_seconds: 60,
            },
            sessions: SessionsConfig {
                ttl_seconds: 3600,
                cache_ttl_seconds: 3600,
                sweep_interval_seconds: 300,
            },
            routing: RoutingConfig {
                route_ttl_seconds: 3600,
            },
            auth: AuthConfig {
                jwt_secret: "change-me".to_string(),
                jwt_expiry_seconds: 3600,
            },
            ice: IceConfig {
                stun_servers: vec!["stun.l.google.com:19302".to_string()],
                turn_servers: Vec::new(),
            },
            metrics: MetricsConfig {
                enabled: true,
                listen_addr: "127.0.0.1:9091".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                dir: None,
            },
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from file with VEILMESH_* environment overrides
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("VEILMESH").separator("__"))
            .build()?;

        let mut loaded: Self = settings.try_deserialize()?;
        loaded.apply_env_overrides();
        Ok(loaded)
    }

    /// Apply the flat, well-known environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("SERVER_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(host) = std::env::var("SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(host) = std::env::var("RELAY_HOST") {
            self.relay.host = host;
        }
        if let Ok(port) = std::env::var("RELAY_PORT") {
            if let Ok(port) = port.parse() {
                self.relay.port = port;
            }
        }
        if let Ok(protocol) = std::env::var("RELAY_PROTOCOL") {
            self.relay.protocol = protocol;
        }
        if let Ok(port) = std::env::var("WIREGUARD_PORT") {
            if let Ok(port) = port.parse() {
                self.wireguard.port = port;
            }
        }
        if let Ok(port) = std::env::var("NODE_API_PORT") {
            if let Ok(port) = port.parse() {
                self.node_api.port = port;
            }
        }
        if let Ok(url) = std::env::var("DEFAULT_NODE_API_URL") {
            self.node_api.default_url = Some(url);
        }
        if let Ok(ip) = std::env::var("SERVER_PUBLIC_IP") {
            self.server.public_ip = Some(ip);
        }
        if let Ok(hostname) = std::env::var("SERVER_HOSTNAME") {
            self.server.hostname = Some(hostname);
        }
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Ok(expiry) = std::env::var("JWT_EXPIRY") {
            if let Ok(expiry) = expiry.parse() {
                self.auth.jwt_expiry_seconds = expiry;
            }
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.logging.dir = Some(dir);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }
        if self.wireguard.port == 0 {
            return Err("WireGuard UDP port cannot be 0".to_string());
        }
        if self.relay.protocol != "ws" && self.relay.protocol != "wss" {
            return Err(format!(
                "Relay protocol must be ws or wss, got {}",
                self.relay.protocol
            ));
        }
        if self.relay.ws_batch_max < 2 || self.relay.ws_batch_max >= 100 {
            return Err("ws_batch_max must be within [2, 99]".to_string());
        }
        if self.relay.writer_queue_depth == 0 {
            return Err("writer_queue_depth cannot be 0".to_string());
        }
        if self.auth.jwt_secret.is_empty() {
            return Err("JWT secret cannot be empty".to_string());
        }
        Ok(())
    }

    /// Address the HTTP API binds to
    pub fn server_addr(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| format!("Invalid server address: {}", e))
    }

    /// Address the UDP relay binds to
    pub fn wireguard_addr(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.server.host, self.wireguard.port)
            .parse()
            .map_err(|e| format!("Invalid WireGuard address: {}", e))
    }

    /// Externally visible relay endpoint for a session
    pub fn relay_endpoint(&self, session_id: uuid::Uuid) -> String {
        let host = self
            .server
            .hostname
            .clone()
            .or_else(|| self.server.public_ip.clone())
            .unwrap_or_else(|| self.relay.host.clone());
        format!(
            "{}://{}:{}/relay/{}",
            self.relay.protocol, host, self.relay.port, session_id
        )
    }

    pub fn node_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.registry.cache_ttl_seconds)
    }

    pub fn session_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.sessions.cache_ttl_seconds)
    }
}
