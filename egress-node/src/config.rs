use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the egress node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressConfig {
    /// Coordinator endpoints and registration behavior
    pub coordinator: CoordinatorConfig,
    /// Local node API server
    pub api: ApiConfig,
    /// Declared capacity and placement
    pub node: NodeProfileConfig,
    /// STUN probing
    pub stun: StunConfig,
    /// OS NAT/forwarding
    pub nat: NatConfig,
    /// Packet forwarder
    pub forwarder: ForwarderConfig,
    /// Health checking
    pub health: HealthConfig,
    /// Prometheus metrics exporter
    pub metrics: MetricsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Coordinator client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Base URL of the coordinator API
    pub server_url: String,
    /// Stable node id; generated and persisted when absent
    pub node_id: Option<String>,
    /// Identity key file path
    pub identity_path: String,
    /// Heartbeat interval in seconds until the server says otherwise
    pub heartbeat_interval_seconds: u64,
    /// Request timeout for coordinator calls, seconds
    pub http_timeout_seconds: u64,
    /// Base reconnect backoff, seconds
    pub backoff_base_seconds: u64,
    /// Backoff attempts before giving up a cycle
    pub backoff_max_attempts: u32,
    /// Initial backoff after a 429, seconds
    pub rate_limit_backoff_seconds: u64,
    /// Backoff cap after repeated 429s, seconds
    pub rate_limit_backoff_cap_seconds: u64,
}

/// Local node API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub listen_addr: String,
}

/// Capacity and placement reported at registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeProfileConfig {
    pub max_connections: u32,
    pub bandwidth_up_mbps: u64,
    pub bandwidth_down_mbps: u64,
    pub country: String,
    pub region: String,
    /// WireGuard listen port advertised to the coordinator
    pub wireguard_port: u16,
}

/// STUN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StunConfig {
    pub servers: Vec<String>,
    pub timeout_seconds: u64,
}

/// NAT configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatConfig {
    /// Egress interface for masquerading
    pub interface: String,
    /// Skip OS configuration entirely (tests, containers)
    pub skip_setup: bool,
}

/// Packet forwarder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// TCP connect timeout, seconds
    pub tcp_connect_timeout_seconds: u64,
    /// Idle connection eviction threshold, seconds
    pub idle_timeout_seconds: u64,
    /// Connection table sweep period, seconds
    pub sweep_interval_seconds: u64,
    /// Bounded depth of the incoming-event channel
    pub event_queue_depth: usize,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub check_interval_seconds: u64,
    /// Consecutive failures before recovery runs
    pub failure_threshold: u32,
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

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig {
                server_url: "http://127.0.0.1:8080".to_string(),
                node_id: None,
                identity_path: "egress-node.identity".to_string(),
                heartbeat_interval_seconds: 30,
                http_timeout_seconds: 5,
                backoff_base_seconds: 5,
                backoff_max_attempts: 10,
                rate_limit_backoff_seconds: 10,
                rate_limit_backoff_cap_seconds: 60,
            },
            api: ApiConfig {
                listen_addr: "0.0.0.0:8088".to_string(),
            },
            node: NodeProfileConfig {
                max_connections: 500,
                bandwidth_up_mbps: 100,
                bandwidth_down_mbps: 200,
                country: "DE".to_string(),
                region: "eu-central".to_string(),
                wireguard_port: 51820,
            },
            stun: StunConfig {
                servers: vec![
                    "stun.l.google.com:19302".to_string(),
                    "stun1.l.google.com:19302".to_string(),
                ],
                timeout_seconds: 5,
            },
            nat: NatConfig {
                interface: "eth0".to_string(),
                skip_setup: false,
            },
            forwarder: ForwarderConfig {
                tcp_connect_timeout_seconds: 10,
                idle_timeout_seconds: 300,
                sweep_interval_seconds: 60,
                event_queue_depth: 1024,
            },
            health: HealthConfig {
                check_interval_seconds: 30,
                failure_threshold: 3,
            },
            metrics: MetricsConfig {
                enabled: true,
                listen_addr: "127.0.0.1:9092".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                dir: None,
            },
        }
    }
}

impl EgressConfig {
    /// Load configuration from file with EGRESS_* environment overrides
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("EGRESS").separator("__"))
            .build()?;

        let mut loaded: Self = settings.try_deserialize()?;
        loaded.apply_env_overrides();
        Ok(loaded)
    }

    /// Apply the flat, well-known environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("BOSON_SERVER_URL") {
            self.coordinator.server_url = url;
        }
        if let Ok(port) = std::env::var("NODE_API_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.api.listen_addr = format!("0.0.0.0:{}", port);
            }
        }
        if let Ok(port) = std::env::var("WIREGUARD_PORT") {
            if let Ok(port) = port.parse() {
                self.node.wireguard_port = port;
            }
        }
        if let Ok(host) = std::env::var("STUN_HOST") {
            let port = std::env::var("STUN_PORT").unwrap_or_else(|_| "3478".to_string());
            self.stun.servers = vec![format!("{}:{}", host, port)];
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.logging.dir = Some(dir);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.coordinator.server_url.is_empty() {
            return Err("Coordinator server URL cannot be empty".to_string());
        }
        if self.node.wireguard_port == 0 {
            return Err("WireGuard port cannot be 0".to_string());
        }
        if self.health.failure_threshold == 0 {
            return Err("Health failure threshold cannot be 0".to_string());
        }
        if self.forwarder.event_queue_depth == 0 {
            return Err("Forwarder event queue depth cannot be 0".to_string());
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.coordinator.http_timeout_seconds)
    }

    pub fn tcp_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.forwarder.tcp_connect_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EgressConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.forwarder.tcp_connect_timeout_seconds, 10);
        assert_eq!(config.forwarder.idle_timeout_seconds, 300);
        assert_eq!(config.health.failure_threshold, 3);
    }

    #[test]
    fn test_validation_rejects_zero_threshold() {
        let mut config = EgressConfig::default();
        config.health.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("BOSON_SERVER_URL", "http://coordinator.test:8080");
        std::env::set_var("STUN_HOST", "stun.test");
        std::env::set_var("STUN_PORT", "3479");

        let mut config = EgressConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.coordinator.server_url, "http://coordinator.test:8080");
        assert_eq!(config.stun.servers, vec!["stun.test:3479".to_string()]);

        std::env::remove_var("BOSON_SERVER_URL");
        std::env::remove_var("STUN_HOST");
        std::env::remove_var("STUN_PORT");
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = EgressConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: EgressConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.node.wireguard_port, config.node.wireguard_port);
        assert_eq!(back.coordinator.server_url, config.coordinator.server_url);
    }
}
