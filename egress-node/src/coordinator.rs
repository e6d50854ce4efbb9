//! Coordinator client: registration, heartbeats, and unregistration.
//!
//! Registration is optimistic: the agent boots regardless and a background
//! loop keeps retrying. 429 responses get their own backoff schedule so a
//! rate-limiting coordinator is never hammered.

use chrono::{DateTime, Utc};
use metrics::counter;
use reqwest::{Client, StatusCode};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EgressConfig;
use crate::error::{EgressError, Result};
use crate::identity::NodeIdentity;
use crate::shutdown::ShutdownSignal;
use crate::stun::NatProbe;
use veilmesh_common::{
    Capabilities, HeartbeatMetrics, HeartbeatRequest, HeartbeatResponse, Location, NetworkInfo,
    RegisterRequest, RegisterResponse,
};

pub struct CoordinatorClient {
    config: EgressConfig,
    http: Client,
    identity: NodeIdentity,
    nat_probe: NatProbe,
    token: RwLock<Option<String>>,
    token_expires_at: RwLock<Option<DateTime<Utc>>>,
    heartbeat_interval: RwLock<Duration>,
    registered: AtomicBool,
}

impl CoordinatorClient {
    pub fn new(config: EgressConfig, identity: NodeIdentity, nat_probe: NatProbe) -> Arc<Self> {
        let http = Client::builder()
            .timeout(config.http_timeout())
            .build()
            .unwrap_or_default();
        let heartbeat_interval = Duration::from_secs(config.coordinator.heartbeat_interval_seconds);

        Arc::new(Self {
            config,
            http,
            identity,
            nat_probe,
            token: RwLock::new(None),
            token_expires_at: RwLock::new(None),
            heartbeat_interval: RwLock::new(heartbeat_interval),
            registered: AtomicBool::new(false),
        })
    }

    pub fn node_id(&self) -> Uuid {
        self.identity.node_id
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub async fn bearer_token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    pub async fn current_heartbeat_interval(&self) -> Duration {
        *self.heartbeat_interval.read().await
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/api/v1{}",
            self.config.coordinator.server_url.trim_end_matches('/'),
            path
        )
    }

    /// Best-effort local IPv4 discovery via a routed-but-unsent datagram
    async fn local_ipv4() -> Ipv4Addr {
        let probe = async {
            let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
            socket.connect("8.8.8.8:80").await.ok()?;
            match socket.local_addr().ok()? {
                std::net::SocketAddr::V4(addr) => Some(*addr.ip()),
                _ => None,
            }
        };
        probe.await.unwrap_or(Ipv4Addr::LOCALHOST)
    }

    async fn build_register_request(&self) -> RegisterRequest {
        RegisterRequest {
            node_id: self.identity.node_id,
            public_key: self.identity.public_key.clone(),
            network_info: NetworkInfo {
                ipv4: Self::local_ipv4().await,
                ipv6: None,
                nat_type: self.nat_probe.nat_type,
                stun_mapped_addr: self.nat_probe.mapped_addr,
                local_port: self.config.node.wireguard_port,
                public_ip: self.nat_probe.mapped_addr.map(|addr| addr.ip()),
            },
            capabilities: Capabilities {
                max_connections: self.config.node.max_connections,
                bandwidth_up: self.config.node.bandwidth_up_mbps,
                bandwidth_down: self.config.node.bandwidth_down_mbps,
                routing: true,
                natting: true,
            },
            location: Location {
                country: self.config.node.country.clone(),
                region: self.config.node.region.clone(),
                coords: None,
            },
            heartbeat_interval: Some(self.config.coordinator.heartbeat_interval_seconds),
        }
    }

    /// One registration attempt
    pub async fn register_once(&self) -> Result<RegisterResponse> {
        let request = self.build_register_request().await;
        let url = self.api_url("/nodes/register");
        debug!(url = %url, node_id = %self.identity.node_id, "Registering with coordinator");

        let response = self.http.post(&url).json(&request).send().await?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(|text| text.parse().ok())
                .unwrap_or(self.config.coordinator.rate_limit_backoff_seconds);
            return Err(EgressError::RateLimited {
                retry_after_seconds: retry_after,
            });
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EgressError::Coordinator(format!(
                "registration failed with status {}: {}",
                status, body
            )));
        }

        let registered: RegisterResponse = response.json().await?;

        *self.token.write().await = Some(registered.session_token.clone());
        *self.token_expires_at.write().await = Some(registered.expires_at);
        self.registered.store(true, Ordering::Release);
        counter!("egress_registrations_total", 1);

        info!(
            node_id = %registered.node_id,
            relay_servers = ?registered.relay_servers,
            "Registered with coordinator"
        );
        Ok(registered)
    }

    /// Retry registration until it succeeds or shutdown is requested.
    ///
    /// Plain failures back off exponentially from the configured base; 429s
    /// follow their own schedule, starting at 10 s and capped at 60 s.
    pub async fn register_with_backoff(&self, shutdown: &ShutdownSignal) -> Option<RegisterResponse> {
        let base = self.config.coordinator.backoff_base_seconds.max(1);
        let rl_cap = self.config.coordinator.rate_limit_backoff_cap_seconds;
        let mut attempt: u32 = 0;
        let mut rl_backoff = self.config.coordinator.rate_limit_backoff_seconds;

        loop {
            if shutdown.is_requested() {
                return None;
            }
            match self.register_once().await {
                Ok(response) => return Some(response),
                Err(EgressError::RateLimited {
                    retry_after_seconds,
                }) => {
                    let wait = retry_after_seconds.max(rl_backoff).min(rl_cap);
                    warn!(wait_seconds = wait, "Coordinator rate limited registration");
                    counter!("egress_registration_rate_limited_total", 1);
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    rl_backoff = (rl_backoff * 2).min(rl_cap);
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let wait = base
                        .saturating_mul(1u64 << attempt.min(6))
                        .min(self.config.coordinator.rate_limit_backoff_cap_seconds.max(60));
                    warn!(
                        attempt,
                        wait_seconds = wait,
                        error = %e,
                        "Registration attempt failed"
                    );
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
            }
        }
    }

    /// Send one heartbeat and adopt the server's cadence
    pub async fn send_heartbeat(&self, metrics: HeartbeatMetrics) -> Result<HeartbeatResponse> {
        let token = self
            .bearer_token()
            .await
            .ok_or_else(|| EgressError::InvalidState("not registered".to_string()))?;

        let url = self.api_url(&format!("/nodes/{}/heartbeat", self.identity.node_id));
        let request = HeartbeatRequest {
            metrics: Some(metrics),
            status: None,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(EgressError::Coordinator(format!(
                "heartbeat failed with status {}",
                status
            )));
        }

        let heartbeat: HeartbeatResponse = response.json().await?;
        counter!("egress_heartbeats_sent_total", 1);

        let requested = Duration::from_secs(heartbeat.next_heartbeat.max(1));
        let mut interval = self.heartbeat_interval.write().await;
        if *interval != requested {
            info!(
                next_heartbeat = heartbeat.next_heartbeat,
                "Coordinator adjusted the heartbeat interval"
            );
            *interval = requested;
        }

        Ok(heartbeat)
    }

    /// Heartbeat loop with exponential reconnect backoff (base 5 s doubling,
    /// ten attempts per cycle, then re-registration).
    pub fn spawn_heartbeat_loop<F>(
        self: Arc<Self>,
        shutdown: ShutdownSignal,
        metrics_provider: F,
    ) -> JoinHandle<()>
    where
        F: Fn() -> HeartbeatMetrics + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let base = self.config.coordinator.backoff_base_seconds.max(1);
            let max_attempts = self.config.coordinator.backoff_max_attempts;
            let mut failed_attempts: u32 = 0;

            loop {
                if shutdown.is_requested() {
                    break;
                }
                let interval = self.current_heartbeat_interval().await;
                tokio::time::sleep(interval).await;
                if shutdown.is_requested() {
                    break;
                }

                match self.send_heartbeat(metrics_provider()).await {
                    Ok(response) => {
                        failed_attempts = 0;
                        for action in response.actions {
                            match action.action.as_str() {
                                "terminate" => {
                                    warn!("Coordinator requested termination");
                                    shutdown.request();
                                }
                                other => {
                                    debug!(action = %other, "Unhandled coordinator action");
                                }
                            }
                        }
                    }
                    Err(e) => {
                        failed_attempts += 1;
                        let wait = base.saturating_mul(1u64 << (failed_attempts - 1).min(6));
                        warn!(
                            attempt = failed_attempts,
                            wait_seconds = wait,
                            error = %e,
                            "Heartbeat failed"
                        );
                        counter!("egress_heartbeats_failed_total", 1);
                        tokio::time::sleep(Duration::from_secs(wait)).await;

                        if failed_attempts >= max_attempts {
                            error!("Too many missed heartbeats, re-registering");
                            self.registered.store(false, Ordering::Release);
                            if self.register_with_backoff(&shutdown).await.is_none() {
                                break;
                            }
                            failed_attempts = 0;
                        }
                    }
                }
            }
        })
    }

    /// Remove this node from the coordinator registry
    pub async fn unregister(&self) -> Result<()> {
        let token = self
            .bearer_token()
            .await
            .ok_or_else(|| EgressError::InvalidState("not registered".to_string()))?;

        let url = self.api_url(&format!("/nodes/{}", self.identity.node_id));
        let response = self.http.delete(&url).bearer_auth(token).send().await?;

        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(EgressError::Coordinator(format!(
                "unregister failed with status {}",
                response.status()
            )));
        }

        self.registered.store(false, Ordering::Release);
        info!(node_id = %self.identity.node_id, "Unregistered from coordinator");
        Ok(())
    }
}

/// Collect heartbeat metrics from the OS
pub fn collect_system_metrics(active_connections: u64, bytes_forwarded: u64) -> HeartbeatMetrics {
    HeartbeatMetrics {
        cpu_usage: read_cpu_usage(),
        memory_usage: read_memory_usage(),
        packet_loss: 0.0,
        active_connections,
        packets_per_second: active_connections * 10,
        bytes_forwarded,
    }
}

/// CPU usage from /proc/stat on Linux, a stable stand-in elsewhere
fn read_cpu_usage() -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(stat) = std::fs::read_to_string("/proc/stat") {
            if let Some(values) = stat
                .lines()
                .next()
                .filter(|line| line.starts_with("cpu "))
                .map(|line| {
                    line.split_whitespace()
                        .skip(1)
                        .filter_map(|v| v.parse::<u64>().ok())
                        .collect::<Vec<u64>>()
                })
            {
                if values.len() >= 5 {
                    let idle = values[3] + values[4];
                    let total: u64 = values.iter().sum();
                    if total > 0 {
                        return ((total - idle) as f64 / total as f64) * 100.0;
                    }
                }
            }
        }
        0.0
    }

    #[cfg(not(target_os = "linux"))]
    {
        20.0
    }
}

/// Memory usage from /proc/meminfo on Linux, a stable stand-in elsewhere
fn read_memory_usage() -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            let field = |name: &str| {
                meminfo
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|value| value.parse::<u64>().ok())
            };
            if let (Some(total), Some(available)) = (field("MemTotal:"), field("MemAvailable:")) {
                if total > 0 {
                    return ((total - available) as f64 / total as f64) * 100.0;
                }
            }
        }
        0.0
    }

    #[cfg(not(target_os = "linux"))]
    {
        30.0
    }
}
