//! UDP relay: the WireGuard side channel.
//!
//! Clients send opaque WireGuard datagrams at a fixed port. The relay learns
//! which client endpoint belongs to which session by scanning the attached
//! WebSocket sessions, and keeps learning as NATs remap source ports.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DatagramSender, Dispatcher, ForwardRequest, SessionSender};
use crate::error::Result;
use crate::sessions::SessionStore;
use veilmesh_common::frame::is_wireguard_datagram;
use veilmesh_common::SessionStatus;

const RECV_BUFFER_BYTES: usize = 65536;

/// A learned client endpoint
#[derive(Debug, Clone)]
struct Binding {
    node_id: Uuid,
    client_id: Uuid,
    session_id: Option<Uuid>,
    last_seen: Instant,
}

pub struct UdpRelay {
    socket: Arc<UdpSocket>,
    sessions: Arc<SessionStore>,
    dispatcher: Arc<Dispatcher>,
    ws: Arc<dyn SessionSender>,
    bindings: DashMap<SocketAddr, Binding>,
    /// Sources already reported as unroutable, to keep the log quiet
    logged_unknown: DashMap<SocketAddr, ()>,
    idle_timeout: Duration,
}

impl UdpRelay {
    /// Bind the relay socket and construct the relay
    pub async fn bind(
        addr: SocketAddr,
        sessions: Arc<SessionStore>,
        dispatcher: Arc<Dispatcher>,
        ws: Arc<dyn SessionSender>,
        idle_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_recv_buffer_size(RECV_BUFFER_BYTES * 16)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        info!(addr = %addr, "UDP relay listening");

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            sessions,
            dispatcher,
            ws,
            bindings: DashMap::new(),
            logged_unknown: DashMap::new(),
            idle_timeout,
        }))
    }

    /// Receive loop; runs until the task is aborted
    pub async fn run(self: Arc<Self>) {
        let mut buffer = vec![0u8; RECV_BUFFER_BYTES];
        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((len, src)) => {
                    let payload = Bytes::copy_from_slice(&buffer[..len]);
                    self.handle_datagram(src, payload).await;
                }
                Err(e) => {
                    warn!(error = %e, "UDP receive failed");
                    time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_datagram(&self, src: SocketAddr, payload: Bytes) {
        if !is_wireguard_datagram(&payload) {
            counter!("coordinator_udp_dropped_total", 1, "reason" => "not_wireguard");
            debug!(src = %src, "Dropping non-WireGuard datagram");
            return;
        }

        let binding = match self.bindings.get_mut(&src) {
            Some(mut entry) => {
                entry.last_seen = Instant::now();
                entry.clone()
            }
            None => match self.learn_binding(src).await {
                Some(binding) => binding,
                None => {
                    if self.logged_unknown.insert(src, ()).is_none() {
                        warn!(src = %src, "Dropping datagrams from unknown source");
                    }
                    counter!("coordinator_udp_dropped_total", 1, "reason" => "unknown_source");
                    return;
                }
            },
        };

        counter!("coordinator_udp_received_total", 1);
        let _ = self
            .dispatcher
            .forward_to_node(ForwardRequest {
                node_id: binding.node_id,
                client_id: binding.client_id,
                session_id: binding.session_id,
                payload,
            })
            .await;
    }

    /// Learn a binding for an unknown source.
    ///
    /// First preference: an existing binding from the same IP (a NAT that
    /// remapped the source port); the session carries over and the new
    /// endpoint is registered as an additional key. Second: when exactly one
    /// active attached session exists, the source is taken to be its client.
    async fn learn_binding(&self, src: SocketAddr) -> Option<Binding> {
        if let Some(existing) = self
            .bindings
            .iter()
            .find(|entry| entry.key().ip() == src.ip())
            .map(|entry| entry.value().clone())
        {
            let binding = Binding {
                last_seen: Instant::now(),
                ..existing
            };
            self.bindings.insert(src, binding.clone());
            info!(
                src = %src,
                session_id = ?binding.session_id,
                "Learned remapped client endpoint"
            );
            counter!("coordinator_udp_remaps_learned_total", 1);
            return Some(binding);
        }

        let mut candidates = Vec::new();
        for session_id in self.ws.known_sessions() {
            if let Ok(session) = self.sessions.get(session_id).await {
                if session.status == SessionStatus::Active {
                    candidates.push(session);
                }
            }
        }

        if candidates.len() == 1 {
            let session = candidates.remove(0);
            let binding = Binding {
                node_id: session.node_id,
                client_id: session.client_id,
                session_id: Some(session.session_id),
                last_seen: Instant::now(),
            };
            self.bindings.insert(src, binding.clone());
            info!(
                src = %src,
                session_id = %session.session_id,
                "Adopted client endpoint from attached session"
            );
            return Some(binding);
        }

        None
    }

    /// Register a client endpoint explicitly (return-path bookkeeping)
    pub fn register_binding(
        &self,
        src: SocketAddr,
        node_id: Uuid,
        client_id: Uuid,
        session_id: Option<Uuid>,
    ) {
        self.bindings.insert(
            src,
            Binding {
                node_id,
                client_id,
                session_id,
                last_seen: Instant::now(),
            },
        );
        self.logged_unknown.remove(&src);
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Spawn the idle-eviction sweeper
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_once();
            }
        })
    }

    /// Evict bindings idle past the timeout
    pub fn sweep_once(&self) {
        let now = Instant::now();
        let before = self.bindings.len();
        self.bindings
            .retain(|_, binding| now.duration_since(binding.last_seen) < self.idle_timeout);
        let evicted = before - self.bindings.len();
        if evicted > 0 {
            debug!(evicted, "Idle UDP bindings evicted");
            counter!("coordinator_udp_bindings_evicted_total", evicted as u64);
        }
        self.logged_unknown.clear();
    }
}

#[async_trait]
impl DatagramSender for UdpRelay {
    fn endpoint_for(&self, session_id: Option<Uuid>, client_id: Uuid) -> Option<SocketAddr> {
        let mut best: Option<(SocketAddr, Instant, bool)> = None;
        for entry in self.bindings.iter() {
            let by_session = session_id.is_some() && entry.session_id == session_id;
            let by_client = entry.client_id == client_id;
            if !by_session && !by_client {
                continue;
            }
            let candidate = (*entry.key(), entry.last_seen, by_session);
            best = match best {
                // Session matches beat client matches; recency breaks ties
                Some(current)
                    if (current.2 && !candidate.2)
                        || (current.2 == candidate.2 && current.1 >= candidate.1) =>
                {
                    Some(current)
                }
                _ => Some(candidate),
            };
        }
        best.map(|(addr, _, _)| addr)
    }

    async fn send_to(&self, addr: SocketAddr, payload: &[u8]) -> bool {
        match self.socket.send_to(payload, addr).await {
            Ok(_) => {
                counter!("coordinator_udp_sent_total", 1);
                true
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "UDP send failed");
                false
            }
        }
    }
}
