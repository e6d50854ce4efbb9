//! Durable WebSocket attachment to the coordinator relay.
//!
//! The agent asks the coordinator for a route to itself, which yields a
//! session and its relay endpoint, then attaches there. Inbound frames feed
//! the packet forwarder; forwarder replies go back as node-to-client data
//! envelopes. Lost links are re-established with exponential backoff and a
//! fresh session.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EgressConfig;
use crate::coordinator::CoordinatorClient;
use crate::error::{EgressError, Result};
use crate::forwarder::{IncomingPacket, PacketForwarder};
use crate::shutdown::ShutdownSignal;
use crate::stun::NatProbe;
use veilmesh_common::frame::{decode_frame, RelayFrame};
use veilmesh_common::{ClientNetworkInfo, Direction, RelayMessage, RouteRequest, RouteResponse};

/// Heartbeat cadence on the relay link
const LINK_HEARTBEAT: Duration = Duration::from_secs(30);
/// Reconnect backoff base
const RECONNECT_BASE: Duration = Duration::from_secs(5);
/// Attempts per reconnect cycle before the backoff resets with a long pause
const RECONNECT_MAX_ATTEMPTS: u32 = 10;

pub struct RelayLink {
    config: EgressConfig,
    coordinator: Arc<CoordinatorClient>,
    forwarder: Arc<PacketForwarder>,
    nat_probe: NatProbe,
    http: reqwest::Client,
    attached: AtomicBool,
}

impl RelayLink {
    pub fn new(
        config: EgressConfig,
        coordinator: Arc<CoordinatorClient>,
        forwarder: Arc<PacketForwarder>,
        nat_probe: NatProbe,
    ) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            config,
            coordinator,
            forwarder,
            nat_probe,
            http,
            attached: AtomicBool::new(false),
        })
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Request a relay session for this node: a route to itself
    async fn acquire_session(&self) -> Result<(Uuid, String)> {
        let node_id = self.coordinator.node_id();
        let request = RouteRequest {
            client_id: node_id,
            target_node_id: Some(node_id),
            requirements: None,
            client_network_info: ClientNetworkInfo {
                ipv4: std::net::Ipv4Addr::LOCALHOST,
                nat_type: self.nat_probe.nat_type,
                stun_mapped_address: self.nat_probe.mapped_addr,
            },
        };

        let url = format!(
            "{}/api/v1/routing/request",
            self.config.coordinator.server_url.trim_end_matches('/')
        );
        let response = self.http.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(EgressError::RelayLink(format!(
                "route request failed with status {}",
                response.status()
            )));
        }

        let route: RouteResponse = response.json().await?;
        Ok((
            route.selected_route.session_id,
            route.selected_route.relay_endpoint,
        ))
    }

    /// Run the attachment until shutdown; owns the forwarder event stream
    pub fn spawn(
        self: Arc<Self>,
        shutdown: ShutdownSignal,
        mut events: mpsc::Receiver<IncomingPacket>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            while !shutdown.is_requested() {
                if !self.coordinator.is_registered() {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }

                match self.run_session(&shutdown, &mut events).await {
                    Ok(()) => {
                        attempt = 0;
                    }
                    Err(e) => {
                        attempt += 1;
                        let wait = RECONNECT_BASE * 2u32.pow((attempt - 1).min(6));
                        warn!(
                            attempt,
                            wait_seconds = wait.as_secs(),
                            error = %e,
                            "Relay link lost"
                        );
                        counter!("egress_relay_reconnects_total", 1);
                        if attempt >= RECONNECT_MAX_ATTEMPTS {
                            warn!("Reconnect attempts exhausted, pausing before a fresh cycle");
                            attempt = 0;
                            tokio::time::sleep(Duration::from_secs(60)).await;
                        } else {
                            tokio::time::sleep(wait).await;
                        }
                    }
                }
            }
            info!("Relay link stopped");
        })
    }

    /// One attachment lifecycle: acquire a session, attach, pump frames
    async fn run_session(
        &self,
        shutdown: &ShutdownSignal,
        events: &mut mpsc::Receiver<IncomingPacket>,
    ) -> Result<()> {
        let (session_id, endpoint) = self.acquire_session().await?;
        info!(session_id = %session_id, endpoint = %endpoint, "Attaching relay session");

        let (stream, _) = connect_async(&endpoint).await?;
        let (mut sink, mut source) = stream.split();

        self.attached.store(true, Ordering::Release);
        self.forwarder.note_session(session_id);
        counter!("egress_relay_attachments_total", 1);

        let mut heartbeat = interval(LINK_HEARTBEAT);
        heartbeat.tick().await; // first tick is immediate

        let result = loop {
            if shutdown.is_requested() {
                let _ = sink.send(Message::Close(None)).await;
                break Ok(());
            }

            tokio::select! {
                incoming = source.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(bytes))) => {
                            if !self.handle_inbound(session_id, &bytes).await {
                                break Ok(());
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            if !self.handle_inbound(session_id, text.as_bytes()).await {
                                break Ok(());
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            break Err(EgressError::RelayLink("relay closed the link".to_string()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Err(e.into()),
                    }
                }
                reply = events.recv() => {
                    let Some(packet) = reply else {
                        break Ok(());
                    };
                    let envelope = RelayMessage::Data {
                        direction: Some(Direction::NodeToClient),
                        payload: serde_json::Value::String(BASE64.encode(&packet.payload)),
                        session_id: Some(packet.session_id),
                    };
                    match serde_json::to_string(&envelope) {
                        Ok(text) => {
                            if sink.send(Message::Text(text)).await.is_err() {
                                break Err(EgressError::RelayLink("send failed".to_string()));
                            }
                            counter!("egress_replies_relayed_total", 1);
                        }
                        Err(e) => warn!(error = %e, "Reply envelope serialization failed"),
                    }
                }
                _ = heartbeat.tick() => {
                    let envelope = RelayMessage::Heartbeat {
                        session_id: Some(session_id),
                        direction: None,
                    };
                    if let Ok(text) = serde_json::to_string(&envelope) {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break Err(EgressError::RelayLink("heartbeat send failed".to_string()));
                        }
                    }
                }
            }
        };

        self.attached.store(false, Ordering::Release);
        self.forwarder.forget_session(session_id);
        result
    }

    /// Process one inbound relay frame; returns false on a disconnect control
    async fn handle_inbound(&self, session_id: Uuid, payload: &[u8]) -> bool {
        let frame = match decode_frame(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable relay frame");
                return true;
            }
        };

        match frame {
            RelayFrame::Batch(packets) => {
                for packet in packets {
                    if let Err(e) = self.forwarder.handle_outbound(session_id, &packet).await {
                        debug!(error = %e, "Batched packet not forwarded");
                    }
                }
                true
            }
            RelayFrame::Data(packet) => {
                if let Err(e) = self.forwarder.handle_outbound(session_id, &packet).await {
                    debug!(error = %e, "Packet not forwarded");
                }
                true
            }
            RelayFrame::Message(RelayMessage::Data { payload, .. }) => {
                if let serde_json::Value::String(encoded) = payload {
                    if let Ok(bytes) = BASE64.decode(encoded.as_bytes()) {
                        if let Err(e) = self.forwarder.handle_outbound(session_id, &bytes).await {
                            debug!(error = %e, "Enveloped packet not forwarded");
                        }
                    }
                }
                true
            }
            RelayFrame::Message(message @ RelayMessage::Control { .. }) => {
                match message.control_action() {
                    Some("disconnect") => {
                        info!(session_id = %session_id, "Relay requested disconnect");
                        false
                    }
                    Some("connected") => {
                        debug!(session_id = %session_id, "Relay confirmed attachment");
                        true
                    }
                    other => {
                        debug!(action = ?other, "Relay control ignored");
                        true
                    }
                }
            }
            RelayFrame::Message(RelayMessage::Heartbeat { .. }) => true,
        }
    }
}
