//! WebSocket relay: one attachment per session on `/relay/{session_id}`.
//!
//! Attachment state machine: Opening (admitted, "connected" not yet sent)
//! -> Open (relaying) -> Closed (detached, session closed). A session can
//! hold at most one attachment at a time; a second upgrade for the same
//! session is rejected with a policy-violation close.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Dispatcher, ForwardRequest, SessionSender};
use crate::sessions::SessionStore;
use veilmesh_common::frame::{decode_frame, encode_batch, RelayFrame};
use veilmesh_common::{Direction, RelayMessage, SessionStatus};

/// WebSocket close code for policy violations (RFC 6455 §7.4.1)
const CLOSE_POLICY_VIOLATION: u16 = 1008;

const STATE_OPENING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Relay tuning knobs
#[derive(Debug, Clone)]
pub struct WsRelayConfig {
    pub heartbeat_interval: Duration,
    /// Maximum packets grouped into one outbound batch
    pub batch_max: usize,
    /// How long the writer waits to fill a batch
    pub batch_window: Duration,
    /// Bounded depth of the per-session writer queue
    pub writer_queue_depth: usize,
}

impl Default for WsRelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            batch_max: 10,
            batch_window: Duration::from_millis(10),
            writer_queue_depth: 1024,
        }
    }
}

/// Frames queued at the per-session writer
enum Outbound {
    /// Opaque packet, subject to batching
    Packet(Bytes),
    /// JSON envelope, serialized in-line with packet writes
    Envelope(RelayMessage),
}

struct Attachment {
    tx: mpsc::Sender<Outbound>,
    node_id: Uuid,
    client_id: Uuid,
    state: AtomicU8,
}

pub struct WsRelay {
    sessions: Arc<SessionStore>,
    dispatcher: Arc<Dispatcher>,
    config: WsRelayConfig,
    attachments: DashMap<Uuid, Arc<Attachment>>,
}

impl WsRelay {
    pub fn new(
        sessions: Arc<SessionStore>,
        dispatcher: Arc<Dispatcher>,
        config: WsRelayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            dispatcher,
            config,
            attachments: DashMap::new(),
        })
    }

    pub fn attached_count(&self) -> usize {
        self.attachments.len()
    }

    /// Run one upgraded socket to completion
    pub async fn handle_socket(self: Arc<Self>, mut socket: WebSocket, session_id: Uuid) {
        // Admission: the session must exist and be active
        let session = match self.sessions.get(session_id).await {
            Ok(session) if session.status == SessionStatus::Active => session,
            Ok(_) => {
                reject(&mut socket, "session is not active").await;
                return;
            }
            Err(_) => {
                reject(&mut socket, "unknown or expired session").await;
                return;
            }
        };

        // At most one attachment per session
        let (tx, rx) = mpsc::channel(self.config.writer_queue_depth);
        let attachment = Arc::new(Attachment {
            tx,
            node_id: session.node_id,
            client_id: session.client_id,
            state: AtomicU8::new(STATE_OPENING),
        });
        {
            use dashmap::mapref::entry::Entry;
            match self.attachments.entry(session_id) {
                Entry::Occupied(_) => {
                    reject(&mut socket, "session already attached").await;
                    return;
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(attachment.clone());
                }
            }
        }

        counter!("coordinator_ws_attachments_total", 1);
        gauge!("coordinator_ws_attached", self.attachments.len() as f64);
        info!(
            session_id = %session_id,
            node_id = %session.node_id,
            client_id = %session.client_id,
            "Relay session attached"
        );

        let (ws_tx, mut ws_rx) = socket.split();

        // Writer task: owns the sink, applies outbound batching
        let writer = tokio::spawn(write_loop(
            ws_tx,
            rx,
            self.config.batch_max,
            self.config.batch_window,
        ));

        // Opening -> Open once the connected control is queued
        let connected = RelayMessage::server_control(session_id, "connected");
        if attachment.tx.send(Outbound::Envelope(connected)).await.is_ok() {
            attachment.state.store(STATE_OPEN, Ordering::Release);
        }

        // Server heartbeat, serialized with writes through the same queue
        let heartbeat_tx = attachment.tx.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = interval(heartbeat_interval);
            ticker.tick().await; // immediate first tick carries no heartbeat
            loop {
                ticker.tick().await;
                let envelope = RelayMessage::server_heartbeat(session_id);
                if heartbeat_tx.send(Outbound::Envelope(envelope)).await.is_err() {
                    break;
                }
            }
        });

        // Reader loop: in-order processing of inbound frames
        while let Some(incoming) = ws_rx.next().await {
            let payload = match incoming {
                Ok(Message::Binary(bytes)) => bytes,
                Ok(Message::Text(text)) => text.into_bytes(),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!(session_id = %session_id, error = %e, "Relay socket error");
                    break;
                }
            };

            if !self.process_inbound(session_id, &attachment, &payload).await {
                break;
            }
        }

        // Teardown: idempotent against racing closes
        attachment.state.store(STATE_CLOSED, Ordering::Release);
        heartbeat.abort();
        writer.abort();
        self.attachments.remove(&session_id);
        self.dispatcher.forget_session(session_id);
        if let Err(e) = self.sessions.close(session_id).await {
            warn!(session_id = %session_id, error = %e, "Session close failed");
        }

        gauge!("coordinator_ws_attached", self.attachments.len() as f64);
        info!(session_id = %session_id, "Relay session detached");
    }

    /// Handle one inbound frame; returns false when the session must close
    async fn process_inbound(
        &self,
        session_id: Uuid,
        attachment: &Attachment,
        payload: &[u8],
    ) -> bool {
        let frame = match decode_frame(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Dropping undecodable frame");
                counter!("coordinator_ws_frames_dropped_total", 1);
                return true;
            }
        };

        match frame {
            RelayFrame::Batch(packets) => {
                for packet in packets {
                    self.forward(session_id, attachment, packet).await;
                }
                true
            }
            RelayFrame::Data(packet) => {
                self.forward(session_id, attachment, packet).await;
                true
            }
            RelayFrame::Message(RelayMessage::Data {
                direction,
                payload,
                session_id: envelope_session,
            }) => {
                let Some(bytes) = decode_json_payload(&payload) else {
                    warn!(session_id = %session_id, "Data envelope with undecodable payload");
                    return true;
                };
                match direction {
                    Some(Direction::NodeToClient) => {
                        // A node relays replies for the sessions it serves
                        // through its own attachment; the envelope names the
                        // session the reply belongs to.
                        let target = envelope_session.unwrap_or(session_id);
                        let (client_id, node_id) = if target == session_id {
                            (attachment.client_id, attachment.node_id)
                        } else {
                            match self.sessions.get(target).await {
                                Ok(session) => (session.client_id, session.node_id),
                                Err(_) => (attachment.client_id, attachment.node_id),
                            }
                        };
                        let _ = self
                            .dispatcher
                            .send_to_client(Some(target), client_id, node_id, bytes)
                            .await;
                    }
                    _ => self.forward(session_id, attachment, bytes).await,
                }
                true
            }
            RelayFrame::Message(message @ RelayMessage::Control { .. }) => {
                match message.control_action() {
                    Some("disconnect") => {
                        info!(session_id = %session_id, "Disconnect control received");
                        false
                    }
                    Some(action) => {
                        debug!(session_id = %session_id, action = %action, "Control ignored");
                        true
                    }
                    None => true,
                }
            }
            RelayFrame::Message(RelayMessage::Heartbeat { .. }) => {
                debug!(session_id = %session_id, "Client heartbeat");
                true
            }
        }
    }

    async fn forward(&self, session_id: Uuid, attachment: &Attachment, payload: Bytes) {
        let _ = self
            .dispatcher
            .forward_to_node(ForwardRequest {
                node_id: attachment.node_id,
                client_id: attachment.client_id,
                session_id: Some(session_id),
                payload,
            })
            .await;
    }
}

impl SessionSender for WsRelay {
    fn send_to_session(&self, session_id: Uuid, payload: Bytes) -> bool {
        let Some(attachment) = self.attachments.get(&session_id) else {
            return false;
        };
        if attachment.state.load(Ordering::Acquire) != STATE_OPEN {
            return false;
        }
        match attachment.tx.try_send(Outbound::Packet(payload)) {
            Ok(()) => true,
            Err(_) => {
                // Writer queue full or writer gone: drop, never block
                counter!("coordinator_ws_writer_overflow_total", 1);
                false
            }
        }
    }

    fn known_sessions(&self) -> Vec<Uuid> {
        self.attachments.iter().map(|entry| *entry.key()).collect()
    }
}

/// Close an unadmitted socket with a policy-violation frame
async fn reject(socket: &mut WebSocket, reason: &str) {
    warn!(reason = %reason, "Relay attachment rejected");
    counter!("coordinator_ws_rejections_total", 1);
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: reason.to_string().into(),
        })))
        .await;
}

/// Writer loop: envelopes go out as JSON text immediately; packets are
/// grouped into a batch when at least two arrive inside the batch window.
async fn write_loop(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    batch_max: usize,
    batch_window: Duration,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Envelope(envelope) => {
                if send_envelope(&mut sink, &envelope).await.is_err() {
                    return;
                }
            }
            Outbound::Packet(first) => {
                let mut batch = vec![first];
                let mut trailing = None;
                let deadline = Instant::now() + batch_window;

                while batch.len() < batch_max {
                    match timeout_at(deadline, rx.recv()).await {
                        Ok(Some(Outbound::Packet(packet))) => batch.push(packet),
                        Ok(Some(Outbound::Envelope(envelope))) => {
                            trailing = Some(envelope);
                            break;
                        }
                        Ok(None) | Err(_) => break,
                    }
                }

                let result = if batch.len() >= 2 {
                    match encode_batch(&batch) {
                        Ok(wire) => sink.send(Message::Binary(wire)).await,
                        Err(e) => {
                            warn!(error = %e, "Batch encode failed, sending raw");
                            send_each(&mut sink, batch).await
                        }
                    }
                } else {
                    sink.send(Message::Binary(batch.remove(0).to_vec())).await
                };
                if result.is_err() {
                    return;
                }

                if let Some(envelope) = trailing {
                    if send_envelope(&mut sink, &envelope).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn send_each(
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    packets: Vec<Bytes>,
) -> Result<(), axum::Error> {
    for packet in packets {
        sink.send(Message::Binary(packet.to_vec())).await?;
    }
    Ok(())
}

async fn send_envelope(
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    envelope: &RelayMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(envelope) {
        Ok(text) => sink.send(Message::Text(text)).await,
        Err(e) => {
            warn!(error = %e, "Envelope serialization failed");
            Ok(())
        }
    }
}

/// Extract packet bytes from a JSON data envelope payload: base64 strings
/// first, raw byte arrays as a fallback.
fn decode_json_payload(payload: &serde_json::Value) -> Option<Bytes> {
    match payload {
        serde_json::Value::String(text) => match BASE64.decode(text) {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(_) => Some(Bytes::copy_from_slice(text.as_bytes())),
        },
        serde_json::Value::Array(values) => {
            let mut bytes = Vec::with_capacity(values.len());
            for value in values {
                bytes.push(value.as_u64().filter(|v| *v <= 255)? as u8);
            }
            Some(Bytes::from(bytes))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_json_payload_base64() {
        let payload = serde_json::json!(BASE64.encode([0x04, 0xAA, 0xBB]));
        assert_eq!(
            decode_json_payload(&payload).unwrap().as_ref(),
            &[0x04, 0xAA, 0xBB]
        );
    }

    #[test]
    fn test_decode_json_payload_byte_array() {
        let payload = serde_json::json!([4, 170, 187]);
        assert_eq!(
            decode_json_payload(&payload).unwrap().as_ref(),
            &[0x04, 0xAA, 0xBB]
        );
    }

    #[test]
    fn test_decode_json_payload_rejects_bad_shapes() {
        assert!(decode_json_payload(&serde_json::json!(42)).is_none());
        assert!(decode_json_payload(&serde_json::json!([4, 300])).is_none());
        assert!(decode_json_payload(&serde_json::json!({"nested": true})).is_none());
    }

    #[test]
    fn test_default_config_matches_contract() {
        let config = WsRelayConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.batch_max, 10);
        assert_eq!(config.batch_window, Duration::from_millis(10));
        assert_eq!(config.writer_queue_depth, 1024);
    }
}
