//! Relay subsystem: WebSocket relay, UDP relay, and the dispatcher that
//! arbitrates delivery paths between them.
//!
//! The relays and the dispatcher reference each other only through the
//! capability traits below; each relay registers itself with the dispatcher
//! on startup.

pub mod dispatch;
pub mod udp;
pub mod ws;

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use uuid::Uuid;

pub use dispatch::{DeliveryPath, Dispatcher, ForwardRequest};
pub use udp::UdpRelay;
pub use ws::{WsRelay, WsRelayConfig};

/// Capability to push bytes at an attached relay session.
///
/// Implemented by the WebSocket relay. Sends are non-blocking: a full writer
/// queue or a missing attachment reports `false` and the frame is dropped.
pub trait SessionSender: Send + Sync {
    fn send_to_session(&self, session_id: Uuid, payload: Bytes) -> bool;
    fn known_sessions(&self) -> Vec<Uuid>;
}

/// Capability to reach a client over the UDP side channel.
///
/// Implemented by the UDP relay, which owns the socket and the learned
/// client endpoint bindings.
#[async_trait]
pub trait DatagramSender: Send + Sync {
    /// Last-known client endpoint for a session or client id
    fn endpoint_for(&self, session_id: Option<Uuid>, client_id: Uuid) -> Option<SocketAddr>;
    async fn send_to(&self, addr: SocketAddr, payload: &[u8]) -> bool;
}

/// Events surfaced to the platform when the relay cannot make progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// No viable path to a node for a forward request
    NoPathToNode { node_id: Uuid, client_id: Uuid },
    /// No viable path back to a client
    NoPathToClient {
        client_id: Uuid,
        session_id: Option<Uuid>,
    },
}
