//! Packet dispatcher: per packet, try the lowest-latency viable path first.
//!
//! Forward direction (toward a node): attached WS for the session, then a
//! scan of attached WS sessions for the (client, node) pair, then a direct
//! HTTP post to the node's API. Return direction (toward a client): WS by
//! session, WS by scan, then the UDP side channel. The ordering is part of
//! the contract with nodes and must not be rearranged.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{DatagramSender, RelayEvent, SessionSender};
use crate::error::{CoordinatorError, Result};
use crate::registry::NodeRegistry;
use crate::sessions::SessionStore;

/// Bounded depth of the platform event channel; slow consumers drop
const EVENT_QUEUE_DEPTH: usize = 256;

/// A request to move one payload toward a node
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub node_id: Uuid,
    pub client_id: Uuid,
    pub session_id: Option<Uuid>,
    pub payload: Bytes,
}

/// Which leg carried a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    WsBySession,
    WsByScan,
    HttpDirect,
    Udp,
}

pub struct Dispatcher {
    sessions: Arc<SessionStore>,
    registry: Arc<NodeRegistry>,
    http: reqwest::Client,
    node_api_port: u16,
    default_node_api_url: Option<String>,
    /// (client, node) pair resolved to a session by a previous scan
    associations: DashMap<(Uuid, Uuid), Uuid>,
    ws: RwLock<Option<Arc<dyn SessionSender>>>,
    udp: RwLock<Option<Arc<dyn DatagramSender>>>,
    events: mpsc::Sender<RelayEvent>,
}

impl Dispatcher {
    pub fn new(
        sessions: Arc<SessionStore>,
        registry: Arc<NodeRegistry>,
        node_api_port: u16,
        default_node_api_url: Option<String>,
        http_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<RelayEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .unwrap_or_default();

        (
            Arc::new(Self {
                sessions,
                registry,
                http,
                node_api_port,
                default_node_api_url,
                associations: DashMap::new(),
                ws: RwLock::new(None),
                udp: RwLock::new(None),
                events,
            }),
            events_rx,
        )
    }

    /// Called by the WebSocket relay on startup
    pub async fn register_session_sender(&self, sender: Arc<dyn SessionSender>) {
        *self.ws.write().await = Some(sender);
    }

    /// Called by the UDP relay on startup
    pub async fn register_datagram_sender(&self, sender: Arc<dyn DatagramSender>) {
        *self.udp.write().await = Some(sender);
    }

    /// Forget any cached association for a torn-down session
    pub fn forget_session(&self, session_id: Uuid) {
        self.associations
            .retain(|_, cached| *cached != session_id);
    }

    /// Try the attached WS for `session_id` directly
    async fn try_ws_by_session(&self, session_id: Uuid, payload: &Bytes) -> bool {
        let guard = self.ws.read().await;
        let Some(ws) = guard.as_ref() else {
            return false;
        };
        ws.send_to_session(session_id, payload.clone())
    }

    /// Scan attached sessions for one bound to `(client_id, node_id)`
    async fn try_ws_by_scan(
        &self,
        client_id: Uuid,
        node_id: Uuid,
        payload: &Bytes,
    ) -> Option<Uuid> {
        if let Some(cached) = self.associations.get(&(client_id, node_id)) {
            let cached = *cached;
            if self.try_ws_by_session(cached, payload).await {
                return Some(cached);
            }
            self.associations.remove(&(client_id, node_id));
        }

        let attached: Vec<Uuid> = {
            let guard = self.ws.read().await;
            guard.as_ref()?.known_sessions()
        };

        for session_id in attached {
            let Ok(session) = self.sessions.get(session_id).await else {
                continue;
            };
            if session.client_id == client_id && session.node_id == node_id {
                if self.try_ws_by_session(session_id, payload).await {
                    self.associations
                        .insert((client_id, node_id), session_id);
                    return Some(session_id);
                }
            }
        }
        None
    }

    /// Direct HTTP post of the payload to the node's API
    async fn try_http_direct(&self, request: &ForwardRequest) -> Result<()> {
        let url = match self.registry.get(request.node_id).await {
            Ok(node) => format!(
                "http://{}:{}/api/v1/packets/from-server",
                node.network_info.ipv4, self.node_api_port
            ),
            Err(_) => {
                let base = self.default_node_api_url.as_ref().ok_or_else(|| {
                    CoordinatorError::NotFound(format!("node {}", request.node_id))
                })?;
                format!("{}/api/v1/packets/from-server", base.trim_end_matches('/'))
            }
        };

        let body = serde_json::json!({
            "session_id": request.session_id,
            "client_id": request.client_id,
            "payload": BASE64.encode(&request.payload),
        });

        let response = self.http.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(CoordinatorError::Upstream(format!(
                "node API returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Move a payload toward its node. At-most-once: a `false`/error on every
    /// leg drops the packet and raises a platform event.
    pub async fn forward_to_node(&self, request: ForwardRequest) -> Result<DeliveryPath> {
        if let Some(session_id) = request.session_id {
            if self.try_ws_by_session(session_id, &request.payload).await {
                counter!("coordinator_packets_forwarded_total", 1, "path" => "ws_session");
                return Ok(DeliveryPath::WsBySession);
            }
        }

        if self
            .try_ws_by_scan(request.client_id, request.node_id, &request.payload)
            .await
            .is_some()
        {
            counter!("coordinator_packets_forwarded_total", 1, "path" => "ws_scan");
            return Ok(DeliveryPath::WsByScan);
        }

        match self.try_http_direct(&request).await {
            Ok(()) => {
                counter!("coordinator_packets_forwarded_total", 1, "path" => "http");
                Ok(DeliveryPath::HttpDirect)
            }
            Err(e) => {
                warn!(
                    node_id = %request.node_id,
                    client_id = %request.client_id,
                    error = %e,
                    "No path to node, dropping packet"
                );
                counter!("coordinator_packets_dropped_total", 1, "direction" => "to_node");
                let _ = self.events.try_send(RelayEvent::NoPathToNode {
                    node_id: request.node_id,
                    client_id: request.client_id,
                });
                Err(CoordinatorError::Upstream("no path to node".to_string()))
            }
        }
    }

    /// Move a payload back toward its client: WS by session, WS by scan,
    /// then the UDP side channel.
    pub async fn send_to_client(
        &self,
        session_id: Option<Uuid>,
        client_id: Uuid,
        node_id: Uuid,
        payload: Bytes,
    ) -> Result<DeliveryPath> {
        if let Some(session_id) = session_id {
            if self.try_ws_by_session(session_id, &payload).await {
                counter!("coordinator_packets_returned_total", 1, "path" => "ws_session");
                return Ok(DeliveryPath::WsBySession);
            }
        }

        if self
            .try_ws_by_scan(client_id, node_id, &payload)
            .await
            .is_some()
        {
            counter!("coordinator_packets_returned_total", 1, "path" => "ws_scan");
            return Ok(DeliveryPath::WsByScan);
        }

        let udp = { self.udp.read().await.clone() };
        if let Some(udp) = udp {
            if let Some(addr) = udp.endpoint_for(session_id, client_id) {
                if udp.send_to(addr, &payload).await {
                    counter!("coordinator_packets_returned_total", 1, "path" => "udp");
                    return Ok(DeliveryPath::Udp);
                }
            }
        }

        debug!(
            client_id = %client_id,
            session_id = ?session_id,
            "No path to client, dropping packet"
        );
        counter!("coordinator_packets_dropped_total", 1, "direction" => "to_client");
        let _ = self.events.try_send(RelayEvent::NoPathToClient {
            client_id,
            session_id,
        });
        Err(CoordinatorError::Upstream("no path to client".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemStore, TtlCache};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::net::SocketAddr;
    use std::sync::Mutex;

    struct FakeWs {
        accept: Vec<Uuid>,
        sent: Mutex<Vec<(Uuid, Bytes)>>,
    }

    impl SessionSender for FakeWs {
        fn send_to_session(&self, session_id: Uuid, payload: Bytes) -> bool {
            if self.accept.contains(&session_id) {
                self.sent.lock().unwrap().push((session_id, payload));
                true
            } else {
                false
            }
        }

        fn known_sessions(&self) -> Vec<Uuid> {
            self.accept.clone()
        }
    }

    struct FakeUdp {
        endpoint: Option<SocketAddr>,
        sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    #[async_trait]
    impl DatagramSender for FakeUdp {
        fn endpoint_for(&self, _session_id: Option<Uuid>, _client_id: Uuid) -> Option<SocketAddr> {
            self.endpoint
        }

        async fn send_to(&self, addr: SocketAddr, payload: &[u8]) -> bool {
            self.sent.lock().unwrap().push((addr, payload.to_vec()));
            true
        }
    }

    async fn dispatcher() -> (Arc<Dispatcher>, Arc<SessionStore>) {
        let store = Arc::new(MemStore::new());
        let cache = Arc::new(TtlCache::new());
        let sessions = Arc::new(SessionStore::new(
            store.clone(),
            cache.clone(),
            Duration::from_secs(3600),
        ));
        let registry = Arc::new(NodeRegistry::new(
            store,
            cache,
            Duration::from_secs(60),
            ChronoDuration::minutes(2),
        ));
        let (dispatcher, _events) =
            Dispatcher::new(sessions.clone(), registry, 8088, None, Duration::from_secs(5));
        (dispatcher, sessions)
    }

    #[tokio::test]
    async fn test_forward_prefers_session_ws() {
        let (dispatcher, _) = dispatcher().await;
        let session_id = Uuid::new_v4();
        let ws = Arc::new(FakeWs {
            accept: vec![session_id],
            sent: Mutex::new(Vec::new()),
        });
        dispatcher.register_session_sender(ws.clone()).await;

        let path = dispatcher
            .forward_to_node(ForwardRequest {
                node_id: Uuid::new_v4(),
                client_id: Uuid::new_v4(),
                session_id: Some(session_id),
                payload: Bytes::from_static(&[0x04, 0x01]),
            })
            .await
            .unwrap();

        assert_eq!(path, DeliveryPath::WsBySession);
        assert_eq!(ws.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_forward_scans_for_pair_and_caches() {
        let (dispatcher, sessions) = dispatcher().await;
        let session_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();
        let client_id = Uuid::new_v4();

        sessions
            .create(
                session_id,
                node_id,
                client_id,
                None,
                Utc::now() + ChronoDuration::hours(1),
                None,
            )
            .await
            .unwrap();

        let ws = Arc::new(FakeWs {
            accept: vec![session_id],
            sent: Mutex::new(Vec::new()),
        });
        dispatcher.register_session_sender(ws.clone()).await;

        // No session id in the request: only the scan can find it
        let path = dispatcher
            .forward_to_node(ForwardRequest {
                node_id,
                client_id,
                session_id: None,
                payload: Bytes::from_static(&[0x04]),
            })
            .await
            .unwrap();
        assert_eq!(path, DeliveryPath::WsByScan);
        assert_eq!(
            dispatcher
                .associations
                .get(&(client_id, node_id))
                .map(|e| *e),
            Some(session_id)
        );

        // Second send hits the cached association
        dispatcher
            .forward_to_node(ForwardRequest {
                node_id,
                client_id,
                session_id: None,
                payload: Bytes::from_static(&[0x04]),
            })
            .await
            .unwrap();
        assert_eq!(ws.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_no_path_raises_event() {
        let store = Arc::new(MemStore::new());
        let cache = Arc::new(TtlCache::new());
        let sessions = Arc::new(SessionStore::new(
            store.clone(),
            cache.clone(),
            Duration::from_secs(3600),
        ));
        let registry = Arc::new(NodeRegistry::new(
            store,
            cache,
            Duration::from_secs(60),
            ChronoDuration::minutes(2),
        ));
        let (dispatcher, mut events) =
            Dispatcher::new(sessions, registry, 8088, None, Duration::from_secs(5));

        let node_id = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        let result = dispatcher
            .forward_to_node(ForwardRequest {
                node_id,
                client_id,
                session_id: None,
                payload: Bytes::from_static(&[0x04]),
            })
            .await;

        assert!(result.is_err());
        assert_eq!(
            events.try_recv().unwrap(),
            RelayEvent::NoPathToNode { node_id, client_id }
        );
    }

    #[tokio::test]
    async fn test_return_path_falls_back_to_udp() {
        let (dispatcher, _) = dispatcher().await;
        let endpoint: SocketAddr = "203.0.113.5:40000".parse().unwrap();
        let udp = Arc::new(FakeUdp {
            endpoint: Some(endpoint),
            sent: Mutex::new(Vec::new()),
        });
        dispatcher.register_datagram_sender(udp.clone()).await;

        let path = dispatcher
            .send_to_client(
                None,
                Uuid::new_v4(),
                Uuid::new_v4(),
                Bytes::from_static(&[0x04, 0xAA]),
            )
            .await
            .unwrap();

        assert_eq!(path, DeliveryPath::Udp);
        let sent = udp.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, endpoint);
    }
}
