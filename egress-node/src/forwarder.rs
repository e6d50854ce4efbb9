//! Packet forwarder: decodes IP datagrams received over the relay and emits
//! them through OS sockets. UDP goes out an unbound socket; TCP flows are
//! connection-tracked with a four-tuple table. Replies come back as
//! incoming-packet events tagged with a session id.

use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EgressError, Result};

const MIN_IP_HEADER: usize = 20;
const READ_BUFFER_BYTES: usize = 65536;

/// A reply surfaced from the Internet, tagged with the session it belongs to
#[derive(Debug, Clone)]
pub struct IncomingPacket {
    pub session_id: Uuid,
    pub payload: Bytes,
}

/// Connection-tracking key: the full four-tuple of the tunneled flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    dst_ip: Ipv4Addr,
    dst_port: u16,
    src_ip: Ipv4Addr,
    src_port: u16,
}

struct TcpFlow {
    writer: mpsc::Sender<Bytes>,
    session_id: Uuid,
    last_activity: Instant,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

pub struct PacketForwarder {
    /// Unbound socket for outbound UDP and its replies
    udp: Arc<UdpSocket>,
    flows: DashMap<FlowKey, TcpFlow>,
    /// UDP remote endpoint to session, learned from outbound sends
    udp_peers: DashMap<SocketAddr, (Uuid, Instant)>,
    /// Sessions with recent traffic, for reply attribution fallback
    active_sessions: DashMap<Uuid, Instant>,
    events: mpsc::Sender<IncomingPacket>,
    tcp_connect_timeout: Duration,
    idle_timeout: Duration,
}

impl PacketForwarder {
    /// Bind the UDP socket and create the forwarder plus its event stream
    pub async fn new(
        tcp_connect_timeout: Duration,
        idle_timeout: Duration,
        event_queue_depth: usize,
    ) -> Result<(Arc<Self>, mpsc::Receiver<IncomingPacket>)> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_nonblocking(true)?;
        socket.set_recv_buffer_size(READ_BUFFER_BYTES * 16)?;
        let any = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        socket.bind(&any.into())?;
        let udp = UdpSocket::from_std(socket.into())?;
        let (events, events_rx) = mpsc::channel(event_queue_depth);

        let forwarder = Arc::new(Self {
            udp: Arc::new(udp),
            flows: DashMap::new(),
            udp_peers: DashMap::new(),
            active_sessions: DashMap::new(),
            events,
            tcp_connect_timeout,
            idle_timeout,
        });

        Ok((forwarder, events_rx))
    }

    /// Spawn the UDP reply reader; returns its handle for shutdown
    pub fn start_udp_reader(self: &Arc<Self>) -> JoinHandle<()> {
        let forwarder = self.clone();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; READ_BUFFER_BYTES];
            loop {
                match forwarder.udp.recv_from(&mut buffer).await {
                    Ok((len, src)) => {
                        forwarder
                            .surface_udp_reply(src, Bytes::copy_from_slice(&buffer[..len]))
                            .await;
                    }
                    Err(e) => {
                        warn!(error = %e, "UDP reply receive failed");
                        time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        })
    }

    /// Mark a session as carrying traffic (attribution candidate)
    pub fn note_session(&self, session_id: Uuid) {
        self.active_sessions.insert(session_id, Instant::now());
    }

    /// Forget a detached session
    pub fn forget_session(&self, session_id: Uuid) {
        self.active_sessions.remove(&session_id);
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Decode one outbound IP datagram and emit it
    pub async fn handle_outbound(self: &Arc<Self>, session_id: Uuid, packet: &[u8]) -> Result<()> {
        if packet.len() < MIN_IP_HEADER {
            counter!("egress_packets_invalid_total", 1);
            return Err(EgressError::Forwarding(format!(
                "datagram of {} bytes is shorter than an IP header",
                packet.len()
            )));
        }

        self.note_session(session_id);

        match packet[0] >> 4 {
            4 => self.handle_ipv4(session_id, packet).await,
            6 => {
                // IPv6 egress is not wired up; drop after logging
                counter!("egress_packets_dropped_total", 1, "reason" => "ipv6");
                debug!(session_id = %session_id, "Dropping IPv6 datagram");
                Ok(())
            }
            version => {
                counter!("egress_packets_invalid_total", 1);
                Err(EgressError::Forwarding(format!(
                    "unsupported IP version {}",
                    version
                )))
            }
        }
    }

    async fn handle_ipv4(self: &Arc<Self>, session_id: Uuid, packet: &[u8]) -> Result<()> {
        let ipv4 = Ipv4Packet::new(packet)
            .ok_or_else(|| EgressError::Forwarding("unparsable IPv4 header".to_string()))?;

        match ipv4.get_next_level_protocol() {
            IpNextHeaderProtocols::Udp => self.handle_ipv4_udp(session_id, &ipv4).await,
            IpNextHeaderProtocols::Tcp => self.handle_ipv4_tcp(session_id, &ipv4).await,
            other => {
                counter!("egress_packets_dropped_total", 1, "reason" => "protocol");
                debug!(
                    session_id = %session_id,
                    protocol = other.0,
                    "Dropping datagram with unhandled protocol"
                );
                Ok(())
            }
        }
    }

    async fn handle_ipv4_udp(&self, session_id: Uuid, ipv4: &Ipv4Packet<'_>) -> Result<()> {
        let udp = UdpPacket::new(ipv4.payload())
            .ok_or_else(|| EgressError::Forwarding("unparsable UDP header".to_string()))?;

        let remote = SocketAddr::new(
            IpAddr::V4(ipv4.get_destination()),
            udp.get_destination(),
        );

        self.udp.send_to(udp.payload(), remote).await?;
        self.udp_peers.insert(remote, (session_id, Instant::now()));
        counter!("egress_packets_forwarded_total", 1, "protocol" => "udp");
        Ok(())
    }

    async fn handle_ipv4_tcp(self: &Arc<Self>, session_id: Uuid, ipv4: &Ipv4Packet<'_>) -> Result<()> {
        let tcp = TcpPacket::new(ipv4.payload())
            .ok_or_else(|| EgressError::Forwarding("unparsable TCP header".to_string()))?;

        let key = FlowKey {
            dst_ip: ipv4.get_destination(),
            dst_port: tcp.get_destination(),
            src_ip: ipv4.get_source(),
            src_port: tcp.get_source(),
        };
        let payload = Bytes::copy_from_slice(tcp.payload());

        if let Some(mut flow) = self.flows.get_mut(&key) {
            flow.last_activity = Instant::now();
            if !payload.is_empty() && flow.writer.send(payload).await.is_err() {
                drop(flow);
                self.teardown_flow(&key);
                return Err(EgressError::Forwarding(
                    "flow writer is gone".to_string(),
                ));
            }
            counter!("egress_packets_forwarded_total", 1, "protocol" => "tcp");
            return Ok(());
        }

        let flow = self.open_flow(key, session_id).await?;
        if !payload.is_empty() {
            let _ = flow.send(payload).await;
        }
        counter!("egress_packets_forwarded_total", 1, "protocol" => "tcp");
        Ok(())
    }

    /// Open and track a TCP flow toward `(dst_ip, dst_port)`
    async fn open_flow(&self, key: FlowKey, session_id: Uuid) -> Result<mpsc::Sender<Bytes>> {
        let remote = SocketAddr::new(IpAddr::V4(key.dst_ip), key.dst_port);
        let stream = time::timeout(self.tcp_connect_timeout, TcpStream::connect(remote))
            .await
            .map_err(|_| EgressError::Timeout(format!("TCP connect to {}", remote)))??;

        info!(session_id = %session_id, remote = %remote, "TCP flow opened");
        counter!("egress_tcp_flows_opened_total", 1);

        let (mut read_half, mut write_half) = stream.into_split();

        let (writer, mut writer_rx) = mpsc::channel::<Bytes>(64);
        let writer_task = tokio::spawn(async move {
            while let Some(chunk) = writer_rx.recv().await {
                if write_half.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let events = self.events.clone();
        let reader_task = tokio::spawn(async move {
            let mut buffer = vec![0u8; READ_BUFFER_BYTES];
            loop {
                match read_half.read(&mut buffer).await {
                    Ok(0) => break,
                    Ok(len) => {
                        let packet = IncomingPacket {
                            session_id,
                            payload: Bytes::copy_from_slice(&buffer[..len]),
                        };
                        if events.send(packet).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "TCP flow read ended");
                        break;
                    }
                }
            }
        });

        self.flows.insert(
            key,
            TcpFlow {
                writer: writer.clone(),
                session_id,
                last_activity: Instant::now(),
                reader_task,
                writer_task,
            },
        );
        Ok(writer)
    }

    fn teardown_flow(&self, key: &FlowKey) {
        if let Some((_, flow)) = self.flows.remove(key) {
            flow.reader_task.abort();
            flow.writer_task.abort();
            counter!("egress_tcp_flows_closed_total", 1);
        }
    }

    /// Attribute a UDP reply to a session.
    ///
    /// The peer map learned from outbound sends attributes exactly. Without
    /// a hit, a single active session is used; with several, the first known
    /// one is taken, which can misattribute (known limitation).
    async fn surface_udp_reply(&self, src: SocketAddr, payload: Bytes) {
        let session_id = if let Some(entry) = self.udp_peers.get(&src) {
            Some(entry.0)
        } else {
            let sessions: Vec<Uuid> = self
                .active_sessions
                .iter()
                .map(|entry| *entry.key())
                .collect();
            match sessions.as_slice() {
                [] => None,
                [only] => Some(*only),
                [first, ..] => {
                    debug!(
                        src = %src,
                        candidates = sessions.len(),
                        "Ambiguous UDP reply, attributing to the first session"
                    );
                    Some(*first)
                }
            }
        };

        let Some(session_id) = session_id else {
            counter!("egress_packets_dropped_total", 1, "reason" => "no_session");
            debug!(src = %src, "Dropping UDP reply with no session");
            return;
        };

        counter!("egress_replies_total", 1, "protocol" => "udp");
        let _ = self
            .events
            .send(IncomingPacket {
                session_id,
                payload,
            })
            .await;
    }

    /// Spawn the connection-table sweeper
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

    /// Evict idle flows and stale attribution state
    pub fn sweep_once(&self) {
        let now = Instant::now();
        let idle: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|entry| now.duration_since(entry.last_activity) >= self.idle_timeout)
            .map(|entry| *entry.key())
            .collect();
        for key in &idle {
            self.teardown_flow(key);
        }
        if !idle.is_empty() {
            debug!(evicted = idle.len(), "Idle TCP flows evicted");
        }

        self.udp_peers
            .retain(|_, value| now.duration_since(value.1) < self.idle_timeout);
        self.active_sessions
            .retain(|_, seen| now.duration_since(*seen) < self.idle_timeout);
    }
}
