//! Minimal STUN client (RFC 5389 binding requests) for NAT detection.
//!
//! The agent probes each configured server with a binding request and reads
//! the XOR-MAPPED-ADDRESS attribute back. Two agreeing mappings from
//! different servers mean the NAT reuses its mapping (cone family); mappings
//! that differ per destination mean symmetric NAT. No reachable server means
//! the worst is assumed.

use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{EgressError, Result};
use veilmesh_common::NatType;

const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;
const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;

/// Outcome of NAT probing
#[derive(Debug, Clone)]
pub struct NatProbe {
    pub nat_type: NatType,
    pub mapped_addr: Option<SocketAddr>,
}

/// Build a binding request with a fresh transaction id
fn binding_request() -> ([u8; 20], [u8; 12]) {
    let mut txn_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut txn_id);

    let mut request = [0u8; 20];
    request[0..2].copy_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    // message length 0: no attributes
    request[4..8].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    request[8..20].copy_from_slice(&txn_id);
    (request, txn_id)
}

/// Parse the mapped address out of a binding response
fn parse_binding_response(response: &[u8], txn_id: &[u8; 12]) -> Result<SocketAddr> {
    if response.len() < 20 {
        return Err(EgressError::Stun("response shorter than header".to_string()));
    }
    let message_type = u16::from_be_bytes([response[0], response[1]]);
    if message_type != STUN_BINDING_RESPONSE {
        return Err(EgressError::Stun(format!(
            "unexpected message type 0x{:04x}",
            message_type
        )));
    }
    if &response[8..20] != txn_id {
        return Err(EgressError::Stun("transaction id mismatch".to_string()));
    }

    let length = u16::from_be_bytes([response[2], response[3]]) as usize;
    let body = response
        .get(20..20 + length)
        .ok_or_else(|| EgressError::Stun("truncated attribute body".to_string()))?;

    let mut offset = 0usize;
    while offset + 4 <= body.len() {
        let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let value = body
            .get(offset + 4..offset + 4 + attr_len)
            .ok_or_else(|| EgressError::Stun("truncated attribute value".to_string()))?;

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS if attr_len >= 8 && value[1] == 0x01 => {
                let port = u16::from_be_bytes([value[2], value[3]])
                    ^ (STUN_MAGIC_COOKIE >> 16) as u16;
                let raw = u32::from_be_bytes([value[4], value[5], value[6], value[7]])
                    ^ STUN_MAGIC_COOKIE;
                return Ok(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(raw)),
                    port,
                ));
            }
            ATTR_MAPPED_ADDRESS if attr_len >= 8 && value[1] == 0x01 => {
                let port = u16::from_be_bytes([value[2], value[3]]);
                return Ok(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::new(value[4], value[5], value[6], value[7])),
                    port,
                ));
            }
            _ => {}
        }
        // attributes are padded to 32-bit boundaries
        offset += 4 + (attr_len + 3) / 4 * 4;
    }

    Err(EgressError::Stun("no mapped address attribute".to_string()))
}

/// One binding round trip against `server` from the given local socket
async fn query_server(
    socket: &UdpSocket,
    server: &str,
    probe_timeout: Duration,
) -> Result<SocketAddr> {
    let (request, txn_id) = binding_request();
    socket
        .send_to(&request, server)
        .await
        .map_err(|e| EgressError::Stun(format!("send to {} failed: {}", server, e)))?;

    let mut buffer = [0u8; 512];
    let (len, _) = timeout(probe_timeout, socket.recv_from(&mut buffer))
        .await
        .map_err(|_| EgressError::Timeout(format!("STUN probe to {}", server)))?
        .map_err(|e| EgressError::Stun(e.to_string()))?;

    parse_binding_response(&buffer[..len], &txn_id)
}

/// Probe the configured servers and classify the local NAT.
///
/// With no reachable server at all, symmetric NAT is assumed: the overlay
/// then never plans direct paths through this node that would not work.
pub async fn detect_nat(servers: &[String], probe_timeout: Duration) -> NatProbe {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "Cannot bind STUN probe socket, assuming symmetric NAT");
            return NatProbe {
                nat_type: NatType::Symmetric,
                mapped_addr: None,
            };
        }
    };

    let mut mappings = Vec::new();
    for server in servers {
        match query_server(&socket, server, probe_timeout).await {
            Ok(mapped) => {
                debug!(server = %server, mapped = %mapped, "STUN mapping discovered");
                mappings.push(mapped);
            }
            Err(e) => {
                debug!(server = %server, error = %e, "STUN probe failed");
            }
        }
    }

    let probe = match mappings.as_slice() {
        [] => NatProbe {
            nat_type: NatType::Symmetric,
            mapped_addr: None,
        },
        [only] => NatProbe {
            // A single answer cannot distinguish the cone variants; the
            // conservative cone classification keeps direct paths possible.
            nat_type: NatType::PortRestricted,
            mapped_addr: Some(*only),
        },
        [first, rest @ ..] => {
            let consistent = rest.iter().all(|m| m == first);
            NatProbe {
                nat_type: if consistent {
                    NatType::FullCone
                } else {
                    NatType::Symmetric
                },
                mapped_addr: Some(*first),
            }
        }
    };

    info!(nat_type = ?probe.nat_type, mapped = ?probe.mapped_addr, "NAT detection complete");
    probe
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding_response(txn_id: &[u8; 12], addr: SocketAddr) -> Vec<u8> {
        let SocketAddr::V4(v4) = addr else {
            panic!("test uses IPv4 only");
        };
        let xport = v4.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16;
        let xip = u32::from(*v4.ip()) ^ STUN_MAGIC_COOKIE;

        let mut out = Vec::new();
        out.extend_from_slice(&STUN_BINDING_RESPONSE.to_be_bytes());
        out.extend_from_slice(&12u16.to_be_bytes()); // one attribute
        out.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        out.extend_from_slice(txn_id);
        out.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        out.extend_from_slice(&8u16.to_be_bytes());
        out.push(0x00);
        out.push(0x01); // family IPv4
        out.extend_from_slice(&xport.to_be_bytes());
        out.extend_from_slice(&xip.to_be_bytes());
        out
    }

    #[test]
    fn test_parse_xor_mapped_address() {
        let (_, txn_id) = binding_request();
        let expected: SocketAddr = "203.0.113.7:54321".parse().unwrap();
        let response = binding_response(&txn_id, expected);

        let parsed = parse_binding_response(&response, &txn_id).unwrap();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_parse_rejects_wrong_transaction() {
        let (_, txn_id) = binding_request();
        let response = binding_response(&txn_id, "203.0.113.7:54321".parse().unwrap());

        let other_txn = [0xFFu8; 12];
        assert!(parse_binding_response(&response, &other_txn).is_err());
    }

    #[test]
    fn test_parse_rejects_short_response() {
        let txn_id = [0u8; 12];
        assert!(parse_binding_response(&[0u8; 10], &txn_id).is_err());
    }

    #[tokio::test]
    async fn test_no_servers_assumes_symmetric() {
        let probe = detect_nat(&[], Duration::from_millis(50)).await;
        assert_eq!(probe.nat_type, NatType::Symmetric);
        assert!(probe.mapped_addr.is_none());
    }

    #[tokio::test]
    async fn test_local_stun_round_trip() {
        // Fake STUN server echoing the observed source address
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buffer = [0u8; 64];
            if let Ok((len, src)) = server.recv_from(&mut buffer).await {
                if len >= 20 {
                    let mut txn_id = [0u8; 12];
                    txn_id.copy_from_slice(&buffer[8..20]);
                    let response = binding_response(&txn_id, src);
                    let _ = server.send_to(&response, src).await;
                }
            }
        });

        let probe = detect_nat(
            &[server_addr.to_string()],
            Duration::from_millis(500),
        )
        .await;
        assert!(probe.mapped_addr.is_some());
        assert_eq!(probe.nat_type, NatType::PortRestricted);
    }
}
