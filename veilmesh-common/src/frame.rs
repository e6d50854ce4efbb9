//! Relay wire protocol.
//!
//! Frames crossing the relay WebSocket come in three shapes, discriminated
//! in this order:
//!
//! 1. Batch container: `u16_be count || count x (u16_be size || bytes)`,
//!    recognized when the leading count is in (1, 100).
//! 2. Raw data packet: first byte in 0x01..=0x04 (WireGuard message types).
//! 3. UTF-8 JSON envelope (`data` / `control` / `heartbeat`); a control
//!    envelope may carry a gzipped, base64-encoded inner control object.
//!
//! Anything that fails JSON parsing falls back to a single data packet.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;
use uuid::Uuid;

/// First byte of a WireGuard handshake initiation message
pub const WG_FIRST_TYPE: u8 = 0x01;
/// First byte of a WireGuard transport data message
pub const WG_LAST_TYPE: u8 = 0x04;

/// Inclusive lower bound on batch counts (a batch holds at least 2 packets)
pub const BATCH_MIN: u16 = 2;
/// Exclusive upper bound on batch counts
pub const BATCH_MAX: u16 = 100;

/// Errors produced by the frame codec
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("batch count {0} outside (1, 100)")]
    BatchBounds(usize),

    #[error("packet of {0} bytes exceeds the u16 length prefix")]
    PacketTooLarge(usize),

    #[error("batch truncated: expected {expected} more bytes at unit {unit}")]
    Truncated { unit: usize, expected: usize },

    #[error("control decompression failed: {0}")]
    Compression(String),

    #[error("invalid base64 in compressed control: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("invalid control JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Transfer direction carried in JSON envelopes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    #[serde(rename = "client-to-node")]
    ClientToNode,
    #[serde(rename = "node-to-client")]
    NodeToClient,
    #[serde(rename = "server")]
    Server,
}

/// JSON envelope exchanged on the relay channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayMessage {
    Data {
        #[serde(skip_serializing_if = "Option::is_none")]
        direction: Option<Direction>,
        payload: serde_json::Value,
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
    },
    Control {
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        compressed: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        direction: Option<Direction>,
    },
    Heartbeat {
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        direction: Option<Direction>,
    },
}

impl RelayMessage {
    /// Server-originated control envelope
    pub fn server_control(session_id: Uuid, action: &str) -> Self {
        RelayMessage::Control {
            action: Some(action.to_string()),
            compressed: None,
            data: None,
            payload: None,
            session_id: Some(session_id),
            direction: Some(Direction::Server),
        }
    }

    /// Server-originated heartbeat envelope
    pub fn server_heartbeat(session_id: Uuid) -> Self {
        RelayMessage::Heartbeat {
            session_id: Some(session_id),
            direction: Some(Direction::Server),
        }
    }

    /// Whether this is a compressed control envelope that still needs inflation
    pub fn is_compressed_control(&self) -> bool {
        matches!(
            self,
            RelayMessage::Control {
                compressed: Some(true),
                data: Some(_),
                ..
            }
        )
    }

    /// Effective control action: the top-level field, or `payload.action`
    /// for controls delivered through the compressed path.
    pub fn control_action(&self) -> Option<&str> {
        match self {
            RelayMessage::Control {
                action, payload, ..
            } => action.as_deref().or_else(|| {
                payload
                    .as_ref()
                    .and_then(|p| p.get("action"))
                    .and_then(|a| a.as_str())
            }),
            _ => None,
        }
    }
}

/// A frame received on the relay channel, after discrimination
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    /// Batch container, already expanded into its inner packets in order
    Batch(Vec<Bytes>),
    /// A single opaque data packet
    Data(Bytes),
    /// A parsed JSON envelope (compressed controls already inflated)
    Message(RelayMessage),
}

/// Leading u16 of `payload` when it is in the recognized batch range
fn batch_count(payload: &[u8]) -> Option<u16> {
    if payload.len() < 2 {
        return None;
    }
    let n = u16::from_be_bytes([payload[0], payload[1]]);
    (n > 1 && n < BATCH_MAX).then_some(n)
}

/// Whether the first byte marks a WireGuard-format datagram
pub fn is_wireguard_datagram(payload: &[u8]) -> bool {
    matches!(payload.first(), Some(&b) if (WG_FIRST_TYPE..=WG_LAST_TYPE).contains(&b))
}

/// Decode a received frame following the batch / raw-data / JSON
/// discrimination order.
///
/// Never fails on malformed JSON: those bytes are treated as a single data
/// packet. Only structurally broken batches and broken compressed controls
/// surface an error.
pub fn decode_frame(payload: &[u8]) -> Result<RelayFrame, FrameError> {
    if batch_count(payload).is_some() {
        return decode_batch(payload).map(RelayFrame::Batch);
    }

    if is_wireguard_datagram(payload) {
        return Ok(RelayFrame::Data(Bytes::copy_from_slice(payload)));
    }

    match std::str::from_utf8(payload)
        .ok()
        .and_then(|text| serde_json::from_str::<RelayMessage>(text).ok())
    {
        Some(message) if message.is_compressed_control() => {
            let inflated = match &message {
                RelayMessage::Control { data: Some(b64), .. } => inflate_control(b64)?,
                _ => unreachable!("is_compressed_control guarantees data"),
            };
            Ok(RelayFrame::Message(inflated))
        }
        Some(message) => Ok(RelayFrame::Message(message)),
        None => Ok(RelayFrame::Data(Bytes::copy_from_slice(payload))),
    }
}

/// Encode packets into a batch container.
///
/// Callers must pass between 2 and 99 packets; singletons go out raw.
pub fn encode_batch(packets: &[Bytes]) -> Result<Vec<u8>, FrameError> {
    let count = packets.len();
    if count < BATCH_MIN as usize || count >= BATCH_MAX as usize {
        return Err(FrameError::BatchBounds(count));
    }

    let total: usize = 2 + packets.iter().map(|p| 2 + p.len()).sum::<usize>();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(count as u16).to_be_bytes());
    for packet in packets {
        let len = packet.len();
        if len > u16::MAX as usize {
            return Err(FrameError::PacketTooLarge(len));
        }
        out.extend_from_slice(&(len as u16).to_be_bytes());
        out.extend_from_slice(packet);
    }
    Ok(out)
}

/// Expand a batch container into its inner packets, preserving order
pub fn decode_batch(payload: &[u8]) -> Result<Vec<Bytes>, FrameError> {
    let count = batch_count(payload).ok_or_else(|| {
        let n = payload
            .get(..2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]) as usize)
            .unwrap_or(0);
        FrameError::BatchBounds(n)
    })? as usize;

    let mut packets = Vec::with_capacity(count);
    let mut offset = 2usize;
    for unit in 0..count {
        if payload.len() < offset + 2 {
            return Err(FrameError::Truncated {
                unit,
                expected: offset + 2 - payload.len(),
            });
        }
        let len = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
        offset += 2;
        if payload.len() < offset + len {
            return Err(FrameError::Truncated {
                unit,
                expected: offset + len - payload.len(),
            });
        }
        packets.push(Bytes::copy_from_slice(&payload[offset..offset + len]));
        offset += len;
    }
    Ok(packets)
}

/// Inflate a compressed control payload: base64 -> gzip -> JSON
pub fn inflate_control(data: &str) -> Result<RelayMessage, FrameError> {
    let compressed = BASE64.decode(data)?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut json = String::new();
    decoder
        .read_to_string(&mut json)
        .map_err(|e| FrameError::Compression(e.to_string()))?;
    Ok(serde_json::from_str(&json)?)
}

/// Deflate a control message into the compressed wire form: JSON -> gzip -> base64
pub fn deflate_control(message: &RelayMessage) -> Result<String, FrameError> {
    let json = serde_json::to_vec(message)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .and_then(|_| encoder.finish())
        .map(|gz| BASE64.encode(gz))
        .map_err(|e| FrameError::Compression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_batch_decode_two_packets() {
        // count=2, "AA BB CC" then "DD EE FF 11"
        let wire = [
            0x00, 0x02, 0x00, 0x03, 0xAA, 0xBB, 0xCC, 0x00, 0x04, 0xDD, 0xEE, 0xFF, 0x11,
        ];
        let frame = decode_frame(&wire).unwrap();
        match frame {
            RelayFrame::Batch(packets) => {
                assert_eq!(packets.len(), 2);
                assert_eq!(&packets[0][..], &[0xAA, 0xBB, 0xCC]);
                assert_eq!(&packets[1][..], &[0xDD, 0xEE, 0xFF, 0x11]);
            }
            other => panic!("expected batch, got {:?}", other),
        }
    }

    #[test]
    fn test_wireguard_first_byte_is_data() {
        for first in WG_FIRST_TYPE..=WG_LAST_TYPE {
            let wire = [first, 0x00, 0x00, 0x00, 0x42];
            match decode_frame(&wire).unwrap() {
                RelayFrame::Data(bytes) => assert_eq!(bytes[0], first),
                other => panic!("expected data for 0x{:02x}, got {:?}", first, other),
            }
        }
    }

    #[test]
    fn test_count_one_is_not_a_batch() {
        // count=1 is below the batch floor; 0x00 is not a WG type and the
        // bytes are not JSON, so this lands in the raw-data fallback.
        let wire = [0x00, 0x01, 0x00, 0x01, 0xAA];
        assert!(matches!(decode_frame(&wire).unwrap(), RelayFrame::Data(_)));
    }

    #[test]
    fn test_truncated_batch_is_an_error() {
        let wire = [0x00, 0x02, 0x00, 0x03, 0xAA];
        assert!(matches!(
            decode_frame(&wire),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn test_json_heartbeat() {
        let frame = decode_frame(br#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(
            frame,
            RelayFrame::Message(RelayMessage::Heartbeat {
                session_id: None,
                direction: None
            })
        );
    }

    #[test]
    fn test_malformed_json_falls_back_to_data() {
        let wire = br#"{"type":"data", oops"#;
        assert!(matches!(decode_frame(wire).unwrap(), RelayFrame::Data(_)));
    }

    #[test]
    fn test_compressed_control_round_trip() {
        let inner = RelayMessage::Control {
            action: None,
            compressed: None,
            data: None,
            payload: Some(serde_json::json!({"action": "disconnect"})),
            session_id: None,
            direction: None,
        };
        let data = deflate_control(&inner).unwrap();
        let outer = format!(
            r#"{{"type":"control","compressed":true,"data":"{}"}}"#,
            data
        );

        let frame = decode_frame(outer.as_bytes()).unwrap();
        match frame {
            RelayFrame::Message(message) => {
                assert_eq!(message.control_action(), Some("disconnect"));
            }
            other => panic!("expected control message, got {:?}", other),
        }
    }

    #[test]
    fn test_control_action_prefers_top_level() {
        let message = RelayMessage::Control {
            action: Some("reconnect".into()),
            compressed: None,
            data: None,
            payload: Some(serde_json::json!({"action": "disconnect"})),
            session_id: None,
            direction: None,
        };
        assert_eq!(message.control_action(), Some("reconnect"));
    }

    #[test]
    fn test_encode_batch_rejects_singleton_and_oversize() {
        let one = vec![Bytes::from_static(&[0x01])];
        assert!(matches!(
            encode_batch(&one),
            Err(FrameError::BatchBounds(1))
        ));

        let many: Vec<Bytes> = (0..100).map(|_| Bytes::from_static(&[0x01])).collect();
        assert!(matches!(
            encode_batch(&many),
            Err(FrameError::BatchBounds(100))
        ));
    }

    proptest! {
        /// Encoding then decoding any 2..100 packets yields them in order.
        #[test]
        fn prop_batch_round_trip(
            packets in prop::collection::vec(
                prop::collection::vec(any::<u8>(), 0..512),
                2..100,
            )
        ) {
            let input: Vec<Bytes> = packets.iter().cloned().map(Bytes::from).collect();
            let wire = encode_batch(&input).unwrap();
            let output = decode_batch(&wire).unwrap();
            prop_assert_eq!(input, output);
        }

        /// Batch wire bytes always classify as a batch, never as data.
        #[test]
        fn prop_batch_classification(
            packets in prop::collection::vec(
                prop::collection::vec(any::<u8>(), 1..64),
                2..100,
            )
        ) {
            let input: Vec<Bytes> = packets.into_iter().map(Bytes::from).collect();
            let wire = encode_batch(&input).unwrap();
            prop_assert!(matches!(decode_frame(&wire).unwrap(), RelayFrame::Batch(_)));
        }
    }
}
