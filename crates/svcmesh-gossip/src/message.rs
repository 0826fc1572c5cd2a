//! Gossip wire format
//!
//! Every frame is a 1-byte message type, a 4-byte big-endian payload length,
//! and the payload itself; the payload starts with a crc32c of the body that
//! follows it. Bodies are bincode-encoded. Compound frames pack several
//! messages into one datagram so broadcasts piggyback on probe traffic.

use crate::member::RemoteState;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use svcmesh_core::{Error, NodeId, Result};

/// Largest datagram the engine will send.
pub const MAX_UDP_PACKET_SIZE: usize = 1400;

/// Largest frame accepted over TCP.
pub const MAX_TCP_FRAME_SIZE: usize = 1024 * 1024;

/// Frame header: type byte plus payload length.
pub const FRAME_HEADER_LEN: usize = 5;

const CHECKSUM_LEN: usize = 4;

/// Per-broadcast overhead used when budgeting compound frames.
pub const COMPOUND_OVERHEAD: usize = 16;

/// Type of gossip message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Direct probe
    Ping = 0,
    /// Probe acknowledgment
    Ack = 1,
    /// Probe through a relay
    IndirectPing = 2,
    /// Suspicion claim
    Suspect = 3,
    /// Aliveness claim, also carries meta
    Alive = 4,
    /// Death claim
    Dead = 5,
    /// Graceful departure
    Leave = 6,
    /// Opaque user broadcast
    User = 7,
    /// Anti-entropy state exchange (TCP)
    PushPull = 8,
    /// Several messages in one datagram
    Compound = 9,
    /// Reserved for encrypted payloads
    Encrypt = 10,
}

impl MessageType {
    /// Decode a wire type byte
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Ping),
            1 => Some(Self::Ack),
            2 => Some(Self::IndirectPing),
            3 => Some(Self::Suspect),
            4 => Some(Self::Alive),
            5 => Some(Self::Dead),
            6 => Some(Self::Leave),
            7 => Some(Self::User),
            8 => Some(Self::PushPull),
            9 => Some(Self::Compound),
            10 => Some(Self::Encrypt),
            _ => None,
        }
    }
}

/// A decoded frame: message type plus bincode body
#[derive(Debug, Clone)]
pub struct Frame {
    /// Message type
    pub msg_type: MessageType,
    /// Bincode-encoded body
    pub body: Vec<u8>,
}

/// Direct probe body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingBody {
    /// Probe sequence number, echoed in the ack
    pub seq: u32,
    /// Probing node
    pub from: NodeId,
}

/// Probe acknowledgment body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckBody {
    /// Echoed sequence number
    pub seq: u32,
    /// Acknowledging node
    pub from: NodeId,
    /// Acknowledging node's incarnation
    pub incarnation: u32,
}

/// Relay probe request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndirectPingBody {
    /// Sequence number of the original probe
    pub seq: u32,
    /// Original prober
    pub from: NodeId,
    /// Where the relayed ack must be forwarded
    pub reply_to: SocketAddr,
    /// Probe target
    pub target: NodeId,
    /// Probe target endpoint
    pub target_addr: SocketAddr,
}

/// Aliveness claim body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliveBody {
    /// Subject
    pub name: NodeId,
    /// Subject address
    pub addr: IpAddr,
    /// Subject membership port
    pub port: u16,
    /// Subject incarnation
    pub incarnation: u32,
    /// Subject meta
    pub meta: Vec<u8>,
}

/// Suspicion claim body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspectBody {
    /// Subject
    pub name: NodeId,
    /// Subject incarnation as known by the accuser
    pub incarnation: u32,
    /// Accusing node
    pub from: NodeId,
}

/// Death claim body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadBody {
    /// Subject
    pub name: NodeId,
    /// Subject incarnation as known by the accuser
    pub incarnation: u32,
    /// Accusing node
    pub from: NodeId,
}

/// Graceful departure body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveBody {
    /// Departing node
    pub name: NodeId,
    /// Its incarnation at departure
    pub incarnation: u32,
}

/// Anti-entropy exchange body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPullBody {
    /// Whether this exchange is part of a join handshake
    pub join: bool,
    /// The sender's full membership view
    pub states: Vec<RemoteState>,
    /// Opaque delegate state
    pub user_state: Vec<u8>,
}

/// One message inside a compound frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompoundPart {
    /// Wire type byte of the packed message
    pub msg_type: u8,
    /// Its bincode body
    pub body: Vec<u8>,
}

impl CompoundPart {
    /// Pack a typed body
    pub fn new(msg_type: MessageType, body: Vec<u8>) -> Self {
        Self {
            msg_type: msg_type as u8,
            body,
        }
    }
}

/// Compound frame body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompoundBody {
    /// Packed messages, in send order
    pub parts: Vec<CompoundPart>,
}

/// Bincode-encode a message body
pub fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    bincode::serialize(body).map_err(|e| Error::decode(format!("body encoding failed: {e}")))
}

/// Bincode-decode a message body
pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::decode(format!("body decoding failed: {e}")))
}

/// Encode a complete frame ready for the wire
pub fn encode_frame(msg_type: MessageType, body: &[u8]) -> Vec<u8> {
    let payload_len = CHECKSUM_LEN + body.len();
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload_len);
    buf.push(msg_type as u8);
    buf.extend_from_slice(&(payload_len as u32).to_be_bytes());
    buf.extend_from_slice(&crc32c::crc32c(body).to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

/// Decode the frame header, returning the type byte and payload length
pub fn decode_header(buf: &[u8]) -> Result<(u8, usize)> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(Error::decode(format!("truncated header: {} bytes", buf.len())));
    }
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    Ok((buf[0], len))
}

/// Verify the checksum and produce a frame from a type byte and payload
pub fn decode_payload(type_byte: u8, payload: &[u8]) -> Result<Frame> {
    let msg_type = MessageType::from_u8(type_byte)
        .ok_or_else(|| Error::decode(format!("unknown message type {type_byte}")))?;
    if payload.len() < CHECKSUM_LEN {
        return Err(Error::decode(format!(
            "truncated payload: {} bytes",
            payload.len()
        )));
    }
    let (checksum, body) = payload.split_at(CHECKSUM_LEN);
    let expected = u32::from_be_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
    let actual = crc32c::crc32c(body);
    if expected != actual {
        return Err(Error::decode(format!(
            "checksum mismatch: expected {expected:08x}, got {actual:08x}"
        )));
    }
    Ok(Frame {
        msg_type,
        body: body.to_vec(),
    })
}

/// Decode a whole datagram into a frame
pub fn decode_frame(buf: &[u8]) -> Result<Frame> {
    let (type_byte, payload_len) = decode_header(buf)?;
    let rest = &buf[FRAME_HEADER_LEN..];
    if rest.len() < payload_len {
        return Err(Error::decode(format!(
            "truncated frame: want {payload_len} payload bytes, have {}",
            rest.len()
        )));
    }
    decode_payload(type_byte, &rest[..payload_len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_message_type_round_trip() {
        for byte in 0..=10u8 {
            let msg_type = MessageType::from_u8(byte).unwrap();
            assert_eq!(msg_type as u8, byte);
        }
        assert!(MessageType::from_u8(11).is_none());
        assert!(MessageType::from_u8(255).is_none());
    }

    #[test]
    fn test_frame_round_trip() {
        let body = encode_body(&PingBody {
            seq: 42,
            from: NodeId::new("node-1"),
        })
        .unwrap();
        let wire = encode_frame(MessageType::Ping, &body);
        let frame = decode_frame(&wire).unwrap();
        assert_eq!(frame.msg_type, MessageType::Ping);
        let ping: PingBody = decode_body(&frame.body).unwrap();
        assert_eq!(ping.seq, 42);
        assert_eq!(ping.from, NodeId::new("node-1"));
    }

    #[test]
    fn test_corrupted_frame_rejected() {
        let body = encode_body(&LeaveBody {
            name: NodeId::new("node-1"),
            incarnation: 3,
        })
        .unwrap();
        let mut wire = encode_frame(MessageType::Leave, &body);
        // Flip one body bit.
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        let err = decode_frame(&wire).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let body = encode_body(&AckBody {
            seq: 1,
            from: NodeId::new("node-1"),
            incarnation: 0,
        })
        .unwrap();
        let wire = encode_frame(MessageType::Ack, &body);
        assert!(decode_frame(&wire[..3]).is_err());
        assert!(decode_frame(&wire[..wire.len() - 2]).is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut wire = encode_frame(MessageType::Ping, &[]);
        wire[0] = 42;
        assert!(decode_frame(&wire).is_err());
    }

    #[test]
    fn test_compound_round_trip() {
        let ping = encode_body(&PingBody {
            seq: 7,
            from: NodeId::new("a"),
        })
        .unwrap();
        let alive = encode_body(&AliveBody {
            name: NodeId::new("b"),
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 7946,
            incarnation: 1,
            meta: vec![1, 2],
        })
        .unwrap();
        let compound = CompoundBody {
            parts: vec![
                CompoundPart::new(MessageType::Ping, ping),
                CompoundPart::new(MessageType::Alive, alive),
            ],
        };
        let wire = encode_frame(MessageType::Compound, &encode_body(&compound).unwrap());
        let frame = decode_frame(&wire).unwrap();
        assert_eq!(frame.msg_type, MessageType::Compound);
        let decoded: CompoundBody = decode_body(&frame.body).unwrap();
        assert_eq!(decoded.parts.len(), 2);
        assert_eq!(decoded.parts[0].msg_type, MessageType::Ping as u8);
        assert_eq!(decoded.parts[1].msg_type, MessageType::Alive as u8);
    }
}
