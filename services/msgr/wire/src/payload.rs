//! Typed payloads for handshake and control frames.
//!
//! Control payloads are CBOR maps built with `serde` derive. The field
//! semantics (cookies, sequence numbers, identity) are what the protocol
//! layer negotiates over; their layout here is deliberately plain.

use crate::frame::{Frame, FrameType};
use crate::WireError;
use bitflags::bitflags;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Magic bytes carried in every banner
pub const BANNER_MAGIC: [u8; 8] = *b"strata/1";

/// Logical kind of a cluster endpoint
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    /// Cluster monitor
    Monitor = 1,
    /// Data store node
    Store = 2,
    /// Protocol gateway
    Gateway = 3,
    /// External client
    Client = 4,
}

impl EntityKind {
    /// Short diagnostic label
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Monitor => "mon",
            EntityKind::Store => "store",
            EntityKind::Gateway => "gw",
            EntityKind::Client => "client",
        }
    }
}

/// Logical identity of a cluster endpoint: kind plus numeric id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityName {
    /// Endpoint kind
    pub kind: EntityKind,
    /// Endpoint id, nonzero for addressable peers
    pub id: u64,
}

impl EntityName {
    /// Create a new entity name
    pub fn new(kind: EntityKind, id: u64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind.as_str(), self.id)
    }
}

bitflags! {
    /// Negotiated capability bits exchanged at banner time
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Features: u64 {
        /// Peer keeps per-session delivery state across reconnects
        const LOSSLESS_PEER = 1 << 0;
        /// Peer supports session resume via RECONNECT
        const RECONNECT = 1 << 1;
        /// Keepalive probes carry echo timestamps
        const KEEPALIVE2 = 1 << 2;
    }
}

/// Identification banner, the first frame in both directions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannerPayload {
    /// Protocol magic, see [`BANNER_MAGIC`]
    pub magic: [u8; 8],
    /// Sender identity
    pub name: EntityName,
    /// Sender advertised address
    pub addr: SocketAddr,
    /// Capability bits the sender can speak
    pub supported: u64,
    /// Capability bits the sender insists on
    pub required: u64,
}

/// Client authentication request, initial or continued round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequestPayload {
    /// Requested method id
    pub method: u32,
    /// Methods the client is prepared to use, in preference order
    pub preferred: Vec<u32>,
    /// Method-specific body
    pub payload: Bytes,
}

/// Server rejection naming the acceptable methods
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthBadMethodPayload {
    /// The method that was rejected
    pub method: u32,
    /// Methods the server accepts
    pub allowed: Vec<u32>,
}

/// Server challenge requiring another round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthReplyMorePayload {
    /// Method-specific challenge body
    pub payload: Bytes,
}

/// Authentication finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthDonePayload {
    /// The method that succeeded
    pub method: u32,
    /// Method-specific completion body
    pub payload: Bytes,
}

/// Client identity and session parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentPayload {
    /// Client identity
    pub name: EntityName,
    /// Client advertised address
    pub addr: SocketAddr,
    /// Address the client believes it dialed
    pub target_addr: SocketAddr,
    /// Client attempt counter, breaks concurrent-dial races
    pub global_seq: u64,
    /// Client half of the session identity tuple
    pub client_cookie: u64,
    /// Capability bits the client can speak
    pub supported: u64,
    /// Capability bits the client insists on
    pub required: u64,
    /// Connection policy flags (bit 0: lossy)
    pub flags: u64,
}

/// Policy flag: connection is lossy, no session continuity
pub const CLIENT_FLAG_LOSSY: u64 = 1 << 0;

/// Server identity and session parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentPayload {
    /// Server identity
    pub name: EntityName,
    /// Server advertised address
    pub addr: SocketAddr,
    /// Server attempt counter
    pub global_seq: u64,
    /// Server half of the session identity tuple
    pub server_cookie: u64,
    /// Capability bits in effect for the session
    pub features: u64,
    /// Session connection counter after this establishment
    pub connect_seq: u64,
}

/// Session resume request after a transient failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPayload {
    /// Client advertised address
    pub addr: SocketAddr,
    /// Client half of the session identity tuple
    pub client_cookie: u64,
    /// Server half of the session identity tuple
    pub server_cookie: u64,
    /// Client attempt counter for this dial
    pub global_seq: u64,
    /// Proposed session connection counter
    pub connect_seq: u64,
    /// Highest message seq the client has delivered
    pub msg_seq: u64,
}

/// Session resume confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectOkPayload {
    /// Accepted session connection counter
    pub connect_seq: u64,
    /// Highest message seq the server has delivered
    pub msg_seq: u64,
}

/// Retry with a corrected connect sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPayload {
    /// The server's view of the session connection counter
    pub connect_seq: u64,
}

/// Retry with a corrected global sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryGlobalPayload {
    /// The server's view of the peer attempt counter
    pub global_seq: u64,
}

/// Session reset instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetPayload {
    /// Discard cookies and delivery state, not just the attempt
    pub full: bool,
}

/// Application data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPayload {
    /// Per-session message sequence
    pub seq: u64,
    /// Message body
    pub body: Bytes,
}

/// Cumulative data acknowledgment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Every message seq up to and including this one was delivered
    pub seq: u64,
}

/// Keepalive probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepalivePayload {
    /// Sender timestamp, echoed back in the ack
    pub stamp_micros: u64,
}

/// Encode a typed payload into a frame of the given type
pub fn to_frame<T: Serialize>(typ: FrameType, value: &T) -> Result<Frame, WireError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|_| WireError::Payload)?;
    Ok(Frame::new(typ, Bytes::from(buf)))
}

/// Decode a frame's payload into a typed payload
pub fn from_frame<T: DeserializeOwned>(frame: &Frame) -> Result<T, WireError> {
    ciborium::from_reader(frame.payload.as_ref()).map_err(|_| WireError::Payload)
}

/// Build an empty-payload frame (WAIT and friends)
pub fn empty_frame(typ: FrameType) -> Frame {
    Frame::new(typ, Bytes::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9100".parse().unwrap()
    }

    #[test]
    fn test_banner_roundtrip() {
        let banner = BannerPayload {
            magic: BANNER_MAGIC,
            name: EntityName::new(EntityKind::Store, 42),
            addr: addr(),
            supported: Features::all().bits(),
            required: Features::RECONNECT.bits(),
        };

        let frame = to_frame(FrameType::Banner, &banner).unwrap();
        assert_eq!(frame.typ, FrameType::Banner);

        let decoded: BannerPayload = from_frame(&frame).unwrap();
        assert_eq!(decoded, banner);
    }

    #[test]
    fn test_reconnect_roundtrip() {
        let reconnect = ReconnectPayload {
            addr: addr(),
            client_cookie: 0xAABB,
            server_cookie: 0xCCDD,
            global_seq: 7,
            connect_seq: 3,
            msg_seq: 119,
        };

        let frame = to_frame(FrameType::Reconnect, &reconnect).unwrap();
        let decoded: ReconnectPayload = from_frame(&frame).unwrap();
        assert_eq!(decoded, reconnect);
    }

    #[test]
    fn test_wrong_payload_shape_rejected() {
        let frame = to_frame(FrameType::Ack, &AckPayload { seq: 5 }).unwrap();
        assert!(from_frame::<ReconnectPayload>(&frame).is_err());
    }

    #[test]
    fn test_entity_name_display() {
        assert_eq!(EntityName::new(EntityKind::Store, 3).to_string(), "store.3");
        assert_eq!(EntityName::new(EntityKind::Monitor, 1).to_string(), "mon.1");
    }

    #[test]
    fn test_entity_name_ordering_is_total() {
        let a = EntityName::new(EntityKind::Monitor, 9);
        let b = EntityName::new(EntityKind::Store, 1);
        assert!(a < b);
        assert!(EntityName::new(EntityKind::Store, 1) < EntityName::new(EntityKind::Store, 2));
    }
}
