//! Message framing for the msgr wire protocol.
//!
//! Every frame is a length-prefixed record carrying one typed protocol
//! message. Handshake and control payloads are CBOR maps (see
//! [`crate::payload`]); the frame layer itself only knows lengths, types
//! and checksums.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | u8 version           | wire protocol version      |
//! +----------------------+----------------------------+
//! | u8 frame_type        | see FrameType              |
//! +----------------------+----------------------------+
//! | u32 payload_crc      | crc32 of payload bytes     |
//! +----------------------+----------------------------+
//! | payload              | CBOR (control) or raw      |
//! +----------------------+----------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::trace;

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Bytes of header following the length prefix
pub const FRAME_HEADER_SIZE: usize = 6;

/// Maximum frame size (16 MiB default)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame types as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Identification banner, first frame in both directions
    Banner = 0x01,
    /// Client authentication request (initial or continued round)
    AuthRequest = 0x02,
    /// Server rejection naming the acceptable methods
    AuthBadMethod = 0x03,
    /// Server challenge requiring another auth round
    AuthReplyMore = 0x04,
    /// Authentication finished
    AuthDone = 0x05,
    /// Client identity and session parameters
    ClientIdent = 0x06,
    /// Server identity and session parameters
    ServerIdent = 0x07,
    /// Session resume request after a transient failure
    Reconnect = 0x08,
    /// Session resume confirmation
    ReconnectOk = 0x09,
    /// Retry with a corrected connect sequence
    Retry = 0x0A,
    /// Retry with a corrected global sequence
    RetryGlobal = 0x0B,
    /// Session reset instruction
    Reset = 0x0C,
    /// Back off, a competing attempt won
    Wait = 0x0D,
    /// Application data
    Data = 0x0E,
    /// Cumulative data acknowledgment
    Ack = 0x0F,
    /// Keepalive probe
    Keepalive = 0x10,
    /// Keepalive echo
    KeepaliveAck = 0x11,
}

impl TryFrom<u8> for FrameType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Banner),
            0x02 => Ok(FrameType::AuthRequest),
            0x03 => Ok(FrameType::AuthBadMethod),
            0x04 => Ok(FrameType::AuthReplyMore),
            0x05 => Ok(FrameType::AuthDone),
            0x06 => Ok(FrameType::ClientIdent),
            0x07 => Ok(FrameType::ServerIdent),
            0x08 => Ok(FrameType::Reconnect),
            0x09 => Ok(FrameType::ReconnectOk),
            0x0A => Ok(FrameType::Retry),
            0x0B => Ok(FrameType::RetryGlobal),
            0x0C => Ok(FrameType::Reset),
            0x0D => Ok(FrameType::Wait),
            0x0E => Ok(FrameType::Data),
            0x0F => Ok(FrameType::Ack),
            0x10 => Ok(FrameType::Keepalive),
            0x11 => Ok(FrameType::KeepaliveAck),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::Banner => "BANNER",
            FrameType::AuthRequest => "AUTH_REQUEST",
            FrameType::AuthBadMethod => "AUTH_BAD_METHOD",
            FrameType::AuthReplyMore => "AUTH_REPLY_MORE",
            FrameType::AuthDone => "AUTH_DONE",
            FrameType::ClientIdent => "CLIENT_IDENT",
            FrameType::ServerIdent => "SERVER_IDENT",
            FrameType::Reconnect => "RECONNECT",
            FrameType::ReconnectOk => "RECONNECT_OK",
            FrameType::Retry => "RETRY",
            FrameType::RetryGlobal => "RETRY_GLOBAL",
            FrameType::Reset => "RESET",
            FrameType::Wait => "WAIT",
            FrameType::Data => "DATA",
            FrameType::Ack => "ACK",
            FrameType::Keepalive => "KEEPALIVE",
            FrameType::KeepaliveAck => "KEEPALIVE_ACK",
        };
        f.write_str(name)
    }
}

/// Complete wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub typ: FrameType,
    /// Payload bytes (CBOR for control frames)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(typ: FrameType, payload: Bytes) -> Self {
        Self { typ, payload }
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self, max_frame_size: usize) -> Result<Bytes, crate::WireError> {
        let frame_len = FRAME_HEADER_SIZE + self.payload.len();
        if 4 + frame_len > max_frame_size {
            return Err(crate::WireError::Size(4 + frame_len));
        }

        let mut buf = BytesMut::with_capacity(4 + frame_len);
        buf.put_u32(frame_len as u32);
        buf.put_u8(WIRE_VERSION);
        buf.put_u8(self.typ as u8);
        buf.put_u32(crc32fast::hash(&self.payload));
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Decode one frame from a buffer, returning `None` until a full frame
    /// has been buffered
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, crate::WireError> {
        // Need at least 4 bytes for frame length
        if buf.len() < 4 {
            return Ok(None);
        }

        // Peek at frame length
        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if frame_len < FRAME_HEADER_SIZE {
            return Err(crate::WireError::Malformed);
        }
        if 4 + frame_len > self.max_frame_size {
            return Err(crate::WireError::Size(4 + frame_len));
        }

        // Check if we have the complete frame
        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let mut frame_buf = buf.split_to(frame_len).freeze();

        let version = frame_buf.get_u8();
        if version != WIRE_VERSION {
            return Err(crate::WireError::Version(version));
        }

        let typ = FrameType::try_from(frame_buf.get_u8())?;
        let crc = frame_buf.get_u32();
        let payload = frame_buf;

        if crc32fast::hash(&payload) != crc {
            return Err(crate::WireError::Checksum);
        }

        trace!(%typ, len = payload.len(), "decoded frame");
        Ok(Some(Frame { typ, payload }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::new(FrameType::Data, Bytes::from_static(b"hello"));
        let encoded = frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(encoded.as_ref());
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_needs_more_data() {
        let frame = Frame::new(FrameType::Keepalive, Bytes::from_static(b"abc"));
        let encoded = frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.put_u8(encoded[encoded.len() - 1]);
        assert!(decoder.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let a = Frame::new(FrameType::Wait, Bytes::new());
        let b = Frame::new(FrameType::Ack, Bytes::from_static(b"x"));

        let mut buf = BytesMut::new();
        buf.put_slice(&a.encode(DEFAULT_MAX_FRAME_SIZE).unwrap());
        buf.put_slice(&b.encode(DEFAULT_MAX_FRAME_SIZE).unwrap());

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().typ, FrameType::Wait);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().typ, FrameType::Ack);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let frame = Frame::new(FrameType::Data, Bytes::new());
        let encoded = frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut raw = BytesMut::from(encoded.as_ref());
        raw[5] = 0xFF;

        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.decode(&mut raw),
            Err(crate::WireError::Type(0xFF))
        ));
    }

    #[test]
    fn test_corrupt_payload_rejected() {
        let frame = Frame::new(FrameType::Data, Bytes::from_static(b"payload"));
        let encoded = frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut raw = BytesMut::from(encoded.as_ref());
        let last = raw.len() - 1;
        raw[last] ^= 0x01;

        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.decode(&mut raw),
            Err(crate::WireError::Checksum)
        ));
    }
}
