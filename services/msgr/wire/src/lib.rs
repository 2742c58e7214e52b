//! Wire protocol framing and typed handshake/control frames for msgr links.
//!
//! This crate provides the low-level wire protocol for the cluster messaging
//! layer: length-prefixed framing with payload checksums, the frame type
//! space, and the typed CBOR payloads the connection protocol negotiates
//! with (banners, auth rounds, identities, reconnect/retry/reset control).
//!
//! The sequencing of these frames, and what the cookies and sequence
//! numbers mean, lives in `msgr-proto`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod payload;

// Re-export main types
pub use error::WireError;
pub use frame::{Frame, FrameDecoder, FrameType, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, WIRE_VERSION};
pub use payload::{
    empty_frame, from_frame, to_frame, AckPayload, AuthBadMethodPayload, AuthDonePayload,
    AuthReplyMorePayload, AuthRequestPayload, BannerPayload, ClientIdentPayload, DataPayload,
    EntityKind, EntityName, Features, KeepalivePayload, ReconnectOkPayload, ReconnectPayload,
    ResetPayload, RetryGlobalPayload, RetryPayload, ServerIdentPayload, BANNER_MAGIC,
    CLIENT_FLAG_LOSSY,
};
