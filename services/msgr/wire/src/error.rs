//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Banner magic mismatch
    #[error("bad banner magic")]
    Magic,

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Unknown frame type
    #[error("unknown type {0}")]
    Type(u8),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Payload checksum mismatch
    #[error("payload checksum mismatch")]
    Checksum,

    /// Invalid CBOR payload
    #[error("cbor payload invalid")]
    Payload,

    /// Malformed frame structure
    #[error("malformed frame")]
    Malformed,
}
