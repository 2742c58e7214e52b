//! Protocol error taxonomy.
//!
//! Every sub-protocol step surfaces failures as a [`ProtoError`] and routes
//! them through the connection's fault funnel; nothing below that layer
//! decides state transitions from an error.

use msgr_wire::FrameType;
use thiserror::Error;

/// Errors produced by protocol steps
#[derive(Error, Debug)]
pub enum ProtoError {
    /// Transport fault during an active step
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encoding or decoding fault
    #[error("wire: {0}")]
    Wire(#[from] msgr_wire::WireError),

    /// A frame arrived that the current phase cannot accept
    #[error("unexpected {got} frame during {phase}")]
    UnexpectedFrame {
        /// Handshake phase that was running
        phase: &'static str,
        /// The frame type that arrived
        got: FrameType,
    },

    /// Malformed or mismatched identification banner
    #[error("banner rejected: {0}")]
    Banner(&'static str),

    /// Peer exhausted or failed authentication
    #[error("auth rejected: {0}")]
    AuthRejected(String),

    /// Peer identity does not match what the caller expected
    #[error("peer identity mismatch: expected {expected}, got {got}")]
    PeerMismatch {
        /// Identity the caller validated against
        expected: String,
        /// Identity the peer declared
        got: String,
    },

    /// Peer requires capability bits we do not speak
    #[error("missing required features: {0:#x}")]
    MissingFeatures(u64),

    /// Peer instructed a session reset
    #[error("session reset by peer (full={0})")]
    ResetByPeer(bool),

    /// A handshake step did not finish inside its window
    #[error("timed out during {0}")]
    Timeout(&'static str),

    /// Peer closed the socket
    #[error("connection closed by peer")]
    ClosedByPeer,

    /// The connection was already shut down locally
    #[error("connection closed")]
    Closed,
}

impl ProtoError {
    /// Whether a retry over a fresh socket can reasonably succeed.
    ///
    /// Transient faults preserve an established session (WAIT/STANDBY);
    /// everything else tears the connection down.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProtoError::Io(_) | ProtoError::Timeout(_) | ProtoError::ClosedByPeer
        )
    }
}
