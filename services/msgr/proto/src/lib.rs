//! Connection establishment and session continuity for msgr links.
//!
//! This crate implements the handshake and lifecycle protocol for
//! point-to-point links in the cluster messaging layer: banner exchange,
//! mutual authentication handoff, peer identity negotiation, resolution
//! of simultaneous-dial races, lossless session resume after transient
//! network failures, and orderly shutdown.
//!
//! The centerpiece is [`Connection`], a re-entrant state machine that
//! serializes all transitions and runs every protocol step gated, so each
//! link has exactly one authoritative state and at most one active step.
//! A [`Registry`] owns the set of live connections for a node and routes
//! inbound accepts into them. The data-plane sits behind the
//! [`ConnectionHandler`]/[`HandshakeListener`] seam; [`QueueHandler`] is
//! the in-memory implementation used by the node binary and the tests.
//!
//! ## Example
//!
//! ```rust,no_run
//! use msgr_proto::{ConnectionHandler, OpenPolicy, ProtocolConfig, QueueHandler, Registry};
//! use msgr_wire::{EntityKind, EntityName};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio::net::TcpListener;
//!
//! # async fn example() -> std::io::Result<()> {
//! let registry = Registry::new(
//!     EntityName::new(EntityKind::Store, 1),
//!     "10.0.0.1:9100".parse().unwrap(),
//!     ProtocolConfig::default(),
//!     Arc::new(OpenPolicy),
//!     Box::new(|| {
//!         let (handler, _delivered) = QueueHandler::new(Duration::from_secs(10));
//!         let handler: Arc<dyn ConnectionHandler> = handler;
//!         handler
//!     }),
//! );
//!
//! // Accept loop: every inbound socket becomes a connection.
//! let listener = TcpListener::bind("10.0.0.1:9100").await?;
//! loop {
//!     let (socket, _) = listener.accept().await?;
//!     registry.start_accept(socket).await?;
//! }
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod error;
pub mod gate;
pub mod io_handler;
pub mod machine;
pub mod registry;
pub mod timer;
pub mod transport;
pub mod types;

// Re-export main types
pub use auth::{AuthMeta, AuthPolicy, OpenPolicy, PresharedPolicy, ServerStep, METHOD_NEGOTIATE, METHOD_OPEN, METHOD_PRESHARED};
pub use error::ProtoError;
pub use gate::Gate;
pub use io_handler::{
    exit_pair, ConnectionHandler, ExitGuard, ExitSignal, HandshakeListener, InboundData, IoState,
    QueueHandler,
};
pub use machine::{ConnState, Connection};
pub use registry::{ClaimOutcome, HandlerFactory, Registry};
pub use timer::BackoffTimer;
pub use transport::{FrameTransport, SharedTransport};
pub use types::{ConnPolicy, ProtocolConfig};
