//! Connection policy and protocol configuration.

use msgr_wire::Features;
use std::time::Duration;

/// Per-connection behavior fixed by the owner at creation time
#[derive(Debug, Clone, Copy)]
pub struct ConnPolicy {
    /// No session continuity: faults close instead of reconnecting
    pub lossy: bool,
    /// Accepting side: never re-dials, waits in standby for the peer
    pub server: bool,
}

impl ConnPolicy {
    /// Dialing side of a lossless link
    pub fn lossless_client() -> Self {
        Self {
            lossy: false,
            server: false,
        }
    }

    /// Accepting side of a lossless link
    pub fn lossless_server() -> Self {
        Self {
            lossy: false,
            server: true,
        }
    }

    /// Dialing side of a lossy link
    pub fn lossy_client() -> Self {
        Self {
            lossy: true,
            server: false,
        }
    }
}

/// Tunables for the connection protocol
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Window for each handshake read (banner, auth round, ident reply)
    pub handshake_timeout: Duration,
    /// First retry backoff
    pub backoff_initial: Duration,
    /// Backoff growth factor per retry
    pub backoff_multiplier: f64,
    /// Retry backoff cap
    pub backoff_max: Duration,
    /// Keepalive probe interval while a session is active
    pub keepalive_interval: Duration,
    /// Auth methods the accepting side allows; empty means any supported
    pub allowed_auth_methods: Vec<u32>,
    /// Capability bits we can speak
    pub supported_features: Features,
    /// Capability bits we insist on
    pub required_features: Features,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            backoff_initial: Duration::from_millis(250),
            backoff_multiplier: 2.0,
            backoff_max: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(10),
            allowed_auth_methods: Vec::new(),
            supported_features: Features::all(),
            required_features: Features::RECONNECT,
        }
    }
}
