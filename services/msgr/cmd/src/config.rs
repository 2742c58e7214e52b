//! Configuration handling for the msgr node binary.
//!
//! Reads the node's YAML config file, then applies environment variable
//! overrides, yielding the identity, listen address, peer list and
//! protocol tunables.

use anyhow::{bail, Result};
use msgr_proto::ProtocolConfig;
use msgr_wire::{EntityKind, EntityName};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Msgr node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgrConfig {
    /// Entity kind of this node (mon, store, gw, client)
    pub node_kind: String,
    /// Entity id of this node
    pub node_id: u64,
    /// Listen address for inbound links
    pub listen_addr: SocketAddr,
    /// Peers to dial at startup, as `kind.id@host:port`
    #[serde(default)]
    pub peers: Vec<String>,
    /// Handshake window (seconds)
    pub handshake_timeout: u64,
    /// First retry backoff (milliseconds)
    pub backoff_initial_ms: u64,
    /// Backoff growth factor
    pub backoff_multiplier: f64,
    /// Retry backoff cap (seconds)
    pub backoff_max: u64,
    /// Keepalive probe interval (seconds)
    pub keepalive_interval: u64,
    /// Preshared auth secret; empty runs open auth
    #[serde(default)]
    pub auth_secret: String,
}

impl Default for MsgrConfig {
    fn default() -> Self {
        Self {
            node_kind: "store".to_string(),
            node_id: 1,
            listen_addr: "0.0.0.0:9100".parse().unwrap(),
            peers: Vec::new(),
            handshake_timeout: 10,
            backoff_initial_ms: 250,
            backoff_multiplier: 2.0,
            backoff_max: 15,
            keepalive_interval: 10,
            auth_secret: String::new(),
        }
    }
}

impl MsgrConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<MsgrConfig>(&content) {
                Ok(parsed) => {
                    config = parsed;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?} ({}), using defaults",
                        config_path.as_ref(),
                        e
                    );
                }
            }
        } else {
            warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            );
        }

        config.apply_environment_overrides();
        info!(
            "Final msgr configuration: name={}.{}, listen={}, peers={}",
            config.node_kind,
            config.node_id,
            config.listen_addr,
            config.peers.len()
        );
        Ok(config)
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(kind) = std::env::var("STRATA_NODE_KIND") {
            self.node_kind = kind;
        }
        if let Ok(id) = std::env::var("STRATA_NODE_ID") {
            if let Ok(id) = id.parse() {
                self.node_id = id;
            }
        }
        if let Ok(listen) = std::env::var("STRATA_LISTEN") {
            if let Ok(addr) = listen.parse() {
                self.listen_addr = addr;
            }
        }
        if let Ok(secret) = std::env::var("STRATA_AUTH_SECRET") {
            self.auth_secret = secret;
        }
    }

    /// Local identity derived from the config
    pub fn local_name(&self) -> Result<EntityName> {
        Ok(EntityName::new(parse_kind(&self.node_kind)?, self.node_id))
    }

    /// Protocol tunables derived from the config
    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            handshake_timeout: Duration::from_secs(self.handshake_timeout),
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_multiplier: self.backoff_multiplier,
            backoff_max: Duration::from_secs(self.backoff_max),
            keepalive_interval: Duration::from_secs(self.keepalive_interval),
            ..ProtocolConfig::default()
        }
    }
}

/// Parse an entity kind label
pub fn parse_kind(kind: &str) -> Result<EntityKind> {
    match kind {
        "mon" => Ok(EntityKind::Monitor),
        "store" => Ok(EntityKind::Store),
        "gw" => Ok(EntityKind::Gateway),
        "client" => Ok(EntityKind::Client),
        other => bail!("unknown entity kind {:?}", other),
    }
}

/// Parse a peer spec of the form `kind.id@host:port`
pub fn parse_peer(spec: &str) -> Result<(EntityName, SocketAddr)> {
    let Some((name, addr)) = spec.split_once('@') else {
        bail!("peer spec {:?} is missing '@'", spec);
    };
    let Some((kind, id)) = name.split_once('.') else {
        bail!("peer name {:?} is missing '.'", name);
    };
    let name = EntityName::new(parse_kind(kind)?, id.parse()?);
    Ok((name, addr.parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer_spec() {
        let (name, addr) = parse_peer("store.7@10.0.0.5:9100").unwrap();
        assert_eq!(name, EntityName::new(EntityKind::Store, 7));
        assert_eq!(addr, "10.0.0.5:9100".parse().unwrap());
    }

    #[test]
    fn test_parse_peer_rejects_garbage() {
        assert!(parse_peer("store.7").is_err());
        assert!(parse_peer("osd.7@10.0.0.5:9100").is_err());
        assert!(parse_peer("store.x@10.0.0.5:9100").is_err());
    }
}
