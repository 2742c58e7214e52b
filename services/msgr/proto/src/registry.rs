//! Connection registry: owns the set of live connections for one node.
//!
//! The registry allocates attempt counters, routes inbound accepts into
//! fresh connection instances, answers the existing-connection lookups
//! that race resolution needs, and sequences orderly shutdown on each
//! connection's closed signal.

use crate::auth::AuthPolicy;
use crate::io_handler::ConnectionHandler;
use crate::machine::Connection;
use crate::transport::FrameTransport;
use crate::types::{ConnPolicy, ProtocolConfig};
use msgr_wire::EntityName;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Result of registering an accepted connection under a peer name
pub enum ClaimOutcome {
    /// No competitor; the accept owns the peer entry now
    Claimed,
    /// Another instance already holds the entry; resolve the race
    Existing(Connection),
}

/// Builds one data-plane handler per connection
pub type HandlerFactory = Box<dyn Fn() -> Arc<dyn ConnectionHandler> + Send + Sync>;

/// The set of live connections for one node
pub struct Registry {
    local_name: EntityName,
    local_addr: SocketAddr,
    cfg: ProtocolConfig,
    auth_policy: Arc<dyn AuthPolicy>,
    handler_factory: HandlerFactory,
    global_seq: AtomicU64,
    next_conn_id: AtomicU64,
    conns: RwLock<HashMap<EntityName, Connection>>,
    accepting: RwLock<Vec<Connection>>,
}

impl Registry {
    /// Create a registry for the given local identity
    pub fn new(
        local_name: EntityName,
        local_addr: SocketAddr,
        cfg: ProtocolConfig,
        auth_policy: Arc<dyn AuthPolicy>,
        handler_factory: HandlerFactory,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_name,
            local_addr,
            cfg,
            auth_policy,
            handler_factory,
            global_seq: AtomicU64::new(0),
            next_conn_id: AtomicU64::new(0),
            conns: RwLock::new(HashMap::new()),
            accepting: RwLock::new(Vec::new()),
        })
    }

    /// Local identity this registry answers for
    pub fn local_name(&self) -> EntityName {
        self.local_name
    }

    /// Advertised address of this node
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next attempt counter, strictly above both every value handed out
    /// before and `gt`
    pub fn get_global_seq(&self, gt: u64) -> u64 {
        self.global_seq.fetch_max(gt, Ordering::AcqRel);
        self.global_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn create_connection(self: &Arc<Self>, policy: ConnPolicy) -> Connection {
        let io = (self.handler_factory)();
        Connection::new(
            self.next_conn_id.fetch_add(1, Ordering::AcqRel) + 1,
            self.local_name,
            self.local_addr,
            policy,
            self.cfg.clone(),
            self.auth_policy.clone(),
            io,
            Arc::downgrade(self),
        )
    }

    /// Dial a peer, reusing the live connection if one exists
    pub async fn connect_to(self: &Arc<Self>, peer_addr: SocketAddr, peer_name: EntityName) -> Connection {
        self.connect_with(peer_addr, peer_name, ConnPolicy::lossless_client())
            .await
    }

    /// Dial a peer with no session continuity: faults close the
    /// connection instead of parking the session for a resume
    pub async fn connect_to_lossy(
        self: &Arc<Self>,
        peer_addr: SocketAddr,
        peer_name: EntityName,
    ) -> Connection {
        self.connect_with(peer_addr, peer_name, ConnPolicy::lossy_client())
            .await
    }

    async fn connect_with(
        self: &Arc<Self>,
        peer_addr: SocketAddr,
        peer_name: EntityName,
        policy: ConnPolicy,
    ) -> Connection {
        if let Some(existing) = self.lookup(&peer_name).await {
            if !existing.is_closed().await {
                debug!(peer = %peer_name, "reusing live connection");
                return existing;
            }
        }
        let conn = self.create_connection(policy);
        self.conns.write().await.insert(peer_name, conn.clone());
        conn.start_connect(peer_addr, peer_name).await;
        conn
    }

    /// Route an accepted socket into a fresh connection instance
    pub async fn start_accept(self: &Arc<Self>, socket: TcpStream) -> std::io::Result<Connection> {
        let transport = FrameTransport::new(socket)?;
        let conn = self.create_connection(ConnPolicy::lossless_server());
        self.accepting.write().await.push(conn.clone());
        conn.start_accept(transport).await;
        Ok(conn)
    }

    /// The live connection registered for a peer, if any
    pub async fn lookup(&self, name: &EntityName) -> Option<Connection> {
        self.conns.read().await.get(name).cloned()
    }

    /// Atomically register an accepted connection under its validated
    /// peer name, or surface the competing instance.
    pub(crate) async fn claim_accepted(&self, name: EntityName, conn: &Connection) -> ClaimOutcome {
        {
            let mut conns = self.conns.write().await;
            match conns.get(&name) {
                Some(existing) if !existing.same_as(conn) => {
                    return ClaimOutcome::Existing(existing.clone());
                }
                _ => {
                    conns.insert(name, conn.clone());
                }
            }
        }
        self.retire_accepting(conn).await;
        ClaimOutcome::Claimed
    }

    /// Hand the peer entry to `conn`, displacing whatever held it
    pub(crate) async fn replace_registration(&self, name: EntityName, conn: &Connection) {
        self.conns.write().await.insert(name, conn.clone());
        self.retire_accepting(conn).await;
    }

    async fn retire_accepting(&self, conn: &Connection) {
        self.accepting.write().await.retain(|c| !c.same_as(conn));
    }

    /// Drop a connection's registration; ignores instances that were
    /// already displaced by a replacement.
    pub(crate) async fn unregister(&self, conn: &Connection) {
        if let Some(name) = conn.peer_name().await {
            let mut conns = self.conns.write().await;
            if let Some(registered) = conns.get(&name) {
                if registered.same_as(conn) {
                    conns.remove(&name);
                    debug!(peer = %name, "unregistered connection");
                }
            }
        }
        self.retire_accepting(conn).await;
    }

    /// Number of registered peer connections
    pub async fn connection_count(&self) -> usize {
        self.conns.read().await.len()
    }

    /// Mark every connection down and wait for each to close cleanly
    pub async fn shutdown(&self) {
        let mut all: Vec<Connection> = self.conns.read().await.values().cloned().collect();
        all.extend(self.accepting.read().await.iter().cloned());
        info!(connections = all.len(), "registry shutting down");

        for conn in &all {
            conn.mark_down().await;
        }
        for conn in &all {
            conn.wait_closed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::OpenPolicy;
    use crate::io_handler::QueueHandler;
    use msgr_wire::EntityKind;
    use std::time::Duration;

    fn test_registry() -> Arc<Registry> {
        Registry::new(
            EntityName::new(EntityKind::Store, 1),
            "127.0.0.1:7000".parse().unwrap(),
            ProtocolConfig::default(),
            Arc::new(OpenPolicy),
            Box::new(|| {
                let (handler, _rx) = QueueHandler::new(Duration::from_secs(60));
                let handler: Arc<dyn ConnectionHandler> = handler;
                handler
            }),
        )
    }

    #[tokio::test]
    async fn test_global_seq_is_monotonic() {
        let registry = test_registry();
        let a = registry.get_global_seq(0);
        let b = registry.get_global_seq(0);
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_global_seq_respects_lower_bound() {
        let registry = test_registry();
        let seq = registry.get_global_seq(100);
        assert!(seq > 100);
        assert!(registry.get_global_seq(0) > seq);
    }

    #[tokio::test]
    async fn test_claim_surfaces_existing_instance() {
        let registry = test_registry();
        let name = EntityName::new(EntityKind::Store, 2);
        let first = registry.create_connection(ConnPolicy::lossless_server());
        let second = registry.create_connection(ConnPolicy::lossless_server());

        assert!(matches!(
            registry.claim_accepted(name, &first).await,
            ClaimOutcome::Claimed
        ));
        // Re-claiming by the same instance stays claimed.
        assert!(matches!(
            registry.claim_accepted(name, &first).await,
            ClaimOutcome::Claimed
        ));
        match registry.claim_accepted(name, &second).await {
            ClaimOutcome::Existing(existing) => assert!(existing.same_as(&first)),
            ClaimOutcome::Claimed => panic!("expected the first instance to hold the entry"),
        }
    }

    #[tokio::test]
    async fn test_unregister_ignores_displaced_instance() {
        let registry = test_registry();
        let name = EntityName::new(EntityKind::Store, 3);
        let first = registry.create_connection(ConnPolicy::lossless_server());
        let second = registry.create_connection(ConnPolicy::lossless_server());

        registry.replace_registration(name, &first).await;
        registry.replace_registration(name, &second).await;
        assert_eq!(registry.connection_count().await, 1);

        // `first` was displaced; its unregister must not evict `second`.
        registry.unregister(&first).await;
        assert_eq!(registry.connection_count().await, 1);
        registry.unregister(&second).await;
        // `second` has no peer name recorded yet, so the entry survives
        // until teardown learns it; lookup still resolves.
        assert!(registry.lookup(&name).await.is_some());
    }
}
