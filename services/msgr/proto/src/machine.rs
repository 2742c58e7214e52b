//! The connection protocol state machine.
//!
//! One [`Connection`] owns the lifecycle of a point-to-point link: banner
//! exchange, authentication, identity negotiation, simultaneous-dial race
//! resolution, session resume after transient failures, and orderly
//! shutdown. All transitions are serialized through the core lock and all
//! background steps run gated, so a connection has exactly one
//! authoritative state and at most one active protocol step at any time.
//!
//! Failures of any step report through [`Connection::fault`]; a fault
//! tagged with a state the connection has since left is stale and is
//! dropped, which keeps slow failing steps from undoing newer transitions.

use crate::auth::{AuthMeta, AuthPolicy};
use crate::error::ProtoError;
use crate::gate::Gate;
use crate::io_handler::{exit_pair, ConnectionHandler, ExitSignal, HandshakeListener, IoState};
use crate::registry::{ClaimOutcome, Registry};
use crate::timer::{backoff_sleep, BackoffTimer};
use crate::transport::{FrameTransport, SharedTransport};
use crate::types::{ConnPolicy, ProtocolConfig};
use msgr_wire::{
    empty_frame, from_frame, to_frame, AuthBadMethodPayload, AuthDonePayload,
    AuthReplyMorePayload, AuthRequestPayload, BannerPayload, ClientIdentPayload, EntityName,
    Features, Frame, FrameType, ReconnectOkPayload, ReconnectPayload, ResetPayload,
    RetryGlobalPayload, RetryPayload, ServerIdentPayload, BANNER_MAGIC, CLIENT_FLAG_LOSSY,
};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, trace, warn};

/// Lifecycle state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Created, not yet started
    None,
    /// Accept-side handshake in progress
    Accepting,
    /// Accept attempt lost a race, draining until the peer gives up
    ServerWait,
    /// Accept-side finalizing a fresh session
    Establishing,
    /// Dial-side handshake in progress
    Connecting,
    /// Session active, data-plane owns the socket
    Ready,
    /// Session intact but idle, no active socket
    Standby,
    /// Backing off before the next dial attempt
    Wait,
    /// A new socket is being transplanted into this connection
    Replacing,
    /// Terminal
    Closing,
}

impl ConnState {
    /// Stable diagnostic label; never used for control decisions
    pub fn state_name(self) -> &'static str {
        match self {
            ConnState::None => "NONE",
            ConnState::Accepting => "ACCEPTING",
            ConnState::ServerWait => "SERVER_WAIT",
            ConnState::Establishing => "ESTABLISHING",
            ConnState::Connecting => "CONNECTING",
            ConnState::Ready => "READY",
            ConnState::Standby => "STANDBY",
            ConnState::Wait => "WAIT",
            ConnState::Replacing => "REPLACING",
            ConnState::Closing => "CLOSING",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

/// Outcome of an accept-side resolution step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextStep {
    Ready,
    Wait,
    None,
}

/// What to do with the accept socket after a reconnect resolution
enum ReconnectDisposition {
    /// The socket was handed off or parked; the accept flow is done
    Consumed,
    /// A correction was sent; keep reading on the same socket
    Continue(FrameTransport),
}

/// State transplanted into a surviving connection during REPLACING
pub(crate) struct ReplaceParams {
    pub(crate) reconnect: bool,
    pub(crate) do_reset: bool,
    pub(crate) transport: FrameTransport,
    pub(crate) auth: Arc<AuthMeta>,
    pub(crate) peer_global_seq: u64,
    // fresh accept
    pub(crate) client_cookie: u64,
    pub(crate) peer_name: Option<EntityName>,
    pub(crate) features: Features,
    pub(crate) peer_supported: Features,
    pub(crate) peer_lossy: bool,
    // reconnect
    pub(crate) connect_seq: u64,
    pub(crate) msg_seq: u64,
}

/// Race-resolution inputs read from a competing connection
pub(crate) struct RaceSnapshot {
    pub(crate) state: ConnState,
    pub(crate) server_policy: bool,
    pub(crate) global_seq: u64,
    pub(crate) peer_global_seq: u64,
    pub(crate) client_cookie: u64,
    pub(crate) server_cookie: u64,
    pub(crate) connect_seq: u64,
}

struct Core {
    state: ConnState,
    peer_addr: Option<SocketAddr>,
    peer_name: Option<EntityName>,
    transport: Option<SharedTransport>,
    auth_meta: Arc<AuthMeta>,
    features: Features,
    peer_supported: Features,
    peer_lossy: bool,
    client_cookie: u64,
    server_cookie: u64,
    global_seq: u64,
    peer_global_seq: u64,
    connect_seq: u64,
    timer: BackoffTimer,
    exit_io: Option<ExitSignal>,
    closed: bool,
    closed_clean: bool,
}

struct Shared {
    conn_id: u64,
    local_name: EntityName,
    local_addr: SocketAddr,
    policy: ConnPolicy,
    cfg: ProtocolConfig,
    auth_policy: Arc<dyn AuthPolicy>,
    io: Arc<dyn ConnectionHandler>,
    registry: Weak<Registry>,
    core: Mutex<Core>,
    gate: Gate,
    closed_tx: watch::Sender<bool>,
}

/// Handle to one protocol connection; cheap to clone
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

fn new_cookie() -> u64 {
    loop {
        let cookie = rand::random::<u64>();
        if cookie != 0 {
            return cookie;
        }
    }
}

fn validate_peer_name(
    expected: Option<EntityName>,
    declared: EntityName,
) -> Result<(), ProtoError> {
    if declared.id == 0 {
        return Err(ProtoError::PeerMismatch {
            expected: expected.map_or_else(|| "an addressable peer".into(), |e| e.to_string()),
            got: declared.to_string(),
        });
    }
    if let Some(expected) = expected {
        if expected != declared {
            return Err(ProtoError::PeerMismatch {
                expected: expected.to_string(),
                got: declared.to_string(),
            });
        }
    }
    Ok(())
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        conn_id: u64,
        local_name: EntityName,
        local_addr: SocketAddr,
        policy: ConnPolicy,
        cfg: ProtocolConfig,
        auth_policy: Arc<dyn AuthPolicy>,
        io: Arc<dyn ConnectionHandler>,
        registry: Weak<Registry>,
    ) -> Self {
        let timer = BackoffTimer::new(cfg.backoff_initial, cfg.backoff_multiplier, cfg.backoff_max);
        let client_cookie = if policy.server { 0 } else { new_cookie() };
        let (closed_tx, _closed_rx) = watch::channel(false);

        let conn = Self {
            shared: Arc::new(Shared {
                conn_id,
                local_name,
                local_addr,
                policy,
                cfg,
                auth_policy,
                io,
                registry,
                core: Mutex::new(Core {
                    state: ConnState::None,
                    peer_addr: None,
                    peer_name: None,
                    transport: None,
                    auth_meta: Arc::new(AuthMeta::unauthenticated()),
                    features: Features::empty(),
                    peer_supported: Features::empty(),
                    peer_lossy: false,
                    client_cookie,
                    server_cookie: 0,
                    global_seq: 0,
                    peer_global_seq: 0,
                    connect_seq: 0,
                    timer,
                    exit_io: None,
                    closed: false,
                    closed_clean: false,
                }),
                gate: Gate::new(),
                closed_tx,
            }),
        };
        conn.shared
            .io
            .set_handshake_listener(Arc::new(conn.clone()));
        conn
    }

    /// Two handles naming the same connection instance
    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Current lifecycle state, for diagnostics
    pub async fn state(&self) -> ConnState {
        self.shared.core.lock().await.state
    }

    /// Peer identity, once known
    pub async fn peer_name(&self) -> Option<EntityName> {
        self.shared.core.lock().await.peer_name
    }

    /// Capability bits in effect for the current session
    pub async fn features(&self) -> Features {
        self.shared.core.lock().await.features
    }

    /// Raw capability bits the peer advertised at banner time
    pub async fn peer_features(&self) -> Features {
        self.shared.core.lock().await.peer_supported
    }

    /// Auth metadata negotiated for the current attempt
    pub async fn auth_meta(&self) -> Arc<AuthMeta> {
        self.shared.core.lock().await.auth_meta.clone()
    }

    /// Whether teardown has started
    pub async fn is_closed(&self) -> bool {
        self.shared.core.lock().await.closed
    }

    /// Whether teardown was requested rather than forced by a fault
    pub async fn is_closed_clean(&self) -> bool {
        self.shared.core.lock().await.closed_clean
    }

    /// Resolve once teardown has fully drained
    pub async fn wait_closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Force this connection down
    pub async fn mark_down(&self) {
        debug!(conn = self.shared.conn_id, "mark down");
        self.do_close(false).await;
    }

    pub(crate) async fn race_snapshot(&self) -> RaceSnapshot {
        let core = self.shared.core.lock().await;
        RaceSnapshot {
            state: core.state,
            server_policy: self.shared.policy.server,
            global_seq: core.global_seq,
            peer_global_seq: core.peer_global_seq,
            client_cookie: core.client_cookie,
            server_cookie: core.server_cookie,
            connect_seq: core.connect_seq,
        }
    }

    // ===== state machine core =====

    /// The only legal way to change `state`. Applies the transition before
    /// any handler runs and signals the data-plane with its new mode.
    fn trigger_state_locked(
        &self,
        core: &mut Core,
        next: ConnState,
        io_state: IoState,
        reentrant: bool,
    ) {
        if core.state == next && !reentrant {
            warn!(
                conn = self.shared.conn_id,
                "unexpected re-entry of {}", next
            );
        }
        debug!(
            conn = self.shared.conn_id,
            "{} -> {}",
            core.state.state_name(),
            next.state_name()
        );
        core.state = next;

        match io_state {
            IoState::Full => {
                let (signal, guard) = exit_pair();
                core.exit_io = Some(signal);
                self.shared
                    .io
                    .set_io_state(IoState::Full, core.transport.clone(), Some(guard));
            }
            other => self.shared.io.set_io_state(other, None, None),
        }
    }

    /// Wait for the data-plane to release the socket; immediate if it was
    /// never handed over.
    async fn wait_exit_io(&self) {
        let signal = self.shared.core.lock().await.exit_io.clone();
        if let Some(signal) = signal {
            signal.wait().await;
        }
    }

    /// Single funnel for every sub-protocol failure.
    ///
    /// No-ops when the connection already left `expected`: the fault is
    /// stale and a newer step owns the state.
    pub(crate) async fn fault(&self, expected: ConnState, where_: &'static str, e: ProtoError) {
        let mut core = self.shared.core.lock().await;
        if core.closed || core.state != expected {
            debug!(
                conn = self.shared.conn_id,
                "stale fault at {} (expected {}, now {}): {}",
                where_,
                expected.state_name(),
                core.state.state_name(),
                e
            );
            return;
        }

        let has_session =
            core.server_cookie != 0 && !self.shared.policy.lossy && !core.peer_lossy;

        if let ProtoError::ResetByPeer(full) = e {
            warn!(conn = self.shared.conn_id, "peer reset at {}", where_);
            self.reset_session_locked(&mut core, full);
            drop(core);
            self.do_close(true).await;
            return;
        }

        if has_session && e.is_transient() {
            warn!(
                conn = self.shared.conn_id,
                "transient fault at {}: {}", where_, e
            );
            if self.shared.policy.server || !self.shared.io.has_out_pending() {
                // Nothing to push right now: park the session and wait for
                // the peer (server) or for new outbound work (client).
                self.execute_standby(&mut core);
            } else {
                core.transport = None;
                drop(core);
                self.execute_wait(false).await;
            }
            return;
        }

        warn!(
            conn = self.shared.conn_id,
            "fatal fault at {}: {}", where_, e
        );
        drop(core);
        self.do_close(true).await;
    }

    fn reset_session_locked(&self, core: &mut Core, full: bool) {
        debug!(conn = self.shared.conn_id, full, "session reset");
        core.connect_seq = 0;
        core.peer_global_seq = 0;
        if full {
            core.server_cookie = 0;
            if !self.shared.policy.server {
                core.client_cookie = new_cookie();
            }
        }
        self.shared.io.reset_session(full);
    }

    fn execute_ready(&self, core: &mut Core) {
        core.timer.cancel();
        self.trigger_state_locked(core, ConnState::Ready, IoState::Full, false);
    }

    /// Park an intact session with no active socket
    fn execute_standby(&self, core: &mut Core) {
        core.transport = None;
        self.trigger_state_locked(core, ConnState::Standby, IoState::Delay, false);
    }

    // ===== banner exchange =====

    /// Exchange identification banners and negotiate feature bits.
    ///
    /// Returns the peer's declared identity and the negotiated plus raw
    /// supported feature sets.
    async fn banner_exchange(
        &self,
        transport: &mut FrameTransport,
        is_connect: bool,
    ) -> Result<(EntityName, Features, Features), ProtoError> {
        let banner = BannerPayload {
            magic: BANNER_MAGIC,
            name: self.shared.local_name,
            addr: self.shared.local_addr,
            supported: self.shared.cfg.supported_features.bits(),
            required: self.shared.cfg.required_features.bits(),
        };
        let our_frame = to_frame(FrameType::Banner, &banner)?;

        let peer_frame = if is_connect {
            transport.send_frame(&our_frame).await?;
            transport
                .recv_frame_timeout(self.shared.cfg.handshake_timeout, "banner_exchange")
                .await?
        } else {
            let frame = transport
                .recv_frame_timeout(self.shared.cfg.handshake_timeout, "banner_exchange")
                .await?;
            transport.send_frame(&our_frame).await?;
            frame
        };

        if peer_frame.typ != FrameType::Banner {
            return Err(ProtoError::UnexpectedFrame {
                phase: "banner_exchange",
                got: peer_frame.typ,
            });
        }
        let peer: BannerPayload = from_frame(&peer_frame)?;
        if peer.magic != BANNER_MAGIC {
            return Err(ProtoError::Banner("bad magic"));
        }
        validate_peer_name(None, peer.name)?;

        let peer_supported = Features::from_bits_truncate(peer.supported);
        let peer_required = Features::from_bits_truncate(peer.required);
        let missing_theirs = peer_required.difference(self.shared.cfg.supported_features);
        if !missing_theirs.is_empty() {
            return Err(ProtoError::MissingFeatures(missing_theirs.bits()));
        }
        let missing_ours = self.shared.cfg.required_features.difference(peer_supported);
        if !missing_ours.is_empty() {
            return Err(ProtoError::MissingFeatures(missing_ours.bits()));
        }

        let negotiated = self.shared.cfg.supported_features.intersection(peer_supported);
        trace!(
            conn = self.shared.conn_id,
            peer = %peer.name,
            features = negotiated.bits(),
            "banner exchange complete"
        );
        Ok((peer.name, negotiated, peer_supported))
    }

    // ===== authentication =====

    /// Converge both auth roles onto the negotiated metadata
    fn finish_auth(&self, meta: AuthMeta) -> Arc<AuthMeta> {
        debug!(
            conn = self.shared.conn_id,
            method = meta.method,
            keyed = meta.session_key.is_some(),
            "auth complete"
        );
        Arc::new(meta)
    }

    /// Dial-side auth. `allowed` restricts the methods tried; empty means
    /// any method this node supports.
    async fn client_auth(
        &self,
        transport: &mut FrameTransport,
        allowed: &[u32],
    ) -> Result<Arc<AuthMeta>, ProtoError> {
        let policy = &self.shared.auth_policy;
        let methods: Vec<u32> = if allowed.is_empty() {
            policy.client_methods()
        } else {
            policy
                .client_methods()
                .into_iter()
                .filter(|m| allowed.contains(m))
                .collect()
        };
        let mut method = *methods
            .first()
            .ok_or_else(|| ProtoError::AuthRejected("no usable auth method".into()))?;

        let request = AuthRequestPayload {
            method,
            preferred: methods.clone(),
            payload: policy.client_start(method),
        };
        transport
            .send_frame(&to_frame(FrameType::AuthRequest, &request)?)
            .await?;

        loop {
            let frame = transport
                .recv_frame_timeout(self.shared.cfg.handshake_timeout, "client_auth")
                .await?;
            if let Some(meta) = self
                .handle_auth_reply(transport, frame, &mut method, &methods)
                .await?
            {
                return Ok(meta);
            }
        }
    }

    /// Process one server auth reply; `Some` once auth converged
    async fn handle_auth_reply(
        &self,
        transport: &mut FrameTransport,
        frame: Frame,
        method: &mut u32,
        methods: &[u32],
    ) -> Result<Option<Arc<AuthMeta>>, ProtoError> {
        let policy = &self.shared.auth_policy;
        match frame.typ {
            FrameType::AuthReplyMore => {
                let more: AuthReplyMorePayload = from_frame(&frame)?;
                let request = AuthRequestPayload {
                    method: *method,
                    preferred: methods.to_vec(),
                    payload: policy.client_continue(*method, &more.payload)?,
                };
                transport
                    .send_frame(&to_frame(FrameType::AuthRequest, &request)?)
                    .await?;
                Ok(None)
            }
            FrameType::AuthBadMethod => {
                let bad: AuthBadMethodPayload = from_frame(&frame)?;
                debug!(
                    conn = self.shared.conn_id,
                    rejected = bad.method,
                    allowed = ?bad.allowed,
                    "auth method rejected, retrying"
                );
                let next = methods
                    .iter()
                    .copied()
                    .find(|m| *m != bad.method && bad.allowed.contains(m));
                let Some(next) = next else {
                    return Err(ProtoError::AuthRejected(format!(
                        "no mutually acceptable method, server allows {:?}",
                        bad.allowed
                    )));
                };
                *method = next;
                let request = AuthRequestPayload {
                    method: next,
                    preferred: methods.to_vec(),
                    payload: policy.client_start(next),
                };
                transport
                    .send_frame(&to_frame(FrameType::AuthRequest, &request)?)
                    .await?;
                Ok(None)
            }
            FrameType::AuthDone => {
                let done: AuthDonePayload = from_frame(&frame)?;
                let meta = policy.client_finish(done.method, &done.payload)?;
                Ok(Some(self.finish_auth(meta)))
            }
            other => Err(ProtoError::UnexpectedFrame {
                phase: "client_auth",
                got: other,
            }),
        }
    }

    /// Accept-side auth: request/response rounds until a method converges
    async fn server_auth(
        &self,
        transport: &mut FrameTransport,
    ) -> Result<Arc<AuthMeta>, ProtoError> {
        let policy = &self.shared.auth_policy;
        let accepted: Vec<u32> = if self.shared.cfg.allowed_auth_methods.is_empty() {
            policy.accepted_methods()
        } else {
            policy
                .accepted_methods()
                .into_iter()
                .filter(|m| self.shared.cfg.allowed_auth_methods.contains(m))
                .collect()
        };

        let mut current: Option<u32> = None;
        let mut round = 0u32;
        loop {
            let frame = transport
                .recv_frame_timeout(self.shared.cfg.handshake_timeout, "server_auth")
                .await?;
            if frame.typ != FrameType::AuthRequest {
                return Err(ProtoError::UnexpectedFrame {
                    phase: "server_auth",
                    got: frame.typ,
                });
            }
            let request: AuthRequestPayload = from_frame(&frame)?;
            if let Some(meta) = self
                .handle_auth_request(transport, request, &accepted, &mut current, &mut round)
                .await?
            {
                return Ok(meta);
            }
        }
    }

    /// Process one auth request round
    async fn handle_auth_request(
        &self,
        transport: &mut FrameTransport,
        request: AuthRequestPayload,
        accepted: &[u32],
        current: &mut Option<u32>,
        round: &mut u32,
    ) -> Result<Option<Arc<AuthMeta>>, ProtoError> {
        if !accepted.contains(&request.method) {
            self.auth_bad_method(transport, request.method, accepted)
                .await?;
            *current = None;
            *round = 0;
            return Ok(None);
        }
        if *current != Some(request.method) {
            *current = Some(request.method);
            *round = 0;
        }

        match self
            .shared
            .auth_policy
            .server_round(request.method, &request.payload, *round)?
        {
            crate::auth::ServerStep::Challenge { payload } => {
                *round += 1;
                transport
                    .send_frame(&to_frame(
                        FrameType::AuthReplyMore,
                        &AuthReplyMorePayload { payload },
                    )?)
                    .await?;
                Ok(None)
            }
            crate::auth::ServerStep::Done { session_key, reply } => {
                transport
                    .send_frame(&to_frame(
                        FrameType::AuthDone,
                        &AuthDonePayload {
                            method: request.method,
                            payload: reply,
                        },
                    )?)
                    .await?;
                Ok(Some(self.finish_auth(AuthMeta {
                    method: request.method,
                    session_key,
                })))
            }
            crate::auth::ServerStep::Reject { reason } => Err(ProtoError::AuthRejected(reason)),
        }
    }

    /// Reject a method and name the acceptable alternatives, letting the
    /// client retry on the same socket
    async fn auth_bad_method(
        &self,
        transport: &mut FrameTransport,
        method: u32,
        accepted: &[u32],
    ) -> Result<(), ProtoError> {
        debug!(
            conn = self.shared.conn_id,
            method,
            allowed = ?accepted,
            "rejecting auth method"
        );
        transport
            .send_frame(&to_frame(
                FrameType::AuthBadMethod,
                &AuthBadMethodPayload {
                    method,
                    allowed: accepted.to_vec(),
                },
            )?)
            .await
    }

    // ===== CONNECTING (dial side) =====

    /// Begin or retry a dial attempt
    pub(crate) async fn start_connect(&self, peer_addr: SocketAddr, peer_name: EntityName) {
        {
            let mut core = self.shared.core.lock().await;
            core.peer_addr = Some(peer_addr);
            core.peer_name = Some(peer_name);
        }
        info!(
            conn = self.shared.conn_id,
            peer = %peer_name,
            addr = %peer_addr,
            "connecting"
        );
        self.execute_connecting().await;
    }

    /// Enter CONNECTING and dispatch the dial step.
    ///
    /// The state change and the dispatch happen under one lock so a
    /// concurrent REPLACING or CLOSING cannot interleave between them.
    fn execute_connecting(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let mut core = self.shared.core.lock().await;
            if core.closed {
                return;
            }
            match core.state {
                ConnState::None
                | ConnState::Connecting
                | ConnState::Wait
                | ConnState::Standby => {}
                other => {
                    debug!(
                        conn = self.shared.conn_id,
                        state = %other,
                        "connect attempt superseded"
                    );
                    return;
                }
            }
            let Some(registry) = self.shared.registry.upgrade() else {
                return;
            };
            self.trigger_state_locked(&mut core, ConnState::Connecting, IoState::Delay, true);
            core.global_seq = registry.get_global_seq(core.global_seq);
            core.transport = None;
            let Some(peer_addr) = core.peer_addr else {
                warn!(conn = self.shared.conn_id, "connecting with no peer address");
                return;
            };

            let conn = self.clone();
            self.shared
                .gate
                .dispatch("execute_connecting", move |_token| async move {
                    if let Err(e) = conn.run_connecting(peer_addr).await {
                        conn.fault(ConnState::Connecting, "execute_connecting", e)
                            .await;
                    }
                });
        })
    }

    async fn run_connecting(&self, peer_addr: SocketAddr) -> Result<(), ProtoError> {
        let mut transport = match tokio::time::timeout(
            self.shared.cfg.handshake_timeout,
            FrameTransport::connect(peer_addr),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ProtoError::Timeout("connect")),
        };

        let (peer_name, features, peer_supported) =
            self.banner_exchange(&mut transport, true).await?;
        let expected = self.shared.core.lock().await.peer_name;
        validate_peer_name(expected, peer_name)?;

        let auth = self.client_auth(&mut transport, &[]).await?;

        let has_session = self.shared.core.lock().await.server_cookie != 0;
        let step = if has_session {
            self.client_reconnect(transport, auth, features, peer_supported)
                .await?
        } else {
            self.client_connect(transport, auth, features, peer_supported)
                .await?
        };
        if step == NextStep::Wait {
            self.process_wait().await;
        }
        Ok(())
    }

    /// Offer a fresh session and wait for the server's verdict
    async fn client_connect(
        &self,
        mut transport: FrameTransport,
        auth: Arc<AuthMeta>,
        features: Features,
        peer_supported: Features,
    ) -> Result<NextStep, ProtoError> {
        let ident = {
            let core = self.shared.core.lock().await;
            ClientIdentPayload {
                name: self.shared.local_name,
                addr: self.shared.local_addr,
                target_addr: transport.peer_addr(),
                global_seq: core.global_seq,
                client_cookie: core.client_cookie,
                supported: self.shared.cfg.supported_features.bits(),
                required: self.shared.cfg.required_features.bits(),
                flags: if self.shared.policy.lossy {
                    CLIENT_FLAG_LOSSY
                } else {
                    0
                },
            }
        };
        transport
            .send_frame(&to_frame(FrameType::ClientIdent, &ident)?)
            .await?;

        let frame = transport
            .recv_frame_timeout(self.shared.cfg.handshake_timeout, "client_connect")
            .await?;
        match frame.typ {
            FrameType::ServerIdent => {
                let server: ServerIdentPayload = from_frame(&frame)?;
                let expected = self.shared.core.lock().await.peer_name;
                validate_peer_name(expected, server.name)?;

                let mut core = self.shared.core.lock().await;
                if core.closed || core.state != ConnState::Connecting {
                    return Ok(NextStep::None);
                }
                core.peer_name = Some(server.name);
                core.server_cookie = server.server_cookie;
                core.peer_global_seq = server.global_seq;
                core.connect_seq = server.connect_seq;
                core.features = features;
                core.peer_supported = peer_supported;
                core.auth_meta = auth;
                core.transport = Some(transport.into_shared());
                info!(
                    conn = self.shared.conn_id,
                    peer = %server.name,
                    connect_seq = core.connect_seq,
                    "session established"
                );
                self.execute_ready(&mut core);
                Ok(NextStep::Ready)
            }
            FrameType::Wait => {
                debug!(conn = self.shared.conn_id, "server instructed wait");
                Ok(NextStep::Wait)
            }
            other => Err(ProtoError::UnexpectedFrame {
                phase: "client_connect",
                got: other,
            }),
        }
    }

    /// Resume the existing session, following the server's corrections
    async fn client_reconnect(
        &self,
        mut transport: FrameTransport,
        auth: Arc<AuthMeta>,
        features: Features,
        peer_supported: Features,
    ) -> Result<NextStep, ProtoError> {
        let (client_cookie, server_cookie, mut global_seq, mut connect_seq) = {
            let core = self.shared.core.lock().await;
            (
                core.client_cookie,
                core.server_cookie,
                core.global_seq,
                core.connect_seq + 1,
            )
        };

        loop {
            let reconnect = ReconnectPayload {
                addr: self.shared.local_addr,
                client_cookie,
                server_cookie,
                global_seq,
                connect_seq,
                msg_seq: self.shared.io.in_seq(),
            };
            transport
                .send_frame(&to_frame(FrameType::Reconnect, &reconnect)?)
                .await?;

            let frame = transport
                .recv_frame_timeout(self.shared.cfg.handshake_timeout, "client_reconnect")
                .await?;
            match frame.typ {
                FrameType::ReconnectOk => {
                    let ok: ReconnectOkPayload = from_frame(&frame)?;
                    let mut core = self.shared.core.lock().await;
                    if core.closed || core.state != ConnState::Connecting {
                        return Ok(NextStep::None);
                    }
                    core.connect_seq = ok.connect_seq;
                    core.auth_meta = auth;
                    core.features = features;
                    core.peer_supported = peer_supported;
                    core.transport = Some(transport.into_shared());
                    self.shared.io.requeue_from(ok.msg_seq);
                    info!(
                        conn = self.shared.conn_id,
                        connect_seq = ok.connect_seq,
                        "session resumed"
                    );
                    self.execute_ready(&mut core);
                    return Ok(NextStep::Ready);
                }
                FrameType::Retry => {
                    let retry: RetryPayload = from_frame(&frame)?;
                    debug!(
                        conn = self.shared.conn_id,
                        server_connect_seq = retry.connect_seq,
                        "reconnect retry"
                    );
                    connect_seq = retry.connect_seq + 1;
                }
                FrameType::RetryGlobal => {
                    let retry: RetryGlobalPayload = from_frame(&frame)?;
                    let Some(registry) = self.shared.registry.upgrade() else {
                        return Err(ProtoError::Closed);
                    };
                    let fresh = registry.get_global_seq(retry.global_seq);
                    let mut core = self.shared.core.lock().await;
                    core.global_seq = fresh;
                    global_seq = fresh;
                    debug!(
                        conn = self.shared.conn_id,
                        global_seq = fresh,
                        "reconnect retry with new global seq"
                    );
                }
                FrameType::Reset => {
                    let reset: ResetPayload = from_frame(&frame)?;
                    warn!(
                        conn = self.shared.conn_id,
                        full = reset.full,
                        "server reset the session, starting fresh"
                    );
                    {
                        let mut core = self.shared.core.lock().await;
                        if core.closed || core.state != ConnState::Connecting {
                            return Ok(NextStep::None);
                        }
                        self.reset_session_locked(&mut core, reset.full);
                    }
                    return self
                        .client_connect(transport, auth, features, peer_supported)
                        .await;
                }
                FrameType::Wait => return Ok(NextStep::Wait),
                other => {
                    return Err(ProtoError::UnexpectedFrame {
                        phase: "client_reconnect",
                        got: other,
                    })
                }
            }
        }
    }

    /// Apply the backoff before retrying the whole connect attempt
    async fn process_wait(&self) {
        self.execute_wait(true).await;
    }

    // ===== ACCEPTING (accept side) =====

    /// Take ownership of an accepted socket and run the handshake
    pub(crate) async fn start_accept(&self, transport: FrameTransport) {
        let mut core = self.shared.core.lock().await;
        if core.closed {
            return;
        }
        debug!(
            conn = self.shared.conn_id,
            addr = %transport.peer_addr(),
            "accepting"
        );
        core.peer_addr = Some(transport.peer_addr());
        self.trigger_state_locked(&mut core, ConnState::Accepting, IoState::None, false);

        let conn = self.clone();
        self.shared
            .gate
            .dispatch("execute_accepting", move |_token| async move {
                if let Err(e) = conn.run_accepting(transport).await {
                    conn.fault(ConnState::Accepting, "execute_accepting", e).await;
                }
            });
    }

    async fn run_accepting(&self, mut transport: FrameTransport) -> Result<(), ProtoError> {
        let (banner_name, features, peer_supported) =
            self.banner_exchange(&mut transport, false).await?;
        let auth = self.server_auth(&mut transport).await?;

        loop {
            let frame = transport
                .recv_frame_timeout(self.shared.cfg.handshake_timeout, "execute_accepting")
                .await?;
            match frame.typ {
                FrameType::ClientIdent => {
                    let ident: ClientIdentPayload = from_frame(&frame)?;
                    self.server_connect(
                        transport,
                        ident,
                        banner_name,
                        features,
                        peer_supported,
                        auth,
                    )
                    .await?;
                    return Ok(());
                }
                FrameType::Reconnect => {
                    let reconnect = read_reconnect(&frame)?;
                    match self
                        .server_reconnect(
                            transport,
                            reconnect,
                            banner_name,
                            auth.clone(),
                            features,
                            peer_supported,
                        )
                        .await?
                    {
                        ReconnectDisposition::Consumed => return Ok(()),
                        ReconnectDisposition::Continue(t) => transport = t,
                    }
                }
                other => {
                    return Err(ProtoError::UnexpectedFrame {
                        phase: "execute_accepting",
                        got: other,
                    })
                }
            }
        }
    }

    /// Resolve a fresh-session offer, including connection races
    async fn server_connect(
        &self,
        transport: FrameTransport,
        ident: ClientIdentPayload,
        banner_name: EntityName,
        features: Features,
        peer_supported: Features,
        auth: Arc<AuthMeta>,
    ) -> Result<NextStep, ProtoError> {
        validate_peer_name(Some(banner_name), ident.name)?;
        let Some(registry) = self.shared.registry.upgrade() else {
            return Err(ProtoError::Closed);
        };

        match registry.claim_accepted(ident.name, self).await {
            ClaimOutcome::Claimed => {
                self.accept_new_session(transport, ident, features, peer_supported, auth)
                    .await
            }
            ClaimOutcome::Existing(existing) => {
                self.handle_existing_connection(
                    existing,
                    transport,
                    ident,
                    features,
                    peer_supported,
                    auth,
                )
                .await
            }
        }
    }

    async fn accept_new_session(
        &self,
        transport: FrameTransport,
        ident: ClientIdentPayload,
        features: Features,
        peer_supported: Features,
        auth: Arc<AuthMeta>,
    ) -> Result<NextStep, ProtoError> {
        {
            let mut core = self.shared.core.lock().await;
            if core.closed || core.state != ConnState::Accepting {
                return Ok(NextStep::None);
            }
            core.peer_name = Some(ident.name);
            core.client_cookie = ident.client_cookie;
            core.server_cookie = new_cookie();
            core.peer_global_seq = ident.global_seq;
            core.peer_lossy = ident.flags & CLIENT_FLAG_LOSSY != 0;
            core.features = features;
            core.peer_supported = peer_supported;
            core.auth_meta = auth;
            core.connect_seq = 1;
        }
        self.execute_establishing(transport).await;
        Ok(NextStep::Ready)
    }

    /// Decide the fate of a new accept when a connection to the same peer
    /// already exists.
    async fn handle_existing_connection(
        &self,
        existing: Connection,
        transport: FrameTransport,
        ident: ClientIdentPayload,
        features: Features,
        peer_supported: Features,
        auth: Arc<AuthMeta>,
    ) -> Result<NextStep, ProtoError> {
        let snapshot = existing.race_snapshot().await;

        if snapshot.state == ConnState::Closing {
            // The old instance is going away; this accept takes over.
            if let Some(registry) = self.shared.registry.upgrade() {
                registry.replace_registration(ident.name, self).await;
            }
            return self
                .accept_new_session(transport, ident, features, peer_supported, auth)
                .await;
        }

        if snapshot.server_cookie != 0 || snapshot.server_policy {
            // The existing instance carries (or carried) an accepted
            // session: a lower-seq offer is a stale duplicate.
            if snapshot.peer_global_seq > ident.global_seq {
                debug!(
                    conn = self.shared.conn_id,
                    existing_peer_gseq = snapshot.peer_global_seq,
                    offered_gseq = ident.global_seq,
                    "stale connect attempt, instructing wait"
                );
                return self.send_wait(transport).await;
            }
            // Matching cookie: the peer is retrying the same attempt.
            // Mismatch: the peer restarted and the old session is dead.
            let do_reset = snapshot.client_cookie != ident.client_cookie;
            return self
                .reuse_connection(
                    existing,
                    do_reset,
                    false,
                    0,
                    0,
                    transport,
                    ident,
                    features,
                    peer_supported,
                    auth,
                )
                .await;
        }

        // The existing instance is our own in-flight dial to this peer.
        // Higher attempt counter wins; equal counters break the tie on the
        // entity names, which both sides compute identically.
        let peer_wins = ident.global_seq > snapshot.global_seq
            || (ident.global_seq == snapshot.global_seq && ident.name < self.shared.local_name);
        if peer_wins {
            debug!(
                conn = self.shared.conn_id,
                ours = snapshot.global_seq,
                theirs = ident.global_seq,
                "dial race lost, folding into existing connection"
            );
            self.reuse_connection(
                existing,
                false,
                false,
                0,
                0,
                transport,
                ident,
                features,
                peer_supported,
                auth,
            )
            .await
        } else {
            debug!(
                conn = self.shared.conn_id,
                ours = snapshot.global_seq,
                theirs = ident.global_seq,
                "dial race won, instructing wait"
            );
            self.send_wait(transport).await
        }
    }

    /// Transplant this accept into the surviving connection instance and
    /// retire this one.
    #[allow(clippy::too_many_arguments)]
    async fn reuse_connection(
        &self,
        existing: Connection,
        do_reset: bool,
        reconnect: bool,
        conn_seq: u64,
        msg_seq: u64,
        transport: FrameTransport,
        ident: ClientIdentPayload,
        features: Features,
        peer_supported: Features,
        auth: Arc<AuthMeta>,
    ) -> Result<NextStep, ProtoError> {
        existing
            .trigger_replacing(ReplaceParams {
                reconnect,
                do_reset,
                transport,
                auth,
                peer_global_seq: ident.global_seq,
                client_cookie: ident.client_cookie,
                peer_name: Some(ident.name),
                features,
                peer_supported,
                peer_lossy: ident.flags & CLIENT_FLAG_LOSSY != 0,
                connect_seq: conn_seq,
                msg_seq,
            })
            .await;
        self.do_close(false).await;
        Ok(NextStep::None)
    }

    /// Tell a losing attempt to back off, then park this accept
    async fn send_wait(&self, mut transport: FrameTransport) -> Result<NextStep, ProtoError> {
        transport.send_frame(&empty_frame(FrameType::Wait)).await?;
        self.execute_server_wait(transport).await;
        Ok(NextStep::Wait)
    }

    /// Drain the losing socket until the peer abandons it
    async fn execute_server_wait(&self, transport: FrameTransport) {
        let mut core = self.shared.core.lock().await;
        if core.closed {
            return;
        }
        self.trigger_state_locked(&mut core, ConnState::ServerWait, IoState::None, false);

        let conn = self.clone();
        self.shared
            .gate
            .dispatch("execute_server_wait", move |_token| async move {
                let mut transport = transport;
                loop {
                    match transport.recv_frame().await {
                        Ok(frame) => {
                            trace!(typ = %frame.typ, "ignoring frame in server wait");
                        }
                        Err(_) => break,
                    }
                }
                conn.do_close(false).await;
            });
    }

    /// Resolve a session resume request against the sessions we hold
    async fn server_reconnect(
        &self,
        transport: FrameTransport,
        reconnect: ReconnectPayload,
        banner_name: EntityName,
        auth: Arc<AuthMeta>,
        features: Features,
        peer_supported: Features,
    ) -> Result<ReconnectDisposition, ProtoError> {
        let Some(registry) = self.shared.registry.upgrade() else {
            return Err(ProtoError::Closed);
        };

        let existing = match registry.lookup(&banner_name).await {
            Some(conn) if !conn.same_as(self) => conn,
            _ => {
                debug!(
                    conn = self.shared.conn_id,
                    peer = %banner_name,
                    "reconnect for unknown session"
                );
                return self.send_reset(transport, true).await;
            }
        };

        let snapshot = existing.race_snapshot().await;
        if snapshot.state == ConnState::Closing || snapshot.server_cookie == 0 {
            return self.send_reset(transport, true).await;
        }
        if snapshot.client_cookie != reconnect.client_cookie
            || snapshot.server_cookie != reconnect.server_cookie
        {
            warn!(
                conn = self.shared.conn_id,
                peer = %banner_name,
                "reconnect cookies do not match the session we hold"
            );
            return self.send_reset(transport, true).await;
        }
        if reconnect.global_seq < snapshot.peer_global_seq {
            return self
                .send_retry_global(transport, snapshot.peer_global_seq)
                .await;
        }
        if reconnect.connect_seq <= snapshot.connect_seq {
            return self.send_retry(transport, snapshot.connect_seq).await;
        }

        let ident = ClientIdentPayload {
            name: banner_name,
            addr: reconnect.addr,
            target_addr: self.shared.local_addr,
            global_seq: reconnect.global_seq,
            client_cookie: reconnect.client_cookie,
            supported: peer_supported.bits(),
            required: 0,
            flags: 0,
        };
        self.reuse_connection(
            existing,
            false,
            true,
            reconnect.connect_seq,
            reconnect.msg_seq,
            transport,
            ident,
            features,
            peer_supported,
            auth,
        )
        .await?;
        Ok(ReconnectDisposition::Consumed)
    }

    /// The peer's session view is behind ours; have it retry
    async fn send_retry(
        &self,
        mut transport: FrameTransport,
        connect_seq: u64,
    ) -> Result<ReconnectDisposition, ProtoError> {
        debug!(conn = self.shared.conn_id, connect_seq, "sending retry");
        transport
            .send_frame(&to_frame(FrameType::Retry, &RetryPayload { connect_seq })?)
            .await?;
        Ok(ReconnectDisposition::Continue(transport))
    }

    /// The peer's attempt counter is stale; have it retry higher
    async fn send_retry_global(
        &self,
        mut transport: FrameTransport,
        global_seq: u64,
    ) -> Result<ReconnectDisposition, ProtoError> {
        debug!(conn = self.shared.conn_id, global_seq, "sending retry global");
        transport
            .send_frame(&to_frame(
                FrameType::RetryGlobal,
                &RetryGlobalPayload { global_seq },
            )?)
            .await?;
        Ok(ReconnectDisposition::Continue(transport))
    }

    /// We hold no matching session; force the peer to start fresh rather
    /// than silently losing messages
    async fn send_reset(
        &self,
        mut transport: FrameTransport,
        full: bool,
    ) -> Result<ReconnectDisposition, ProtoError> {
        debug!(conn = self.shared.conn_id, full, "sending reset");
        transport
            .send_frame(&to_frame(FrameType::Reset, &ResetPayload { full })?)
            .await?;
        Ok(ReconnectDisposition::Continue(transport))
    }

    // ===== ESTABLISHING / REPLACING =====

    /// Finalize a fresh accepted session
    async fn execute_establishing(&self, transport: FrameTransport) {
        let shared_transport = transport.into_shared();
        let mut core = self.shared.core.lock().await;
        if core.closed || core.state != ConnState::Accepting {
            debug!(
                conn = self.shared.conn_id,
                state = %core.state,
                "establish superseded"
            );
            return;
        }
        core.transport = Some(shared_transport.clone());
        self.trigger_state_locked(&mut core, ConnState::Establishing, IoState::Delay, false);

        let conn = self.clone();
        self.shared
            .gate
            .dispatch("execute_establishing", move |_token| async move {
                if let Err(e) = conn.send_server_ident(shared_transport).await {
                    conn.fault(ConnState::Establishing, "execute_establishing", e)
                        .await;
                }
            });
    }

    /// Send our identity with the chosen cookie, then go READY
    async fn send_server_ident(&self, transport: SharedTransport) -> Result<(), ProtoError> {
        let ident = {
            let mut core = self.shared.core.lock().await;
            if core.closed || core.state != ConnState::Establishing {
                return Ok(());
            }
            let Some(registry) = self.shared.registry.upgrade() else {
                return Err(ProtoError::Closed);
            };
            core.global_seq = registry.get_global_seq(core.global_seq);
            ServerIdentPayload {
                name: self.shared.local_name,
                addr: self.shared.local_addr,
                global_seq: core.global_seq,
                server_cookie: core.server_cookie,
                features: core.features.bits(),
                connect_seq: core.connect_seq,
            }
        };

        {
            let mut guard = transport.lock().await;
            guard
                .send_frame(&to_frame(FrameType::ServerIdent, &ident)?)
                .await?;
        }

        let mut core = self.shared.core.lock().await;
        if core.closed || core.state != ConnState::Establishing {
            return Ok(());
        }
        let peer = core.peer_name.map(|n| n.to_string()).unwrap_or_default();
        info!(
            conn = self.shared.conn_id,
            peer = %peer,
            connect_seq = core.connect_seq,
            "session established"
        );
        self.execute_ready(&mut core);
        Ok(())
    }

    /// Transplant a new socket (and negotiated state) into this
    /// connection, superseding whatever step was running.
    pub(crate) async fn trigger_replacing(&self, params: ReplaceParams) {
        let mut core = self.shared.core.lock().await;
        if core.closed {
            // Too late; the new socket dies with the params.
            return;
        }
        self.trigger_state_locked(&mut core, ConnState::Replacing, IoState::Delay, true);

        let conn = self.clone();
        self.shared
            .gate
            .dispatch("trigger_replacing", move |_token| async move {
                conn.run_replacing(params).await;
            });
    }

    async fn run_replacing(&self, params: ReplaceParams) {
        // The data-plane must let go of the old socket first.
        self.wait_exit_io().await;

        let peer_addr = params.transport.peer_addr();
        let shared_transport = params.transport.into_shared();
        let reconnect = params.reconnect;
        {
            let mut core = self.shared.core.lock().await;
            if core.closed || core.state != ConnState::Replacing {
                return;
            }
            if params.do_reset {
                self.reset_session_locked(&mut core, true);
            }
            core.auth_meta = params.auth;
            core.peer_global_seq = params.peer_global_seq;
            core.peer_addr = Some(peer_addr);
            core.transport = Some(shared_transport.clone());
            core.timer.cancel();
            if reconnect {
                core.connect_seq = params.connect_seq;
            } else {
                core.peer_name = params.peer_name;
                core.client_cookie = params.client_cookie;
                core.server_cookie = new_cookie();
                core.features = params.features;
                core.peer_supported = params.peer_supported;
                core.peer_lossy = params.peer_lossy;
                core.connect_seq = 1;
            }
        }

        if reconnect {
            let ok = ReconnectOkPayload {
                connect_seq: params.connect_seq,
                msg_seq: self.shared.io.in_seq(),
            };
            self.shared.io.requeue_from(params.msg_seq);
            let sent = async {
                let mut guard = shared_transport.lock().await;
                guard
                    .send_frame(&to_frame(FrameType::ReconnectOk, &ok)?)
                    .await
            }
            .await;
            if let Err(e) = sent {
                self.fault(ConnState::Replacing, "trigger_replacing", e).await;
                return;
            }

            let mut core = self.shared.core.lock().await;
            if core.closed || core.state != ConnState::Replacing {
                return;
            }
            info!(
                conn = self.shared.conn_id,
                connect_seq = params.connect_seq,
                "session resumed by peer"
            );
            self.execute_ready(&mut core);
        } else {
            {
                let mut core = self.shared.core.lock().await;
                if core.closed || core.state != ConnState::Replacing {
                    return;
                }
                self.trigger_state_locked(&mut core, ConnState::Establishing, IoState::Delay, false);
            }
            if let Err(e) = self.send_server_ident(shared_transport).await {
                self.fault(ConnState::Establishing, "trigger_replacing", e)
                    .await;
            }
        }
    }

    // ===== WAIT / STANDBY =====

    /// Back off, then retry the whole connect attempt.
    ///
    /// Re-entrant: arming the slot cancels any pending backoff.
    async fn execute_wait(&self, max_backoff: bool) {
        let mut core = self.shared.core.lock().await;
        if core.closed {
            return;
        }
        match core.state {
            ConnState::Connecting | ConnState::Ready | ConnState::Wait => {}
            other => {
                debug!(
                    conn = self.shared.conn_id,
                    state = %other,
                    "wait superseded"
                );
                return;
            }
        }
        core.transport = None;
        self.trigger_state_locked(&mut core, ConnState::Wait, IoState::Delay, true);
        let (dur, abort) = core.timer.arm(max_backoff);
        debug!(conn = self.shared.conn_id, backoff = ?dur, "waiting before retry");

        let conn = self.clone();
        self.shared
            .gate
            .dispatch("execute_wait", move |_token| async move {
                if !backoff_sleep(dur, &abort).await {
                    trace!("backoff aborted");
                    return;
                }
                let proceed = {
                    let core = conn.shared.core.lock().await;
                    !core.closed && core.state == ConnState::Wait
                };
                if proceed {
                    conn.execute_connecting().await;
                }
            });
    }

    // ===== CLOSING =====

    /// Tear the connection down. Reentrant: teardown side effects run
    /// exactly once, and a gated step may call this without deadlocking.
    pub(crate) async fn do_close(&self, dispatch_reset: bool) {
        let exit = {
            let mut core = self.shared.core.lock().await;
            if core.closed {
                return;
            }
            core.closed = true;
            core.closed_clean = !dispatch_reset;
            core.timer.cancel();
            core.transport = None;
            let exit = core.exit_io.clone();
            self.trigger_state_locked(&mut core, ConnState::Closing, IoState::None, false);
            exit
        };
        if dispatch_reset {
            self.shared.io.reset_session(true);
        }

        // Teardown runs detached so the step that reported the fault can
        // drain through the gate instead of waiting on itself.
        let conn = self.clone();
        tokio::spawn(async move {
            conn.shared.gate.close().await;
            if let Some(exit) = exit {
                exit.wait().await;
            }
            conn.shared.io.close();
            if let Some(registry) = conn.shared.registry.upgrade() {
                registry.unregister(&conn).await;
            }
            let _ = conn.shared.closed_tx.send(true);
            debug!(conn = conn.shared.conn_id, "connection closed");
        });
    }
}

fn read_reconnect(frame: &Frame) -> Result<ReconnectPayload, ProtoError> {
    let reconnect: ReconnectPayload = from_frame(frame)?;
    trace!(
        client_cookie = reconnect.client_cookie,
        server_cookie = reconnect.server_cookie,
        global_seq = reconnect.global_seq,
        connect_seq = reconnect.connect_seq,
        msg_seq = reconnect.msg_seq,
        "read reconnect parameters"
    );
    Ok(reconnect)
}

impl HandshakeListener for Connection {
    fn notify_out(&self) {
        let conn = self.clone();
        tokio::spawn(async move {
            let wake = {
                let core = conn.shared.core.lock().await;
                !core.closed
                    && core.state == ConnState::Standby
                    && !conn.shared.policy.server
            };
            if wake {
                debug!(conn = conn.shared.conn_id, "pending work wakes standby");
                conn.execute_connecting().await;
            }
        });
    }

    fn notify_out_fault(&self, where_: &'static str, error: ProtoError) {
        let conn = self.clone();
        tokio::spawn(async move {
            conn.fault(ConnState::Ready, where_, error).await;
        });
    }

    fn notify_mark_down(&self) {
        let conn = self.clone();
        tokio::spawn(async move {
            conn.do_close(false).await;
        });
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.shared.conn_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{OpenPolicy, PresharedPolicy, METHOD_OPEN, METHOD_PRESHARED};
    use crate::io_handler::{InboundData, QueueHandler};
    use bytes::Bytes;
    use msgr_wire::EntityKind;
    use serde::Serialize;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    type HandlerPair = (Arc<QueueHandler>, mpsc::UnboundedReceiver<InboundData>);

    struct Node {
        registry: Arc<Registry>,
        addr: SocketAddr,
        handlers: Arc<StdMutex<VecDeque<HandlerPair>>>,
        _accept_task: tokio::task::JoinHandle<()>,
    }

    fn fast_cfg() -> ProtocolConfig {
        ProtocolConfig {
            handshake_timeout: Duration::from_secs(5),
            backoff_initial: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            backoff_max: Duration::from_millis(400),
            keepalive_interval: Duration::from_secs(30),
            ..ProtocolConfig::default()
        }
    }

    async fn spawn_node(kind: EntityKind, id: u64) -> Node {
        spawn_node_with(kind, id, fast_cfg(), Arc::new(OpenPolicy)).await
    }

    async fn spawn_node_with(
        kind: EntityKind,
        id: u64,
        cfg: ProtocolConfig,
        auth: Arc<dyn AuthPolicy>,
    ) -> Node {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handlers: Arc<StdMutex<VecDeque<HandlerPair>>> =
            Arc::new(StdMutex::new(VecDeque::new()));

        let factory_handlers = handlers.clone();
        let registry = Registry::new(
            EntityName::new(kind, id),
            addr,
            cfg,
            auth,
            Box::new(move || {
                let (handler, rx) = QueueHandler::new(Duration::from_secs(30));
                factory_handlers.lock().unwrap().push_back((handler.clone(), rx));
                let handler: Arc<dyn ConnectionHandler> = handler;
                handler
            }),
        );

        let accept_registry = registry.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let _ = accept_registry.start_accept(socket).await;
            }
        });

        Node {
            registry,
            addr,
            handlers,
            _accept_task: accept_task,
        }
    }

    impl Node {
        fn name(&self) -> EntityName {
            self.registry.local_name()
        }

        fn take_handler(&self) -> HandlerPair {
            self.handlers.lock().unwrap().pop_front().expect("no handler created")
        }

        async fn take_handler_blocking(&self) -> HandlerPair {
            timeout(Duration::from_secs(5), async {
                loop {
                    if let Some(pair) = self.handlers.lock().unwrap().pop_front() {
                        return pair;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("timed out waiting for a handler")
        }
    }

    async fn wait_for_state(conn: &Connection, want: ConnState) {
        let result = timeout(Duration::from_secs(5), async {
            loop {
                if conn.state().await == want {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if result.is_err() {
            panic!(
                "timed out waiting for {}, still {}",
                want,
                conn.state().await
            );
        }
    }

    async fn session_tuple(conn: &Connection) -> (u64, u64, u64) {
        let core = conn.shared.core.lock().await;
        (core.client_cookie, core.server_cookie, core.connect_seq)
    }

    /// Hand-driven wire peer for exercising the accept side directly.
    struct RawPeer {
        transport: FrameTransport,
        name: EntityName,
        addr: SocketAddr,
    }

    impl RawPeer {
        async fn dial(target: SocketAddr, name: EntityName) -> Self {
            let transport = FrameTransport::connect(target).await.unwrap();
            Self {
                transport,
                name,
                addr: "127.0.0.1:9909".parse().unwrap(),
            }
        }

        async fn banner(&mut self) -> BannerPayload {
            let banner = BannerPayload {
                magic: BANNER_MAGIC,
                name: self.name,
                addr: self.addr,
                supported: Features::all().bits(),
                required: 0,
            };
            self.send(FrameType::Banner, &banner).await;
            let frame = self.recv().await;
            assert_eq!(frame.typ, FrameType::Banner);
            from_frame(&frame).unwrap()
        }

        async fn auth_open(&mut self) {
            let request = AuthRequestPayload {
                method: METHOD_OPEN,
                preferred: vec![METHOD_OPEN],
                payload: Bytes::new(),
            };
            self.send(FrameType::AuthRequest, &request).await;
            let frame = self.recv().await;
            assert_eq!(frame.typ, FrameType::AuthDone);
        }

        fn client_ident(&self, global_seq: u64, client_cookie: u64, target: SocketAddr) -> ClientIdentPayload {
            ClientIdentPayload {
                name: self.name,
                addr: self.addr,
                target_addr: target,
                global_seq,
                client_cookie,
                supported: Features::all().bits(),
                required: 0,
                flags: 0,
            }
        }

        async fn send<T: Serialize>(&mut self, typ: FrameType, value: &T) {
            self.transport
                .send_frame(&to_frame(typ, value).unwrap())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Frame {
            timeout(Duration::from_secs(5), self.transport.recv_frame())
                .await
                .expect("timed out waiting for a frame")
                .unwrap()
        }
    }

    #[test]
    fn test_state_names_are_stable() {
        assert_eq!(ConnState::None.state_name(), "NONE");
        assert_eq!(ConnState::ServerWait.state_name(), "SERVER_WAIT");
        assert_eq!(ConnState::Replacing.state_name(), "REPLACING");
        assert_eq!(ConnState::Closing.to_string(), "CLOSING");
    }

    #[test]
    fn test_validate_peer_name() {
        let store2 = EntityName::new(EntityKind::Store, 2);
        assert!(validate_peer_name(None, store2).is_ok());
        assert!(validate_peer_name(Some(store2), store2).is_ok());
        assert!(validate_peer_name(None, EntityName::new(EntityKind::Store, 0)).is_err());
        assert!(
            validate_peer_name(Some(store2), EntityName::new(EntityKind::Store, 3)).is_err()
        );
    }

    #[tokio::test]
    async fn test_connect_establishes_session_and_moves_data() {
        let a = spawn_node(EntityKind::Store, 1).await;
        let b = spawn_node(EntityKind::Store, 2).await;

        let conn = a.registry.connect_to(b.addr, b.name()).await;
        wait_for_state(&conn, ConnState::Ready).await;

        let b_conn = timeout(Duration::from_secs(5), async {
            loop {
                if let Some(conn) = b.registry.lookup(&a.name()).await {
                    return conn;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        wait_for_state(&b_conn, ConnState::Ready).await;

        // Both ends agree on the session identity tuple.
        let (a_client, a_server, a_cseq) = session_tuple(&conn).await;
        let (b_client, b_server, b_cseq) = session_tuple(&b_conn).await;
        assert_eq!(a_client, b_client);
        assert_eq!(a_server, b_server);
        assert_ne!(a_server, 0);
        assert_eq!(a_cseq, 1);
        assert_eq!(b_cseq, 1);
        assert_eq!(conn.auth_meta().await.method, METHOD_OPEN);
        assert!(conn.features().await.contains(Features::RECONNECT));
        assert!(conn.peer_features().await.contains(Features::RECONNECT));

        // Data flows through the data-plane.
        let (a_handler, _a_rx) = a.take_handler();
        let (_b_handler, mut b_rx) = b.take_handler_blocking().await;
        a_handler.queue_message(Bytes::from_static(b"hello"));
        let delivered = timeout(Duration::from_secs(5), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.body, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_reconnect_resumes_session_without_loss() {
        let a = spawn_node(EntityKind::Store, 1).await;
        let b = spawn_node(EntityKind::Store, 2).await;

        let conn = a.registry.connect_to(b.addr, b.name()).await;
        wait_for_state(&conn, ConnState::Ready).await;
        let (a_handler, _a_rx) = a.take_handler();
        let (_b_handler, mut b_rx) = b.take_handler_blocking().await;

        a_handler.queue_message(Bytes::from_static(b"before"));
        let first = timeout(Duration::from_secs(5), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.body, Bytes::from_static(b"before"));

        let (_, server_cookie_before, _) = session_tuple(&conn).await;

        // Sever the socket under the established session.
        let transport = conn.shared.core.lock().await.transport.clone().unwrap();
        transport.lock().await.shutdown().await;

        // Work queued during the outage must survive the resume.
        a_handler.queue_message(Bytes::from_static(b"during"));

        let second = timeout(Duration::from_secs(10), b_rx.recv())
            .await
            .expect("message lost across reconnect")
            .unwrap();
        assert_eq!(second.body, Bytes::from_static(b"during"));

        wait_for_state(&conn, ConnState::Ready).await;
        let (_, server_cookie_after, connect_seq) = session_tuple(&conn).await;
        assert_eq!(server_cookie_after, server_cookie_before);
        assert_eq!(connect_seq, 2);

        let b_conn = b.registry.lookup(&a.name()).await.unwrap();
        let (_, _, b_connect_seq) = session_tuple(&b_conn).await;
        assert_eq!(b_connect_seq, 2);
    }

    #[tokio::test]
    async fn test_lossy_connection_closes_instead_of_resuming() {
        let a = spawn_node(EntityKind::Store, 1).await;
        let b = spawn_node(EntityKind::Store, 2).await;

        let conn = a.registry.connect_to_lossy(b.addr, b.name()).await;
        wait_for_state(&conn, ConnState::Ready).await;

        // With no session continuity, a severed socket tears the
        // connection down rather than parking it.
        let transport = conn.shared.core.lock().await.transport.clone().unwrap();
        transport.lock().await.shutdown().await;

        timeout(Duration::from_secs(5), conn.wait_closed())
            .await
            .expect("lossy connection never closed");
        assert!(conn.is_closed().await);
        assert!(!conn.is_closed_clean().await);
    }

    #[tokio::test]
    async fn test_reconnect_for_unknown_session_forces_reset() {
        let b = spawn_node(EntityKind::Store, 2).await;
        let mut peer = RawPeer::dial(b.addr, EntityName::new(EntityKind::Store, 77)).await;
        peer.banner().await;
        peer.auth_open().await;

        peer.send(
            FrameType::Reconnect,
            &ReconnectPayload {
                addr: peer.addr,
                client_cookie: 11,
                server_cookie: 22,
                global_seq: 5,
                connect_seq: 3,
                msg_seq: 40,
            },
        )
        .await;

        let frame = peer.recv().await;
        assert_eq!(frame.typ, FrameType::Reset);
        let reset: ResetPayload = from_frame(&frame).unwrap();
        assert!(reset.full);

        // The peer starts fresh on the same socket.
        let ident = peer.client_ident(6, 99, b.addr);
        peer.send(FrameType::ClientIdent, &ident).await;
        let frame = peer.recv().await;
        assert_eq!(frame.typ, FrameType::ServerIdent);
        let server: ServerIdentPayload = from_frame(&frame).unwrap();
        assert_ne!(server.server_cookie, 0);
        assert_eq!(server.connect_seq, 1);
    }

    #[tokio::test]
    async fn test_auth_bad_method_allows_retry_on_same_socket() {
        let secret = Bytes::from_static(b"cluster-secret");
        let b = spawn_node_with(
            EntityKind::Store,
            2,
            fast_cfg(),
            Arc::new(PresharedPolicy::new(secret.clone())),
        )
        .await;

        let mut peer = RawPeer::dial(b.addr, EntityName::new(EntityKind::Store, 5)).await;
        peer.banner().await;

        // Ask for a method outside the server's accepted set.
        peer.send(
            FrameType::AuthRequest,
            &AuthRequestPayload {
                method: METHOD_OPEN,
                preferred: vec![METHOD_OPEN, METHOD_PRESHARED],
                payload: Bytes::new(),
            },
        )
        .await;
        let frame = peer.recv().await;
        assert_eq!(frame.typ, FrameType::AuthBadMethod);
        let bad: AuthBadMethodPayload = from_frame(&frame).unwrap();
        assert_eq!(bad.allowed, vec![METHOD_PRESHARED]);

        // Retry with an accepted method on the same transport.
        peer.send(
            FrameType::AuthRequest,
            &AuthRequestPayload {
                method: METHOD_PRESHARED,
                preferred: vec![METHOD_PRESHARED],
                payload: Bytes::new(),
            },
        )
        .await;
        let frame = peer.recv().await;
        assert_eq!(frame.typ, FrameType::AuthReplyMore);
        let challenge: AuthReplyMorePayload = from_frame(&frame).unwrap();

        let client_side = PresharedPolicy::new(secret);
        let proof = client_side
            .client_continue(METHOD_PRESHARED, &challenge.payload)
            .unwrap();
        peer.send(
            FrameType::AuthRequest,
            &AuthRequestPayload {
                method: METHOD_PRESHARED,
                preferred: vec![METHOD_PRESHARED],
                payload: proof,
            },
        )
        .await;
        let frame = peer.recv().await;
        assert_eq!(frame.typ, FrameType::AuthDone);

        // The handshake continues to a session without a new connection.
        let ident = peer.client_ident(3, 77, b.addr);
        peer.send(FrameType::ClientIdent, &ident).await;
        assert_eq!(peer.recv().await.typ, FrameType::ServerIdent);
    }

    async fn silent_endpoint() -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                held.push(socket);
            }
        });
        (addr, hold)
    }

    #[tokio::test]
    async fn test_accept_replaces_lower_seq_dial_attempt() {
        let a = spawn_node(EntityKind::Store, 1).await;
        let (silent_addr, _hold) = silent_endpoint().await;

        let peer_name = EntityName::new(EntityKind::Store, 2);
        let outbound = a.registry.connect_to(silent_addr, peer_name).await;
        wait_for_state(&outbound, ConnState::Connecting).await;
        let our_gseq = outbound.shared.core.lock().await.global_seq;

        // The same peer dials us with a higher attempt counter.
        let mut peer = RawPeer::dial(a.addr, peer_name).await;
        peer.banner().await;
        peer.auth_open().await;
        let ident = peer.client_ident(our_gseq + 10, 4242, a.addr);
        peer.send(FrameType::ClientIdent, &ident).await;
        assert_eq!(peer.recv().await.typ, FrameType::ServerIdent);

        // The surviving instance is the original outbound object, now
        // carrying the accepted attempt's state.
        wait_for_state(&outbound, ConnState::Ready).await;
        {
            let core = outbound.shared.core.lock().await;
            assert_eq!(core.peer_global_seq, our_gseq + 10);
            assert_eq!(core.client_cookie, 4242);
        }
        assert!(a
            .registry
            .lookup(&peer_name)
            .await
            .unwrap()
            .same_as(&outbound));
    }

    #[tokio::test]
    async fn test_equal_seq_tie_break_instructs_wait() {
        let a = spawn_node(EntityKind::Store, 1).await;
        let (silent_addr, _hold) = silent_endpoint().await;

        let peer_name = EntityName::new(EntityKind::Store, 2);
        let outbound = a.registry.connect_to(silent_addr, peer_name).await;
        wait_for_state(&outbound, ConnState::Connecting).await;
        let our_gseq = outbound.shared.core.lock().await.global_seq;

        // Equal counters: store.2 does not sort below store.1, so the
        // inbound attempt loses deterministically.
        let mut peer = RawPeer::dial(a.addr, peer_name).await;
        peer.banner().await;
        peer.auth_open().await;
        let ident = peer.client_ident(our_gseq, 4242, a.addr);
        peer.send(FrameType::ClientIdent, &ident).await;
        assert_eq!(peer.recv().await.typ, FrameType::Wait);
    }

    #[tokio::test]
    async fn test_simultaneous_dial_converges_to_single_session() {
        let a = spawn_node(EntityKind::Store, 1).await;
        let b = spawn_node(EntityKind::Store, 2).await;

        let (_ca, _cb) = tokio::join!(
            a.registry.connect_to(b.addr, b.name()),
            b.registry.connect_to(a.addr, a.name())
        );

        timeout(Duration::from_secs(10), async {
            loop {
                let a_conn = a.registry.lookup(&b.name()).await;
                let b_conn = b.registry.lookup(&a.name()).await;
                if let (Some(a_conn), Some(b_conn)) = (a_conn, b_conn) {
                    if a_conn.state().await == ConnState::Ready
                        && b_conn.state().await == ConnState::Ready
                    {
                        let (ac, as_, _) = session_tuple(&a_conn).await;
                        let (bc, bs, _) = session_tuple(&b_conn).await;
                        if ac == bc && as_ == bs && as_ != 0 {
                            return;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("simultaneous dials never converged");
    }

    #[tokio::test]
    async fn test_do_close_is_reentrant() {
        let a = spawn_node(EntityKind::Store, 1).await;
        let b = spawn_node(EntityKind::Store, 2).await;

        let conn = a.registry.connect_to(b.addr, b.name()).await;
        wait_for_state(&conn, ConnState::Ready).await;

        tokio::join!(conn.do_close(false), conn.do_close(false));
        timeout(Duration::from_secs(5), conn.wait_closed())
            .await
            .expect("close deadlocked");

        assert!(conn.is_closed().await);
        assert!(conn.is_closed_clean().await);
        assert_eq!(conn.state().await, ConnState::Closing);
        assert!(a.registry.lookup(&b.name()).await.is_none());

        // A later faulted close must not rewrite the clean verdict.
        conn.do_close(true).await;
        assert!(conn.is_closed_clean().await);
    }

    #[tokio::test]
    async fn test_stale_fault_is_ignored() {
        let a = spawn_node(EntityKind::Store, 1).await;
        let b = spawn_node(EntityKind::Store, 2).await;

        let conn = a.registry.connect_to(b.addr, b.name()).await;
        wait_for_state(&conn, ConnState::Ready).await;

        // A step that was superseded long ago reports its failure.
        conn.fault(
            ConnState::Connecting,
            "late_step",
            ProtoError::Timeout("client_connect"),
        )
        .await;
        assert_eq!(conn.state().await, ConnState::Ready);
        assert!(!conn.is_closed().await);
    }
}
