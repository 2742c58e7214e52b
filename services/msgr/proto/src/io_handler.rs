//! The seam between the protocol state machine and the data-plane.
//!
//! Two narrow capability interfaces, one per direction:
//! [`ConnectionHandler`] lets the state machine drive the data-plane's
//! operating mode, and [`HandshakeListener`] lets the data-plane report
//! back (pending work, fatal faults, close requests). [`QueueHandler`] is
//! the concrete data-plane used by the node binary and the tests: an
//! in-memory out queue with replay, cumulative acks and keepalive.

use crate::error::ProtoError;
use crate::transport::SharedTransport;
use bytes::Bytes;
use msgr_wire::{
    from_frame, to_frame, AckPayload, DataPayload, FrameType, KeepalivePayload, ResetPayload,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// Data-plane operating mode driven by state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    /// Socket not owned by the data-plane
    None,
    /// Session is READY, the data-plane may send and receive
    Full,
    /// Session intact but paused: buffer outbound, touch no socket
    Delay,
}

/// One-shot broadcast completion signal; every waiter clone resolves once
/// the paired [`ExitGuard`] is released.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    rx: watch::Receiver<bool>,
}

/// Held by the data-plane while it co-owns the socket; releasing (or
/// dropping) it resolves every [`ExitSignal`] waiter.
#[derive(Debug)]
pub struct ExitGuard {
    tx: watch::Sender<bool>,
}

/// Create a paired exit signal and guard
pub fn exit_pair() -> (ExitSignal, ExitGuard) {
    let (tx, rx) = watch::channel(false);
    (ExitSignal { rx }, ExitGuard { tx })
}

impl ExitSignal {
    /// Wait until the paired guard has been released
    pub async fn wait(mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.tx.send_replace(true);
    }
}

/// Capability interface the protocol drives the data-plane through
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Wire up the reverse notification path
    fn set_handshake_listener(&self, listener: Arc<dyn HandshakeListener>);

    /// Switch the operating mode. `Full` hands over the transport together
    /// with an exit guard the handler releases once it stops touching it.
    fn set_io_state(
        &self,
        state: IoState,
        transport: Option<SharedTransport>,
        exit: Option<ExitGuard>,
    );

    /// Discard (full) or rewind (partial) per-session delivery state
    fn reset_session(&self, full: bool);

    /// Drop messages the peer has delivered and requeue the rest
    fn requeue_from(&self, acked_seq: u64);

    /// Highest inbound message seq delivered so far
    fn in_seq(&self) -> u64;

    /// Highest outbound message seq assigned so far
    fn out_seq(&self) -> u64;

    /// Whether undelivered outbound work is queued
    fn has_out_pending(&self) -> bool;

    /// Stop the data-plane permanently
    fn close(&self);
}

/// Capability interface the data-plane notifies the protocol through
pub trait HandshakeListener: Send + Sync + 'static {
    /// Outbound work became pending; wakes a standby connection
    fn notify_out(&self);

    /// The data-plane hit a fatal fault on the socket
    fn notify_out_fault(&self, where_: &'static str, error: ProtoError);

    /// The owner or peer asked for this connection to be torn down
    fn notify_mark_down(&self);
}

/// A message delivered by the data-plane
#[derive(Debug, Clone)]
pub struct InboundData {
    /// Per-session message sequence
    pub seq: u64,
    /// Message body
    pub body: Bytes,
}

enum IoCmd {
    SetListener(Arc<dyn HandshakeListener>),
    SetIo {
        state: IoState,
        transport: Option<SharedTransport>,
        exit: Option<ExitGuard>,
    },
    Queue {
        body: Bytes,
    },
    ResetSession {
        full: bool,
    },
    Requeue {
        acked: u64,
    },
    Close,
}

struct HandlerShared {
    cmd_tx: mpsc::UnboundedSender<IoCmd>,
    out_seq: AtomicU64,
    in_seq: AtomicU64,
    out_pending: AtomicBool,
}

/// In-memory queueing data-plane with replay and keepalive
pub struct QueueHandler {
    shared: Arc<HandlerShared>,
}

impl QueueHandler {
    /// Spawn the handler's worker; returns the handler and the stream of
    /// delivered messages
    pub fn new(keepalive_interval: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundData>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(HandlerShared {
            cmd_tx,
            out_seq: AtomicU64::new(0),
            in_seq: AtomicU64::new(0),
            out_pending: AtomicBool::new(false),
        });

        let worker = Worker {
            cmd_rx,
            core: IoCore {
                shared: shared.clone(),
                delivery_tx,
                listener: None,
                io_state: IoState::None,
                transport: None,
                exit_guard: None,
                pending: VecDeque::new(),
                sent: VecDeque::new(),
            },
            keepalive_interval,
        };
        tokio::spawn(worker.run());

        (Arc::new(Self { shared }), delivery_rx)
    }

    /// Queue an application message for the peer
    pub fn queue_message(&self, body: Bytes) {
        let _ = self.shared.cmd_tx.send(IoCmd::Queue { body });
    }
}

impl ConnectionHandler for QueueHandler {
    fn set_handshake_listener(&self, listener: Arc<dyn HandshakeListener>) {
        let _ = self.shared.cmd_tx.send(IoCmd::SetListener(listener));
    }

    fn set_io_state(
        &self,
        state: IoState,
        transport: Option<SharedTransport>,
        exit: Option<ExitGuard>,
    ) {
        let _ = self.shared.cmd_tx.send(IoCmd::SetIo {
            state,
            transport,
            exit,
        });
    }

    fn reset_session(&self, full: bool) {
        let _ = self.shared.cmd_tx.send(IoCmd::ResetSession { full });
    }

    fn requeue_from(&self, acked_seq: u64) {
        let _ = self.shared.cmd_tx.send(IoCmd::Requeue { acked: acked_seq });
    }

    fn in_seq(&self) -> u64 {
        self.shared.in_seq.load(Ordering::Acquire)
    }

    fn out_seq(&self) -> u64 {
        self.shared.out_seq.load(Ordering::Acquire)
    }

    fn has_out_pending(&self) -> bool {
        self.shared.out_pending.load(Ordering::Acquire)
    }

    fn close(&self) {
        let _ = self.shared.cmd_tx.send(IoCmd::Close);
    }
}

struct Worker {
    cmd_rx: mpsc::UnboundedReceiver<IoCmd>,
    core: IoCore,
    keepalive_interval: Duration,
}

struct IoCore {
    shared: Arc<HandlerShared>,
    delivery_tx: mpsc::UnboundedSender<InboundData>,
    listener: Option<Arc<dyn HandshakeListener>>,
    io_state: IoState,
    transport: Option<SharedTransport>,
    exit_guard: Option<ExitGuard>,
    pending: VecDeque<(u64, Bytes)>,
    sent: VecDeque<(u64, Bytes)>,
}

impl Worker {
    async fn run(self) {
        // Command stream and io state live in separate locals so the
        // select arms borrow disjoint pieces.
        let Worker {
            mut cmd_rx,
            mut core,
            keepalive_interval,
        } = self;
        // First probe fires one full interval after startup, not at once.
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + keepalive_interval,
            keepalive_interval,
        );
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let readable = core.io_state == IoState::Full && core.transport.is_some();
            let transport = core.transport.clone();

            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(IoCmd::Close) | None => break,
                        Some(cmd) => core.handle_cmd(cmd).await,
                    }
                }

                _ = keepalive.tick(), if readable => {
                    core.send_keepalive().await;
                }

                result = async {
                    match transport {
                        Some(t) => {
                            let mut guard = t.lock().await;
                            guard.recv_frame().await
                        }
                        None => std::future::pending().await,
                    }
                }, if readable => {
                    match result {
                        Ok(frame) => core.handle_frame(frame).await,
                        Err(e) => core.io_fault("io_read", e),
                    }
                }
            }
        }

        // Worker exit releases the socket and the exit guard.
        core.transport = None;
        core.exit_guard = None;
        core.listener = None;
    }
}

impl IoCore {
    async fn handle_cmd(&mut self, cmd: IoCmd) {
        match cmd {
            IoCmd::SetListener(listener) => {
                self.listener = Some(listener);
            }
            IoCmd::SetIo {
                state,
                transport,
                exit,
            } => {
                trace!(?state, "data-plane io state");
                self.io_state = state;
                match state {
                    IoState::Full => {
                        self.transport = transport;
                        self.exit_guard = exit;
                        self.flush().await;
                    }
                    IoState::Delay | IoState::None => {
                        self.transport = None;
                        self.exit_guard = None;
                    }
                }
            }
            IoCmd::Queue { body } => {
                let seq = self.shared.out_seq.fetch_add(1, Ordering::AcqRel) + 1;
                self.pending.push_back((seq, body));
                self.sync_out_pending();
                if self.io_state == IoState::Full {
                    self.flush().await;
                } else if let Some(listener) = &self.listener {
                    listener.notify_out();
                }
            }
            IoCmd::ResetSession { full } => {
                if full {
                    debug!("data-plane session reset, dropping queues");
                    self.pending.clear();
                    self.sent.clear();
                    self.shared.out_seq.store(0, Ordering::Release);
                    self.shared.in_seq.store(0, Ordering::Release);
                    self.sync_out_pending();
                } else {
                    self.requeue(0);
                }
            }
            IoCmd::Requeue { acked } => {
                self.requeue(acked);
            }
            IoCmd::Close => unreachable!("handled by the run loop"),
        }
    }

    /// Drop everything the peer acknowledged and put the rest back in
    /// front of the pending queue, in order.
    fn requeue(&mut self, acked: u64) {
        while matches!(self.sent.front(), Some((seq, _)) if *seq <= acked) {
            self.sent.pop_front();
        }
        debug!(
            acked,
            requeued = self.sent.len(),
            "requeue after session resume"
        );
        for entry in self.sent.drain(..).rev() {
            self.pending.push_front(entry);
        }
        self.sync_out_pending();
    }

    fn sync_out_pending(&self) {
        let pending = !self.pending.is_empty() || !self.sent.is_empty();
        self.shared.out_pending.store(pending, Ordering::Release);
    }

    async fn flush(&mut self) {
        while let Some((seq, body)) = self.pending.pop_front() {
            let frame = match to_frame(
                FrameType::Data,
                &DataPayload {
                    seq,
                    body: body.clone(),
                },
            ) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(seq, "dropping unencodable message: {}", e);
                    continue;
                }
            };
            match self.send(&frame).await {
                Ok(()) => self.sent.push_back((seq, body)),
                Err(e) => {
                    self.pending.push_front((seq, body));
                    self.io_fault("io_write", e);
                    return;
                }
            }
        }
        self.sync_out_pending();
    }

    async fn send(&mut self, frame: &msgr_wire::Frame) -> Result<(), ProtoError> {
        match &self.transport {
            Some(t) => {
                let mut guard = t.lock().await;
                guard.send_frame(frame).await
            }
            None => Err(ProtoError::Closed),
        }
    }

    async fn send_keepalive(&mut self) {
        let frame = match to_frame(
            FrameType::Keepalive,
            &KeepalivePayload {
                stamp_micros: now_micros(),
            },
        ) {
            Ok(frame) => frame,
            Err(_) => return,
        };
        if let Err(e) = self.send(&frame).await {
            self.io_fault("keepalive", e);
        }
    }

    async fn handle_frame(&mut self, frame: msgr_wire::Frame) {
        match frame.typ {
            FrameType::Data => {
                let data: DataPayload = match from_frame(&frame) {
                    Ok(data) => data,
                    Err(e) => {
                        self.io_fault("data_decode", e.into());
                        return;
                    }
                };
                let in_seq = self.shared.in_seq.load(Ordering::Acquire);
                if data.seq > in_seq {
                    self.shared.in_seq.store(data.seq, Ordering::Release);
                    let _ = self.delivery_tx.send(InboundData {
                        seq: data.seq,
                        body: data.body,
                    });
                } else {
                    trace!(seq = data.seq, in_seq, "dropped duplicate message");
                }
                // Cumulative ack, also re-acks duplicates after a resume.
                let ack_seq = self.shared.in_seq.load(Ordering::Acquire);
                if let Ok(ack) = to_frame(FrameType::Ack, &AckPayload { seq: ack_seq }) {
                    if let Err(e) = self.send(&ack).await {
                        self.io_fault("io_write", e);
                    }
                }
            }
            FrameType::Ack => {
                if let Ok(ack) = from_frame::<AckPayload>(&frame) {
                    while matches!(self.sent.front(), Some((seq, _)) if *seq <= ack.seq) {
                        self.sent.pop_front();
                    }
                    self.sync_out_pending();
                }
            }
            FrameType::Keepalive => {
                if let Ok(probe) = from_frame::<KeepalivePayload>(&frame) {
                    if let Ok(echo) = to_frame(FrameType::KeepaliveAck, &probe) {
                        if let Err(e) = self.send(&echo).await {
                            self.io_fault("keepalive_ack", e);
                        }
                    }
                }
            }
            FrameType::KeepaliveAck => {
                if let Ok(echo) = from_frame::<KeepalivePayload>(&frame) {
                    let rtt_micros = now_micros().saturating_sub(echo.stamp_micros);
                    trace!(rtt_micros, "keepalive rtt");
                }
            }
            FrameType::Reset => {
                // Mid-session reset from the peer goes through the fault
                // funnel, not through local recovery.
                let full = from_frame::<ResetPayload>(&frame).map_or(true, |r| r.full);
                self.io_fault("session_reset", ProtoError::ResetByPeer(full));
            }
            other => {
                debug!(typ = %other, "ignoring frame outside the data-plane");
            }
        }
    }

    fn io_fault(&mut self, where_: &'static str, error: ProtoError) {
        warn!("data-plane fault at {}: {}", where_, error);
        self.transport = None;
        self.exit_guard = None;
        self.io_state = IoState::None;
        if let Some(listener) = &self.listener {
            listener.notify_out_fault(where_, error);
        }
    }
}

fn now_micros() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FrameTransport;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn transport_pair() -> (FrameTransport, FrameTransport) {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            FrameTransport::new(socket).unwrap()
        });
        let client = FrameTransport::connect(bound).await.unwrap();
        (client, accept.await.unwrap())
    }

    #[tokio::test]
    async fn test_exit_signal_resolves_all_waiters() {
        let (signal, guard) = exit_pair();
        let first = signal.clone();
        let second = signal;

        let waiters = tokio::spawn(async move {
            tokio::join!(first.wait(), second.wait());
        });

        drop(guard);
        timeout(Duration::from_secs(1), waiters)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_queued_messages_flush_when_full() {
        let (handler, _delivered) = QueueHandler::new(Duration::from_secs(60));
        let (local, mut remote) = transport_pair().await;

        // Queued before the socket exists, so it must buffer.
        handler.queue_message(Bytes::from_static(b"early"));
        let (_signal, guard) = exit_pair();
        handler.set_io_state(IoState::Full, Some(local.into_shared()), Some(guard));

        let frame = timeout(Duration::from_secs(2), remote.recv_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.typ, FrameType::Data);
        let data: DataPayload = from_frame(&frame).unwrap();
        assert_eq!(data.seq, 1);
        assert_eq!(data.body, Bytes::from_static(b"early"));
    }

    #[tokio::test]
    async fn test_duplicate_data_delivered_once_and_reacked() {
        let (handler, mut delivered) = QueueHandler::new(Duration::from_secs(60));
        let (local, mut remote) = transport_pair().await;
        let (_signal, guard) = exit_pair();
        handler.set_io_state(IoState::Full, Some(local.into_shared()), Some(guard));

        let data = to_frame(
            FrameType::Data,
            &DataPayload {
                seq: 1,
                body: Bytes::from_static(b"dup"),
            },
        )
        .unwrap();
        remote.send_frame(&data).await.unwrap();
        remote.send_frame(&data).await.unwrap();

        let first = timeout(Duration::from_secs(2), delivered.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.seq, 1);
        assert!(timeout(Duration::from_millis(100), delivered.recv())
            .await
            .is_err());

        // Both copies are acked at the delivered watermark.
        for _ in 0..2 {
            let ack = timeout(Duration::from_secs(2), remote.recv_frame())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(ack.typ, FrameType::Ack);
            assert_eq!(from_frame::<AckPayload>(&ack).unwrap().seq, 1);
        }
    }

    #[tokio::test]
    async fn test_requeue_drops_acked_messages() {
        let (handler, _delivered) = QueueHandler::new(Duration::from_secs(60));
        let (local, mut remote) = transport_pair().await;
        let (_signal, guard) = exit_pair();
        handler.set_io_state(IoState::Full, Some(local.into_shared()), Some(guard));

        handler.queue_message(Bytes::from_static(b"one"));
        handler.queue_message(Bytes::from_static(b"two"));
        for _ in 0..2 {
            timeout(Duration::from_secs(2), remote.recv_frame())
                .await
                .unwrap()
                .unwrap();
        }

        // Peer delivered seq 1 only; detach, requeue, reattach elsewhere.
        handler.set_io_state(IoState::None, None, None);
        handler.requeue_from(1);

        let (local2, mut remote2) = transport_pair().await;
        let (_signal2, guard2) = exit_pair();
        handler.set_io_state(IoState::Full, Some(local2.into_shared()), Some(guard2));

        let frame = timeout(Duration::from_secs(2), remote2.recv_frame())
            .await
            .unwrap()
            .unwrap();
        let data: DataPayload = from_frame(&frame).unwrap();
        assert_eq!(data.seq, 2);
        assert_eq!(data.body, Bytes::from_static(b"two"));
    }
}
