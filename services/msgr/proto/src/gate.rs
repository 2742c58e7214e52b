//! Gated execution of background protocol steps.
//!
//! Each connection runs at most one protocol step at a time. Dispatching a
//! new step cancels the previous one's token and, if that step has not yet
//! finished, detaches it into a drain task instead of awaiting it inline.
//! A superseded step's result is discarded, never inspected.
//!
//! The gate also counts in-flight steps so shutdown can wait for
//! quiescence.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Tracks in-flight background steps for one connection
#[derive(Debug, Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

#[derive(Debug)]
struct GateInner {
    ops: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
    last: Mutex<Option<LastOp>>,
}

#[derive(Debug)]
struct LastOp {
    what: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Gate {
    /// Create an open gate
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GateInner {
                ops: AtomicUsize::new(0),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
                last: Mutex::new(None),
            }),
        }
    }

    /// Whether the gate has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Dispatch a background step, superseding the previous one.
    ///
    /// The closure receives the step's cancellation token; the token fires
    /// when a newer step or a close supersedes this one, at which point the
    /// step's future is dropped.
    pub fn dispatch<F, Fut>(&self, what: &'static str, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            trace!("gate closed, {} not dispatched", what);
            return;
        }

        let token = CancellationToken::new();
        let fut = f(token.clone());

        self.inner.ops.fetch_add(1, Ordering::AcqRel);
        let inner = self.inner.clone();
        let run_token = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = run_token.cancelled() => {
                    trace!("{} superseded", what);
                }
                _ = fut => {}
            }
            if inner.ops.fetch_sub(1, Ordering::AcqRel) == 1 {
                inner.idle.notify_waiters();
            }
        });

        self.supersede_with(Some(LastOp {
            what,
            cancel: token,
            handle,
        }));
    }

    /// Cancel the current step without dispatching a replacement
    pub fn supersede(&self) {
        self.supersede_with(None);
    }

    fn supersede_with(&self, next: Option<LastOp>) {
        let mut last = self.inner.last.lock().unwrap();
        if let Some(prev) = last.take() {
            prev.cancel.cancel();
            if !prev.handle.is_finished() {
                trace!("{} detached into drain", prev.what);
                tokio::spawn(async move {
                    let _ = prev.handle.await;
                });
            }
        }
        *last = next;
    }

    /// Close the gate: cancel the current step and wait until every
    /// in-flight step has drained.
    ///
    /// Must not be awaited from inside a gated step; teardown runs it from
    /// a detached task.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.supersede();
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.ops.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_dispatch_runs_step() {
        let gate = Gate::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        gate.dispatch("step", move |_token| async move {
            tx.send(42u32).unwrap();
        });

        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got, Some(42));
    }

    #[tokio::test]
    async fn test_new_dispatch_supersedes_previous() {
        let gate = Gate::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let stale_tx = tx.clone();
        gate.dispatch("stale", move |_token| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            stale_tx.send("stale").unwrap();
        });

        gate.dispatch("fresh", move |_token| async move {
            tx.send("fresh").unwrap();
        });

        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got, Some("fresh"));
        // The stale step was dropped mid-sleep: its sender closes without
        // ever sending.
        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_close_waits_for_quiescence() {
        let gate = Gate::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        gate.dispatch("quick", move |token| async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
            tx.send(()).unwrap();
        });

        timeout(Duration::from_secs(1), gate.close()).await.unwrap();
        assert!(gate.is_closed());
        // Step either finished or was cancelled, but nothing is in flight.
        let _ = rx.try_recv();
    }

    #[tokio::test]
    async fn test_closed_gate_rejects_dispatch() {
        let gate = Gate::new();
        gate.close().await;

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        gate.dispatch("late", move |_token| async move {
            tx.send(()).unwrap();
        });
        // The step never ran: the closure was dropped unexecuted.
        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got, None);
    }
}
