//! Single-slot backoff timer for WAIT-style retries.
//!
//! Each connection owns exactly one timer slot. Arming it cancels any
//! pending backoff, so a re-entered WAIT with a shorter delay never sees
//! the previous expiry fire.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Exponential backoff with a cancellable single pending slot
#[derive(Debug)]
pub struct BackoffTimer {
    last_dur: Duration,
    abort: Option<CancellationToken>,
    initial: Duration,
    multiplier: f64,
    max: Duration,
}

impl BackoffTimer {
    /// Create a timer with the given growth policy
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            last_dur: Duration::ZERO,
            abort: None,
            initial,
            multiplier,
            max,
        }
    }

    /// Arm the slot, cancelling any pending backoff, and return the delay
    /// plus the token that aborts it.
    ///
    /// `max_backoff` jumps straight to the cap (used when the peer
    /// explicitly instructed a wait).
    pub fn arm(&mut self, max_backoff: bool) -> (Duration, CancellationToken) {
        if let Some(prev) = self.abort.take() {
            prev.cancel();
        }

        let next = if max_backoff {
            self.max
        } else if self.last_dur.is_zero() {
            self.initial
        } else {
            self.max
                .min(Duration::from_secs_f64(self.last_dur.as_secs_f64() * self.multiplier))
        };
        self.last_dur = next;

        let token = CancellationToken::new();
        self.abort = Some(token.clone());
        trace!(backoff = ?next, "armed backoff timer");
        (next, token)
    }

    /// Cancel any pending backoff and reset the growth curve
    pub fn cancel(&mut self) {
        self.last_dur = Duration::ZERO;
        if let Some(token) = self.abort.take() {
            token.cancel();
        }
    }
}

/// Sleep for `dur` unless aborted first; returns whether the delay elapsed
pub async fn backoff_sleep(dur: Duration, abort: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => true,
        _ = abort.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_growth_doubles_to_cap() {
        let mut timer = BackoffTimer::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(350),
        );

        let (first, _) = timer.arm(false);
        assert_eq!(first, Duration::from_millis(100));
        let (second, _) = timer.arm(false);
        assert_eq!(second, Duration::from_millis(200));
        let (third, _) = timer.arm(false);
        assert_eq!(third, Duration::from_millis(350));
        let (fourth, _) = timer.arm(false);
        assert_eq!(fourth, Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_backoff_jumps_to_cap() {
        let mut timer =
            BackoffTimer::new(Duration::from_millis(100), 2.0, Duration::from_secs(5));
        let (dur, _) = timer.arm(true);
        assert_eq!(dur, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_cancels_previous() {
        let mut timer =
            BackoffTimer::new(Duration::from_secs(1), 2.0, Duration::from_secs(60));

        let (first_dur, first_token) = timer.arm(false);
        let first_sleep = tokio::spawn(async move { backoff_sleep(first_dur, &first_token).await });

        // Re-arming aborts the pending slot; the old expiry never fires.
        let (_dur, _token) = timer.arm(false);
        assert!(!first_sleep.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_resets_growth() {
        let mut timer =
            BackoffTimer::new(Duration::from_millis(100), 2.0, Duration::from_secs(60));
        timer.arm(false);
        timer.arm(false);
        timer.cancel();
        let (dur, _) = timer.arm(false);
        assert_eq!(dur, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_elapses_without_abort() {
        let token = CancellationToken::new();
        assert!(backoff_sleep(Duration::from_millis(10), &token).await);
    }
}
