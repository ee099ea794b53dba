//! Monotonic time and cancellable periodic ticking (spec.md section 2, "Clock/Scheduler
//! primitives").
//!
//! The agent never reads the wall clock for interval math -- only for timestamps attached
//! to emitted metrics/events, where Unix-epoch seconds are what the backend expects.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::time::interval as tokio_interval;

/// Current time as Unix-epoch seconds, for timestamps attached to samples.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// A cancellation token shared between an object and its collector tasks. Cloning shares
/// the same underlying signal; `cancel()` wakes every cloned waiter.
#[derive(Clone)]
pub struct CancelToken {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        CancelToken { tx, rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves as soon as `cancel()` is called. Used as the unblocking suspension point
    /// for collector sleeps and pipeline reads (spec.md section 5, "Cancellation").
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    /// Sleep for `dur`, waking early if cancelled. Returns `true` if the sleep completed
    /// normally, `false` if it was cut short by cancellation.
    pub async fn sleep(&self, dur: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(dur) => true,
            _ = self.cancelled() => false,
        }
    }
}

/// A periodic ticker bound to a `CancelToken`. Wraps `tokio::time::interval` so collector
/// and manager run loops share one implementation of "while running, tick, else exit".
pub struct Ticker {
    interval: tokio::time::Interval,
    cancel: CancelToken,
}

impl Ticker {
    pub fn new(period: Duration, cancel: CancelToken) -> Self {
        let mut interval = tokio_interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Ticker { interval, cancel }
    }

    /// Waits for the next tick, or returns `None` if cancelled first.
    pub async fn tick(&mut self) -> Option<Instant> {
        tokio::select! {
            i = self.interval.tick() => Some(i),
            _ = self.cancel.cancelled() => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_sleep_early() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.sleep(Duration::from_secs(60)).await });
        token.cancel();
        let completed_normally = handle.await.unwrap();
        assert!(!completed_normally);
    }

    #[tokio::test]
    async fn ticker_stops_after_cancel() {
        let token = CancelToken::new();
        let mut ticker = Ticker::new(Duration::from_millis(5), token.clone());
        assert!(ticker.tick().await.is_some());
        token.cancel();
        assert!(ticker.tick().await.is_none());
    }

    #[test]
    fn unix_timestamp_is_positive() {
        assert!(unix_timestamp() > 0);
    }
}
