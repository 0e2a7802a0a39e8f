//! Leading+trailing redraw throttle.
//!
//! Bursts of update requests (every live candle message wants a repaint)
//! coalesce into at most one paint per frame budget. This is not a fixed
//! interval timer: a lone request on a quiet chart fires immediately, and a
//! burst schedules exactly one trailing fire at the next paint opportunity.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

/// One frame at 60 Hz.
pub const FRAME_BUDGET: Duration = Duration::from_millis(16);

struct Inner {
    last_fire: Instant,
    deferred: Option<AbortHandle>,
    /// Bumped whenever the pending fire is superseded; a woken deferred task
    /// that finds a newer epoch abandons its fire.
    epoch: u64,
}

/// Coalescing redraw scheduler. Fires are `()` ticks on the channel returned
/// by [`FrameScheduler::new`]; the render loop drains them.
pub struct FrameScheduler {
    inner: Arc<Mutex<Inner>>,
    budget: Duration,
    tick_tx: mpsc::UnboundedSender<()>,
}

impl FrameScheduler {
    pub fn new(budget: Duration) -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            inner: Arc::new(Mutex::new(Inner {
                // treat construction as the first paint so an opening burst
                // coalesces into a single trailing fire
                last_fire: Instant::now(),
                deferred: None,
                epoch: 0,
            })),
            budget,
            tick_tx,
        };
        (scheduler, tick_rx)
    }

    pub fn with_frame_budget() -> (Self, mpsc::UnboundedReceiver<()>) {
        Self::new(FRAME_BUDGET)
    }

    /// Request a repaint.
    ///
    /// Fires immediately when a full budget has elapsed since the last fire,
    /// otherwise (re)arms the single deferred fire at `last_fire + budget`.
    pub fn request(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if now.duration_since(inner.last_fire) >= self.budget {
            if let Some(pending) = inner.deferred.take() {
                pending.abort();
            }
            inner.epoch += 1;
            inner.last_fire = now;
            let _ = self.tick_tx.send(());
            return;
        }

        if let Some(pending) = inner.deferred.take() {
            pending.abort();
        }
        inner.epoch += 1;
        let epoch = inner.epoch;
        let deadline = inner.last_fire + self.budget;

        let inner_arc = Arc::clone(&self.inner);
        let tick_tx = self.tick_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let mut inner = inner_arc.lock();
            if inner.epoch != epoch {
                // superseded while we slept
                return;
            }
            inner.deferred = None;
            inner.last_fire = Instant::now();
            let _ = tick_tx.send(());
        });
        inner.deferred = Some(task.abort_handle());
    }

    /// Cancel any pending deferred fire. Called on chart teardown; also runs
    /// on drop.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        if let Some(pending) = inner.deferred.take() {
            pending.abort();
            debug!("cancelled pending deferred frame");
        }
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, sleep};

    fn drain(rx: &mut mpsc::UnboundedReceiver<()>) -> usize {
        let mut fired = 0;
        while rx.try_recv().is_ok() {
            fired += 1;
        }
        fired
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_one_fire() {
        let (scheduler, mut ticks) = FrameScheduler::with_frame_budget();

        // 10 requests inside 5ms
        for _ in 0..10 {
            scheduler.request();
            advance(Duration::from_micros(500)).await;
        }
        assert_eq!(drain(&mut ticks), 0, "nothing may fire inside the budget");

        sleep(Duration::from_millis(30)).await;
        assert_eq!(drain(&mut ticks), 1, "burst must coalesce to one fire");
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_requests_fire_immediately() {
        let (scheduler, mut ticks) = FrameScheduler::with_frame_budget();

        sleep(Duration::from_millis(20)).await;
        scheduler.request();
        assert_eq!(drain(&mut ticks), 1);

        sleep(Duration::from_millis(20)).await;
        scheduler.request();
        assert_eq!(drain(&mut ticks), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leading_then_trailing() {
        let (scheduler, mut ticks) = FrameScheduler::with_frame_budget();

        sleep(Duration::from_millis(20)).await;
        scheduler.request();
        assert_eq!(drain(&mut ticks), 1, "quiet chart fires on the leading edge");

        // three more inside the same budget window collapse into the trailer
        for _ in 0..3 {
            advance(Duration::from_millis(2)).await;
            scheduler.request();
        }
        assert_eq!(drain(&mut ticks), 0);

        sleep(Duration::from_millis(30)).await;
        assert_eq!(drain(&mut ticks), 1, "exactly one trailing fire");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_fire() {
        let (scheduler, mut ticks) = FrameScheduler::with_frame_budget();

        scheduler.request();
        scheduler.cancel();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(drain(&mut ticks), 0);

        // the scheduler still works after a cancel
        scheduler.request();
        assert_eq!(drain(&mut ticks), 1);
    }
}
