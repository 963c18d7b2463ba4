// THEORY:
// A general-purpose OS scheduler wakes sleepers late, typically by one to a
// few milliseconds. Valve pulses and bus cycles need better than that, so all
// precise waits in this crate are hybrid:
//
// 1.  **Coarse phase**: sleep (thread or async) until `spin_window` before the
//     deadline. This costs no CPU and absorbs the scheduler's wake-up slack.
// 2.  **Spin phase**: poll a monotonic clock until the deadline passes. The
//     async variant yields between polls so it stays cooperative.
//
// This is soft real time: best-effort sub-millisecond jitter, not a guarantee.
// `WaitStrategy` is the seam where a platform with a real-time scheduler can
// drop in something stronger.
//
// `CancelToken` is the cancellation handle every timed task carries.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub const DEFAULT_SPIN_WINDOW: Duration = Duration::from_millis(15);

/// Monotonic clock plus a precise blocking wait.
pub trait WaitStrategy: Send + Sync + 'static {
    /// How long before a deadline the coarse sleep hands over to spinning.
    fn spin_window(&self) -> Duration;

    fn now(&self) -> Instant {
        Instant::now()
    }

    /// Blocks the calling thread until `deadline`.
    fn block_until(&self, deadline: Instant) {
        let now = self.now();
        if deadline <= now {
            return;
        }
        let remaining = deadline - now;
        if remaining > self.spin_window() {
            std::thread::sleep(remaining - self.spin_window());
        }
        while self.now() < deadline {
            std::hint::spin_loop();
        }
    }
}

/// Coarse sleep followed by a spin of `spin_window`.
#[derive(Debug, Clone, Copy)]
pub struct HybridWait {
    spin_window: Duration,
}

impl HybridWait {
    pub fn new(spin_window: Duration) -> Self {
        Self { spin_window }
    }
}

impl Default for HybridWait {
    fn default() -> Self {
        Self::new(DEFAULT_SPIN_WINDOW)
    }
}

impl WaitStrategy for HybridWait {
    fn spin_window(&self) -> Duration {
        self.spin_window
    }
}

/// Shared, clonable cancellation flag that can also be awaited.
#[derive(Debug, Clone)]
pub struct CancelToken {
    state: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        let mut receiver = self.state.subscribe();
        // The sender lives in `self`, so this can only end by observing `true`.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Async hybrid wait. Returns `true` when the deadline was reached and `false`
/// when `cancel` fired first.
pub async fn wait_until<W: WaitStrategy + ?Sized>(strategy: &W, deadline: Instant, cancel: &CancelToken) -> bool {
    if let Some(coarse) = deadline.checked_sub(strategy.spin_window()) {
        if coarse > strategy.now() {
            tokio::select! {
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(coarse)) => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        if strategy.now() >= deadline {
            return true;
        }
        tokio::task::yield_now().await;
    }
}
