//! The version signal: the whole synchronization story between topic events and the
//! dispatch worker.
//!
//! A monotonic counter plus a condition-variable-style wait. `bump()` increments the
//! counter and wakes every waiter under the same lock that `wait_for_update` re-checks,
//! so no wakeup can be lost between a waiter's check and the moment it actually starts
//! waiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// Upper bound on how long the dispatch worker will idle between iterations when
/// nothing else wakes it.
pub const DEFAULT_WAIT_MAX: Duration = Duration::from_secs(5);

pub struct VersionSignal {
    counter: AtomicU64,
    notify: Notify,
    wait_max: Duration,
}

impl VersionSignal {
    pub fn new(wait_max: Duration) -> Self {
        Self {
            counter: AtomicU64::new(0),
            notify: Notify::new(),
            wait_max,
        }
    }

    /// The counter value as of this call. Intended to be captured at the top of a
    /// dispatch iteration and passed back into [`Self::wait_for_update`].
    pub fn seen(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Atomically increments the counter and wakes all current waiters.
    pub fn bump(&self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Returns immediately if the counter has moved past `seen` or `had_pending_work`
    /// is set; otherwise blocks for at most `wait_max` or until the next [`Self::bump`].
    pub async fn wait_for_update(&self, seen: u64, had_pending_work: bool) {
        if had_pending_work || self.counter.load(Ordering::SeqCst) != seen {
            return;
        }

        // `notified()` registers interest before we re-check the counter, so a bump
        // landing between the check above and this call is still observed: Notify
        // buffers a single permit for a notification that arrives before `.await`.
        let notified = self.notify.notified();
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(self.wait_max) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn wait_returns_immediately_when_pending_work() {
        let signal = VersionSignal::new(Duration::from_secs(5));
        let seen = signal.seen();
        let start = tokio::time::Instant::now();
        signal.wait_for_update(seen, true).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_bumped() {
        let signal = VersionSignal::new(Duration::from_secs(5));
        let seen = signal.seen();
        signal.bump();
        let start = tokio::time::Instant::now();
        signal.wait_for_update(seen, false).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_blocks_until_bump() {
        let signal = Arc::new(VersionSignal::new(Duration::from_secs(5)));
        let seen = signal.seen();

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move {
                signal.wait_for_update(seen, false).await;
                signal.seen()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.bump();

        let observed = waiter.await.unwrap();
        assert_eq!(observed, seen + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_self_corrects_after_wait_max() {
        let signal = VersionSignal::new(Duration::from_millis(100));
        let seen = signal.seen();

        let start = tokio::time::Instant::now();
        signal.wait_for_update(seen, false).await;
        assert!(tokio::time::Instant::now() - start >= Duration::from_millis(100));
    }
}
