//! The expiration task: periodic housekeeping that removes expired messages.
//!
//! Modeled as the spec's tagged-variant state `{active(interval), cancelled}`: a
//! runtime-adjustable period plus a cancel flag the external scheduler is expected to
//! honour by dropping the task once set.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dispatch_common::health::HealthHandle;
use dispatch_common::model::RemoveReason;
use dispatch_common::store::Store;
use dispatch_common::{metrics_consts as m, EngineConfig};
use tracing::error;

pub struct ExpirationTask {
    store: Arc<dyn Store>,
    interval_ms: AtomicU64,
    cancelled: AtomicBool,
    liveness: HealthHandle,
}

impl ExpirationTask {
    pub fn new(store: Arc<dyn Store>, config: &EngineConfig, liveness: HealthHandle) -> Self {
        Self {
            store,
            interval_ms: AtomicU64::new(config.clean_interval.0.as_millis() as u64),
            cancelled: AtomicBool::new(false),
            liveness,
        }
    }

    /// The period the external scheduler should use for the next firing.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::SeqCst))
    }

    /// Updates the period for subsequent firings. Non-positive values are ignored by
    /// the caller (see `Manager::set_expiration_interval`); this setter itself just
    /// stores whatever it is given.
    pub fn set_interval(&self, interval: Duration) {
        self.interval_ms
            .store(interval.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Runs the task's own scheduling loop until cancelled. In a deployment where an
    /// external scheduler owns timing, that scheduler would call [`Self::run_once`]
    /// directly instead of this loop.
    pub async fn run(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            tokio::time::sleep(self.interval()).await;
            if self.is_cancelled() {
                return;
            }
            self.run_once().await;
            self.liveness.report_healthy().await;
        }
    }

    /// One firing: fetch expired messages and remove them. Errors are swallowed —
    /// the next tick retries. Running this twice in a row with nothing new expired
    /// is a no-op the second time (idempotent).
    pub async fn run_once(&self) {
        if self.is_cancelled() {
            return;
        }

        let expired = match self.store.get_expired_messages().await {
            Ok(expired) => expired,
            Err(e) => {
                error!("expiration task: failed to list expired messages: {e}");
                return;
            }
        };

        if expired.is_empty() {
            return;
        }

        let ids: Vec<_> = expired.into_iter().map(|m| m.id).collect();
        let count = ids.len();
        match self
            .store
            .remove_messages(&ids, RemoveReason::Expired)
            .await
        {
            Ok(()) => {
                metrics::counter!(m::EXPIRED_PER_SECOND).increment(count as u64);
            }
            Err(e) => error!("expiration task: failed to remove expired messages: {e}"),
        }
    }
}
