//! The notification worker: a fixed-cadence loop, independent of the version signal,
//! that tells clients with pending deliveries to poll.

use std::sync::Arc;

use dispatch_common::health::HealthHandle;
use dispatch_common::model::{ClientEventType, PUBSUB_POLL_EVENT_CODE};
use dispatch_common::store::Store;
use dispatch_common::{metrics_consts as m, EngineConfig};
use tracing::{error, info};

/// Invoked once per notifiable client, per tick.
pub type ClientNotifyFn = Arc<dyn Fn(&str, i32, ClientEventType) + Send + Sync>;

pub struct NotificationWorker {
    store: Arc<dyn Store>,
    config: EngineConfig,
    notify: ClientNotifyFn,
    liveness: HealthHandle,
}

impl NotificationWorker {
    pub fn new(
        store: Arc<dyn Store>,
        config: EngineConfig,
        notify: ClientNotifyFn,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            store,
            config,
            notify,
            liveness,
        }
    }

    /// Runs forever at `notification_interval`, independent of the dispatch worker's
    /// version signal: notifications are time-smoothed so a burst of publishes still
    /// yields roughly one poll-hint per client per interval.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.notification_interval.0);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("notification worker shutting down");
                        return;
                    }
                    continue;
                }
            }

            if *shutdown.borrow() {
                info!("notification worker shutting down");
                return;
            }

            self.tick().await;
            self.liveness.report_healthy().await;
        }
    }

    /// Runs one tick. Exposed directly for tests.
    pub async fn tick(&self) -> usize {
        let clients = match self.store.get_notifiable_clients().await {
            Ok(clients) => clients,
            Err(e) => {
                error!("notification worker: failed to list notifiable clients: {e}");
                return 0;
            }
        };

        for client_id in &clients {
            (self.notify)(client_id, PUBSUB_POLL_EVENT_CODE, ClientEventType::PubSub);
        }

        if !clients.is_empty() {
            metrics::counter!(m::NOTIFICATION_TICK_CLIENTS).increment(clients.len() as u64);
        }

        clients.len()
    }
}
