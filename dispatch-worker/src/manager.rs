//! The manager façade: lifecycle, the topic-event listener surface, and the
//! on-demand entry points (`evict`, `set_expiration_interval`).

use std::sync::{Arc, Mutex};

use dispatch_common::health::HealthRegistry;
use dispatch_common::model::{MessageId, RemoveReason, SubscriptionId};
use dispatch_common::store::{Store, TopicListener};
use dispatch_common::{metrics_consts as m, EngineConfig, SetupError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::dispatch_worker::DispatchWorker;
use crate::expiration_task::ExpirationTask;
use crate::notification_worker::{ClientNotifyFn, NotificationWorker};

struct RunningWorkers {
    shutdown_tx: watch::Sender<bool>,
    dispatch_handle: JoinHandle<()>,
    notification_handle: JoinHandle<()>,
    expiration_handle: JoinHandle<()>,
}

/// Owns the engine's workers and is the single entry point an embedding application
/// talks to: `start`/`stop` for lifecycle, the `TopicListener` implementation the
/// store calls back into, and `evict`/`set_expiration_interval` for on-demand control.
pub struct Manager {
    store: Arc<dyn Store>,
    version: Arc<dispatch_common::VersionSignal>,
    config: EngineConfig,
    notify: ClientNotifyFn,
    liveness: HealthRegistry,
    expiration_task: Arc<ExpirationTask>,
    running: Mutex<Option<RunningWorkers>>,
}

impl Manager {
    /// `liveness` is the shared registry each worker reports into; the caller owns it
    /// and serves `liveness.get_status()` on its own health endpoint.
    pub async fn new(
        store: Arc<dyn Store>,
        config: EngineConfig,
        notify: ClientNotifyFn,
        liveness: HealthRegistry,
    ) -> Result<Arc<Self>, SetupError> {
        if config.fairness_cap == 0 {
            return Err(SetupError::Config(
                "fairness_cap must be greater than zero, or every phase loop exits immediately \
                 without ever making progress"
                    .to_string(),
            ));
        }

        let version = Arc::new(dispatch_common::VersionSignal::new(config.wait_max.0));
        let expiration_liveness = liveness
            .register(
                "expiration-task".to_string(),
                time::Duration::seconds(config.clean_interval.0.as_secs() as i64 * 3 + 30),
            )
            .await;
        let expiration_task = Arc::new(ExpirationTask::new(
            store.clone(),
            &config,
            expiration_liveness,
        ));

        Ok(Arc::new(Self {
            store,
            version,
            config,
            notify,
            liveness,
            expiration_task,
            running: Mutex::new(None),
        }))
    }

    /// Registers the engine as topic listener, then launches the dispatch and
    /// notification workers and the expiration task if not already running.
    /// Re-entrant: calling `start` while already started is a no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.running.lock().unwrap().is_some() {
            info!("manager start() called while already running, ignoring");
            return;
        }

        let listener: Arc<dyn TopicListener> = self.clone();
        self.store.register_topic_listener(listener);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatch_liveness = self
            .liveness
            .register("dispatch-worker".to_string(), time::Duration::seconds(60))
            .await;
        let dispatch_worker = DispatchWorker::new(
            self.store.clone(),
            self.version.clone(),
            self.config.clone(),
            dispatch_liveness,
        );
        let dispatch_rx = shutdown_rx.clone();
        let dispatch_handle = tokio::spawn(async move {
            dispatch_worker.run(dispatch_rx).await;
        });

        let notification_liveness = self
            .liveness
            .register(
                "notification-worker".to_string(),
                time::Duration::seconds(
                    self.config.notification_interval.0.as_secs() as i64 * 3 + 30,
                ),
            )
            .await;
        let notification_worker = NotificationWorker::new(
            self.store.clone(),
            self.config.clone(),
            self.notify.clone(),
            notification_liveness,
        );
        let notification_rx = shutdown_rx.clone();
        let notification_handle = tokio::spawn(async move {
            notification_worker.run(notification_rx).await;
        });

        let expiration_task = self.expiration_task.clone();
        let expiration_handle = tokio::spawn(async move {
            expiration_task.run().await;
        });

        *self.running.lock().unwrap() = Some(RunningWorkers {
            shutdown_tx,
            dispatch_handle,
            notification_handle,
            expiration_handle,
        });

        info!("dispatch manager started");
    }

    /// Signals cancellation to both workers and the expiration task. Workers finish
    /// their current iteration and exit; this returns once they have.
    pub async fn stop(self: &Arc<Self>) {
        let running = self.running.lock().unwrap().take();
        let Some(running) = running else {
            return;
        };

        let _ = running.shutdown_tx.send(true);
        self.expiration_task.cancel();

        for handle in [
            running.dispatch_handle,
            running.notification_handle,
            running.expiration_handle,
        ] {
            if let Err(e) = handle.await {
                error!("dispatch manager: worker task panicked during shutdown: {e}");
            }
        }

        info!("dispatch manager stopped");
    }

    /// Synchronously fetches and removes evictable messages under memory pressure.
    pub async fn evict(&self, bytes_wanted: i64) {
        let messages = match self.store.get_evictable_messages(bytes_wanted).await {
            Ok(messages) => messages,
            Err(e) => {
                error!("evict: failed to list evictable messages: {e}");
                return;
            }
        };

        if messages.is_empty() {
            return;
        }

        let ids: Vec<MessageId> = messages.into_iter().map(|m| m.id).collect();
        let count = ids.len();
        match self
            .store
            .remove_messages(&ids, RemoveReason::Evicted)
            .await
        {
            Ok(()) => {
                metrics::counter!(m::EVICTED_PER_SECOND).increment(count as u64);
            }
            Err(e) => error!("evict: failed to remove evictable messages: {e}"),
        }
    }

    /// Updates the expiration task's period. Non-positive values are ignored.
    pub fn set_expiration_interval(&self, ms: i64) {
        if ms <= 0 {
            return;
        }
        self.expiration_task
            .set_interval(std::time::Duration::from_millis(ms as u64));
    }
}

impl TopicListener for Manager {
    fn on_subscription_created(&self, _subscription: &SubscriptionId) {
        self.version.bump();
    }

    fn on_subscription_removed(&self, _subscription: &SubscriptionId) {
        self.version.bump();
    }

    fn on_message_arrived(&self, _message: &MessageId) {
        self.version.bump();
    }

    fn on_message_delivered(&self, _message: &MessageId) {
        self.version.bump();
    }
}
