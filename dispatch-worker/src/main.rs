//! Demo binary: wires the dispatch engine to an in-memory store and serves health and
//! metrics endpoints. There is no client-facing RPC/poll surface here — that channel
//! is an outer application's concern, out of scope for the core engine.
use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;

use dispatch_common::health::HealthRegistry;
use dispatch_common::metrics::{serve, setup_metrics_router};
use dispatch_common::model::ClientEventType;
use dispatch_common::EngineConfig;
use dispatch_memstore::MemStore;
use dispatch_worker::{ClientNotifyFn, Manager};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = EngineConfig::init_from_env().expect("invalid configuration");

    let liveness = HealthRegistry::new("liveness");

    let store = Arc::new(MemStore::new());
    let notify: ClientNotifyFn = Arc::new(
        |client_id: &str, event_code: i32, _event_type: ClientEventType| {
            tracing::info!(client_id, event_code, "poll hint");
        },
    );

    let manager = Manager::new(store, config, notify, liveness.clone())
        .await
        .expect("invalid configuration");
    manager.start().await;

    let router = Router::new()
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = router.merge(setup_metrics_router());

    serve(router, "0.0.0.0:3305")
        .await
        .expect("failed to start serving metrics");
}

pub async fn index() -> &'static str {
    "dispatch-worker"
}
