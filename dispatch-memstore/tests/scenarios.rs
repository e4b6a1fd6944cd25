//! End-to-end scenarios driving the dispatch worker against the in-memory store.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use dispatch_common::health::HealthRegistry;
use dispatch_common::model::{AssignmentState, DeliveryOption, MessageId, Role};
use dispatch_common::{EngineConfig, Store};
use dispatch_memstore::MemStore;
use dispatch_worker::DispatchWorker;

async fn worker(store: Arc<MemStore>, config: EngineConfig) -> DispatchWorker {
    let version = Arc::new(dispatch_common::VersionSignal::new(config.wait_max.0));
    let liveness = HealthRegistry::new("test")
        .register("dispatch-worker".to_string(), time::Duration::seconds(60))
        .await;
    DispatchWorker::new(store, version, config, liveness)
}

#[tokio::test]
async fn s1_simple_fan_in() {
    let store = Arc::new(MemStore::new());
    store.subscribe("t", "p", Role::Publisher).await;
    store.subscribe("t", "s", Role::Subscriber).await;
    let m1 = store.publish("t", "m1", DeliveryOption::Any, None).await;
    let m2 = store.publish("t", "m2", DeliveryOption::Any, None).await;
    let m3 = store.publish("t", "m3", DeliveryOption::Any, None).await;

    let w = worker(store.clone(), EngineConfig::default()).await;

    // Two iterations are enough for every message to leave `Unassigned`.
    w.run_iteration().await;
    w.run_iteration().await;

    for m in [&m1, &m2, &m3] {
        assert!(matches!(
            store.message_state(m).await.unwrap(),
            AssignmentState::Assigned { .. }
        ));
    }

    store.mark_delivered(&m1).await.unwrap();
    store.mark_delivered(&m2).await.unwrap();
    store.mark_delivered(&m3).await.unwrap();

    w.run_iteration().await;

    for m in [&m1, &m2, &m3] {
        assert!(
            !store.message_exists(m).await,
            "{m:?} should have been removed"
        );
    }
}

#[tokio::test]
async fn s2_orphaned_message_is_removed() {
    let store = Arc::new(MemStore::new());
    // No publisher registered on "t".
    store
        .seed_assigned_message("t", "m1", "s", Utc::now())
        .await;
    let id = MessageId {
        topic: "t".to_string(),
        message_id: "m1".to_string(),
    };

    let w = worker(store.clone(), EngineConfig::default()).await;
    w.run_iteration().await;

    assert!(!store.message_exists(&id).await);
}

#[tokio::test]
async fn s3_revocation_after_assignment_timeout() {
    let store = Arc::new(MemStore::new());
    store.subscribe("t", "p", Role::Publisher).await;
    let assigned_25s_ago = Utc::now() - chrono::Duration::seconds(25);
    store
        .seed_assigned_message("t", "m1", "s", assigned_25s_ago)
        .await;
    let id = MessageId {
        topic: "t".to_string(),
        message_id: "m1".to_string(),
    };

    let mut config = EngineConfig::default();
    config.assignment_timeout.0 = StdDuration::from_secs(20);

    let w = worker(store.clone(), config).await;
    w.run_iteration().await;

    assert_eq!(
        store.message_state(&id).await.unwrap(),
        AssignmentState::Unassigned
    );
}

#[tokio::test]
async fn s4_inactive_subscription_is_unsubscribed() {
    let store = Arc::new(MemStore::new());
    let last_active_11_min_ago = Utc::now() - chrono::Duration::minutes(11);
    store
        .seed_stale_subscription("t", "c", Role::Subscriber, last_active_11_min_ago)
        .await;

    let mut config = EngineConfig::default();
    config.inactivity_threshold.0 = StdDuration::from_secs(600);

    let w = worker(store.clone(), config).await;
    w.run_iteration().await;

    assert_eq!(
        store.get_subscriber("t", Role::Subscriber).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn s5_fairness_cap_spans_iterations() {
    let store = Arc::new(MemStore::new());
    store.subscribe("t", "p", Role::Publisher).await;
    store.subscribe("t", "s", Role::Subscriber).await;
    for i in 0..500 {
        store
            .publish("t", &format!("m{i}"), DeliveryOption::Any, None)
            .await;
    }

    let w = worker(store.clone(), EngineConfig::default()).await;

    let first = w.run_iteration().await;
    assert_eq!(first.assigned, 200);
    assert!(first.had_pending_work);

    let second = w.run_iteration().await;
    assert_eq!(second.assigned, 200);
    assert!(second.had_pending_work);

    let third = w.run_iteration().await;
    assert_eq!(third.assigned, 100);
    // had_pending_work may still be true here: the delivery-recheck phase has its
    // own independent fairness cap and by now there are far more than 200 messages
    // sitting `Assigned`, which is itself backlog worth another immediate iteration.
}

#[tokio::test]
async fn s6_expired_message_is_removed() {
    use dispatch_worker::ExpirationTask;

    let store = Arc::new(MemStore::new());
    let expired_at = Utc::now() - chrono::Duration::seconds(1);
    let id = store
        .publish("t", "m1", DeliveryOption::Any, Some(expired_at))
        .await;

    let mut config = EngineConfig::default();
    config.clean_interval.0 = StdDuration::from_millis(100);
    let liveness = HealthRegistry::new("test")
        .register("expiration-task".to_string(), time::Duration::seconds(60))
        .await;
    let task = ExpirationTask::new(store.clone(), &config, liveness);

    task.run_once().await;

    assert!(!store.message_exists(&id).await);
}

#[tokio::test]
async fn s7_subscriberless_topic_does_not_starve_servable_topic() {
    let store = Arc::new(MemStore::new());
    // "a" has no subscriber yet: every pull of its message leaves it Unassigned.
    let stuck = store.publish("a", "m1", DeliveryOption::Any, None).await;
    store.subscribe("b", "p", Role::Publisher).await;
    store.subscribe("b", "s", Role::Subscriber).await;
    let servable = store.publish("b", "m1", DeliveryOption::Any, None).await;

    let w = worker(store.clone(), EngineConfig::default()).await;
    w.run_iteration().await;

    assert_eq!(
        store.message_state(&stuck).await.unwrap(),
        AssignmentState::Unassigned,
        "no subscriber ever showed up for this topic"
    );
    assert!(
        matches!(
            store.message_state(&servable).await.unwrap(),
            AssignmentState::Assigned { .. }
        ),
        "a subscriber-less message on another topic must not starve this one"
    );
}

#[tokio::test]
async fn s8_refresh_does_not_starve_other_assigned_messages() {
    let store = Arc::new(MemStore::new());
    store.subscribe("t", "p", Role::Publisher).await;
    store
        .seed_assigned_message("t", "m1", "s", Utc::now())
        .await;
    store
        .seed_assigned_message("t", "m2", "s", Utc::now())
        .await;

    let w = worker(store.clone(), EngineConfig::default()).await;
    let report = w.run_iteration().await;

    // Each refresh leaves its message `Assigned` again, so without exclusion tracking
    // the phase would spend its whole budget repeatedly refreshing just one of them.
    assert_eq!(report.delivery_checked, 2);
}
