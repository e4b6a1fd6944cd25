//! The dispatch worker: the main loop, running the five phases described in the spec
//! in a fixed order every iteration, then blocking on the version signal.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use dispatch_common::health::HealthHandle;
use dispatch_common::model::{AssignmentKind, DeliveryOption, MessageId, Role, SubscriptionId};
use dispatch_common::store::{Store, StoreError};
use dispatch_common::{metrics_consts as m, DispatchError, EngineConfig, VersionSignal};
use tracing::{error, info, warn};

/// Every store call failure is logged and handled locally here, never propagated; this
/// just gives each one a consistent, typed shape on the way to the log line.
fn log_store_error(context: &str, err: StoreError) {
    error!("{context}: {}", DispatchError::from(err));
}

/// Runs the five dispatch phases in order, then parks on the version signal.
///
/// Single-threaded by design: the store is the concurrency boundary, and serializing
/// the phases is what makes the ordering guarantees in the spec hold.
pub struct DispatchWorker {
    store: Arc<dyn Store>,
    version: Arc<VersionSignal>,
    config: EngineConfig,
    liveness: HealthHandle,
}

/// Outcome of a single dispatch iteration, reported for tests and metrics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IterationReport {
    pub revoked: usize,
    pub inactive_removed: usize,
    pub assigned: usize,
    pub delivery_checked: usize,
    pub removed_undeliverable: usize,
    pub delivered_removed: usize,
    pub had_pending_work: bool,
}

impl DispatchWorker {
    pub fn new(
        store: Arc<dyn Store>,
        version: Arc<VersionSignal>,
        config: EngineConfig,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            store,
            version,
            config,
            liveness,
        }
    }

    /// Runs forever until `shutdown` fires. Cancellation is checked at the loop
    /// boundary only; any store call already in flight is allowed to finish.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                info!("dispatch worker shutting down");
                return;
            }

            let seen = self.version.seen();
            let report = self.run_iteration().await;
            self.liveness.report_healthy().await;

            tokio::select! {
                _ = self.version.wait_for_update(seen, report.had_pending_work) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("dispatch worker shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Runs one iteration of the five phases, in order. Exposed directly so tests can
    /// drive exactly one iteration without waiting on the version signal's timer.
    pub async fn run_iteration(&self) -> IterationReport {
        let started_at = std::time::Instant::now();
        let mut report = IterationReport::default();

        let (revoked, cap_hit) = self.revoke_expired_assignments().await;
        report.revoked = revoked;
        report.had_pending_work |= cap_hit;

        let (inactive_removed, cap_hit) = self.remove_inactive_clients().await;
        report.inactive_removed = inactive_removed;
        report.had_pending_work |= cap_hit;

        let (assigned, cap_hit) = self.assign_pending_messages().await;
        report.assigned = assigned;
        report.had_pending_work |= cap_hit;

        let (delivery_checked, removed_undeliverable, cap_hit) =
            self.assign_delivery_messages().await;
        report.delivery_checked = delivery_checked;
        report.removed_undeliverable = removed_undeliverable;
        report.had_pending_work |= cap_hit;

        report.delivered_removed = self.remove_delivered_messages().await;

        metrics::histogram!(m::DISPATCH_ITERATION_DURATION).record(started_at.elapsed());

        report
    }

    /// Fetches unacknowledged assignments older than `assignment_timeout` and revokes
    /// them back to `Unassigned`.
    async fn revoke_expired_assignments(&self) -> (usize, bool) {
        let timeout = ChronoDuration::from_std(self.config.assignment_timeout.0)
            .unwrap_or(ChronoDuration::MAX);

        let messages = match self.store.get_unacknowledged_messages(timeout).await {
            Ok(messages) => messages,
            Err(e) => {
                log_store_error(
                    "revoke_expired_assignments: failed to list unacknowledged messages",
                    e,
                );
                return (0, false);
            }
        };

        let cap_hit = messages.len() > self.config.fairness_cap;
        let mut revoked = 0;
        for message in messages.into_iter().take(self.config.fairness_cap) {
            match self
                .store
                .assignment_operation(&message.id, None, AssignmentKind::RevokeAssignment)
                .await
            {
                Ok(()) => {
                    revoked += 1;
                    metrics::counter!(m::REVOCATIONS_ISSUED).increment(1);
                }
                Err(e) => log_store_error(
                    &format!(
                        "revoke_expired_assignments: failed to revoke {:?}",
                        message.id
                    ),
                    e,
                ),
            }
        }

        if cap_hit {
            warn!("revoke_expired_assignments hit the fairness cap, more work remains");
            metrics::counter!(m::FAIRNESS_CAP_HITS, "phase" => "revoke_expired_assignments")
                .increment(1);
        }

        (revoked, cap_hit)
    }

    /// Unsubscribes clients whose last activity is older than `inactivity_threshold`.
    async fn remove_inactive_clients(&self) -> (usize, bool) {
        let threshold = ChronoDuration::from_std(self.config.inactivity_threshold.0)
            .unwrap_or(ChronoDuration::MAX);

        let by_topic = match self
            .store
            .get_inactive_client_subscriptions(threshold)
            .await
        {
            Ok(map) => map,
            Err(e) => {
                log_store_error(
                    "remove_inactive_clients: failed to list inactive subscriptions",
                    e,
                );
                return (0, false);
            }
        };

        let mut pending: Vec<(String, String)> = Vec::new();
        for (topic, client_ids) in by_topic {
            for client_id in client_ids {
                pending.push((topic.clone(), client_id));
            }
        }

        let cap_hit = pending.len() > self.config.fairness_cap;
        let mut removed = 0;
        for (topic, client_id) in pending.into_iter().take(self.config.fairness_cap) {
            // Role is not known at this point in the contract; Subscriber is the
            // common case, and the store treats `Unsubscribe` as keyed by client id
            // regardless of the role recorded here.
            let subscription = SubscriptionId::new(&topic, &client_id, Role::Subscriber);
            let op = dispatch_common::model::TopicOperation::Unsubscribe {
                topic: topic.clone(),
                subscription,
                internal: true,
            };
            match self.store.topic_operation(op).await {
                Ok(()) => {
                    removed += 1;
                    info!(topic, client_id, "unsubscribed inactive client");
                    metrics::counter!(m::INACTIVE_SUBSCRIPTIONS_REMOVED).increment(1);
                }
                Err(e) => log_store_error(
                    &format!(
                        "remove_inactive_clients: failed to unsubscribe {client_id} from {topic}"
                    ),
                    e,
                ),
            }
        }

        if cap_hit {
            warn!("remove_inactive_clients hit the fairness cap, more work remains");
            metrics::counter!(m::FAIRNESS_CAP_HITS, "phase" => "remove_inactive_clients")
                .increment(1);
        }

        (removed, cap_hit)
    }

    /// Pulls `Unassigned` messages one at a time and assigns each to an eligible
    /// subscriber, up to the fairness cap.
    async fn assign_pending_messages(&self) -> (usize, bool) {
        let mut assigned = 0;
        let mut pulled = 0;
        // Messages already pulled this call: a pull that doesn't change the
        // message's state (no eligible subscriber yet) must not be handed back by
        // the next pull, or the phase starves every other message on its budget.
        let mut seen: Vec<MessageId> = Vec::new();

        while pulled < self.config.fairness_cap {
            let message = match self.store.get_next_unassigned_message(&seen).await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    log_store_error(
                        "assign_pending_messages: failed to fetch next unassigned",
                        e,
                    );
                    break;
                }
            };
            pulled += 1;
            seen.push(message.id.clone());

            let subscriber = match message.delivery_option {
                DeliveryOption::Any => match self
                    .store
                    .get_subscriber(&message.id.topic, Role::Subscriber)
                    .await
                {
                    Ok(Some(sub)) => sub,
                    Ok(None) => continue, // no eligible subscriber yet; retried next iteration
                    Err(e) => {
                        log_store_error(
                            &format!(
                                "assign_pending_messages: failed to pick subscriber for {:?}",
                                message.id
                            ),
                            e,
                        );
                        continue;
                    }
                },
                // Fan-out: the store interprets a Subscriber-role marker here as "all
                // eligible subscribers", not a single pick.
                DeliveryOption::All => {
                    SubscriptionId::new(&message.id.topic, "*", Role::Subscriber)
                }
            };

            match self
                .store
                .assignment_operation(
                    &message.id,
                    Some(&subscriber),
                    AssignmentKind::AssignSubscription,
                )
                .await
            {
                Ok(()) => {
                    assigned += 1;
                    metrics::counter!(m::ASSIGNMENTS_ISSUED).increment(1);
                }
                Err(e) => log_store_error(
                    &format!("assign_pending_messages: failed to assign {:?}", message.id),
                    e,
                ),
            }
        }

        // Reaching the cap does not by itself mean work remains: the set we were
        // pulling from may have held exactly `fairness_cap` items. A single extra
        // peek (only taken at the boundary, never per item) resolves that, excluding
        // what this call already visited so it isn't mistaken for more work.
        let cap_hit = pulled >= self.config.fairness_cap
            && matches!(
                self.store.get_next_unassigned_message(&seen).await,
                Ok(Some(_))
            );
        if cap_hit {
            warn!("assign_pending_messages hit the fairness cap, more work remains");
            metrics::counter!(m::FAIRNESS_CAP_HITS, "phase" => "assign_pending_messages")
                .increment(1);
        }

        (assigned, cap_hit)
    }

    /// Pulls `Assigned`-but-undelivered messages and either drops them (no publisher
    /// left to confirm delivery, invariant 5) or refreshes their assignment.
    async fn assign_delivery_messages(&self) -> (usize, usize, bool) {
        let mut checked = 0;
        let mut removed = 0;
        let mut to_remove: Vec<MessageId> = Vec::new();
        // A refresh leaves the message `Assigned` again, so without tracking what
        // this call already visited the next pull would just hand the same message
        // back and the phase would spend its whole budget refreshing it.
        let mut seen: Vec<MessageId> = Vec::new();

        while checked < self.config.fairness_cap {
            let message = match self.store.get_next_undelivered_message(&seen).await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    log_store_error(
                        "assign_delivery_messages: failed to fetch next undelivered",
                        e,
                    );
                    break;
                }
            };
            checked += 1;
            seen.push(message.id.clone());

            let has_publisher = match self
                .store
                .get_subscriber(&message.id.topic, Role::Publisher)
                .await
            {
                Ok(publisher) => publisher.is_some(),
                Err(e) => {
                    log_store_error(
                        &format!(
                            "assign_delivery_messages: failed to check publisher for {:?}",
                            message.id
                        ),
                        e,
                    );
                    continue;
                }
            };

            if !has_publisher {
                to_remove.push(message.id.clone());
                continue;
            }

            let subscriber = match &message.state {
                dispatch_common::model::AssignmentState::Assigned { subscriber, .. } => {
                    subscriber.clone()
                }
                _ => continue, // not actually assigned anymore; nothing to refresh
            };
            let subscriber = SubscriptionId::new(&message.id.topic, subscriber, Role::Subscriber);

            if let Err(e) = self
                .store
                .assignment_operation(
                    &message.id,
                    Some(&subscriber),
                    AssignmentKind::AssignSubscription,
                )
                .await
            {
                log_store_error(
                    &format!(
                        "assign_delivery_messages: failed to refresh assignment for {:?}",
                        message.id
                    ),
                    e,
                );
            }
        }

        if !to_remove.is_empty() {
            match self
                .store
                .remove_messages(&to_remove, dispatch_common::model::RemoveReason::Removed)
                .await
            {
                Ok(()) => {
                    removed = to_remove.len();
                    metrics::counter!(m::MESSAGES_REMOVED_UNDELIVERABLE).increment(removed as u64);
                }
                Err(e) => log_store_error(
                    "assign_delivery_messages: failed to remove orphaned messages",
                    e,
                ),
            }
        }

        // Same boundary peek as `assign_pending_messages`: checking exactly
        // `fairness_cap` items doesn't mean more were left behind.
        let cap_hit = checked >= self.config.fairness_cap
            && matches!(
                self.store.get_next_undelivered_message(&seen).await,
                Ok(Some(_))
            );

        if cap_hit {
            warn!("assign_delivery_messages hit the fairness cap, more work remains");
            metrics::counter!(m::FAIRNESS_CAP_HITS, "phase" => "assign_delivery_messages")
                .increment(1);
        }

        (checked, removed, cap_hit)
    }

    /// Single-shot: removes every currently `Delivered` message. Not subject to the
    /// fairness cap — it runs once per iteration regardless of how many there are.
    async fn remove_delivered_messages(&self) -> usize {
        let delivered = match self.store.get_delivered_messages().await {
            Ok(messages) => messages,
            Err(e) => {
                log_store_error(
                    "remove_delivered_messages: failed to list delivered messages",
                    e,
                );
                return 0;
            }
        };

        if delivered.is_empty() {
            return 0;
        }

        let ids: Vec<MessageId> = delivered.into_iter().map(|m| m.id).collect();
        let count = ids.len();
        match self
            .store
            .remove_messages(&ids, dispatch_common::model::RemoveReason::Delivered)
            .await
        {
            Ok(()) => {
                metrics::counter!(m::MESSAGES_DELIVERED).increment(count as u64);
                count
            }
            Err(e) => {
                log_store_error(
                    "remove_delivered_messages: failed to remove delivered messages",
                    e,
                );
                0
            }
        }
    }
}
