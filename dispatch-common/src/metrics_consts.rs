//! Names of the engine-internal metrics recorded through the `metrics` crate.

pub const ASSIGNMENTS_ISSUED: &str = "dispatch_assignments_issued_total";
pub const REVOCATIONS_ISSUED: &str = "dispatch_revocations_issued_total";
pub const INACTIVE_SUBSCRIPTIONS_REMOVED: &str = "dispatch_inactive_subscriptions_removed_total";
pub const MESSAGES_DELIVERED: &str = "dispatch_messages_delivered_total";
pub const MESSAGES_REMOVED_UNDELIVERABLE: &str = "dispatch_messages_removed_undeliverable_total";
pub const EXPIRED_PER_SECOND: &str = "dispatch_expired_messages_total";
pub const EVICTED_PER_SECOND: &str = "dispatch_evicted_messages_total";
pub const FAIRNESS_CAP_HITS: &str = "dispatch_fairness_cap_hits_total";
pub const DISPATCH_ITERATION_DURATION: &str = "dispatch_iteration_duration_seconds";
pub const NOTIFICATION_TICK_CLIENTS: &str = "dispatch_notification_tick_clients_total";
