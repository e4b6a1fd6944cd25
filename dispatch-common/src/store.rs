//! The store façade: the external contract the dispatch engine is built against.
//!
//! The engine holds no long-lived references into the store beyond this trait object.
//! Every call is expected to be internally synchronized by the implementation; the
//! engine never holds a lock of its own across a call into it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use thiserror::Error;

use crate::model::{AssignmentKind, Message, MessageId, Role, SubscriptionId, TopicOperation};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("unknown subscription: {0:?}")]
    UnknownSubscription(SubscriptionId),
    #[error("unknown message: {0:?}")]
    UnknownMessage(MessageId),
    #[error("store operation failed: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Receives topic events from the store. Implemented by the engine's `Manager` and
/// registered via [`Store::register_topic_listener`]; the store calls these methods
/// on its own threads, so implementations must be `Send + Sync` and cheap.
pub trait TopicListener: Send + Sync {
    fn on_subscription_created(&self, subscription: &SubscriptionId);
    fn on_subscription_removed(&self, subscription: &SubscriptionId);
    fn on_message_arrived(&self, message: &MessageId);
    fn on_message_delivered(&self, message: &MessageId);
}

/// The external contract of the message store, as consumed by the dispatch engine.
///
/// This is the only thing the engine knows about the store. A production deployment
/// backs it with the real distributed store; [`crate::memory`]-style implementations
/// (see the `dispatch-memstore` crate) back it for tests and local development.
#[async_trait]
pub trait Store: Send + Sync {
    /// Install a callback receiver for topic events. Replaces any previously
    /// registered listener.
    fn register_topic_listener(&self, listener: Arc<dyn TopicListener>);

    /// Subscriptions whose last-activity is older than `threshold`, grouped by topic.
    async fn get_inactive_client_subscriptions(
        &self,
        threshold: Duration,
    ) -> StoreResult<HashMap<String, Vec<String>>>;

    /// Apply a topic-level mutation.
    async fn topic_operation(&self, op: TopicOperation) -> StoreResult<()>;

    /// One message currently `Unassigned`, if any, other than those in `exclude`.
    ///
    /// `exclude` lets a caller pull repeatedly within a single phase pass and make
    /// progress through the work set even when a pull doesn't change the message's
    /// state (e.g. no eligible subscriber yet) — without `exclude` the same message
    /// would keep coming back first on every call.
    async fn get_next_unassigned_message(
        &self,
        exclude: &[MessageId],
    ) -> StoreResult<Option<Message>>;

    /// One message currently `Assigned` whose subscriber has not yet acknowledged it,
    /// other than those in `exclude`. See `exclude` on
    /// [`Store::get_next_unassigned_message`]: the delivery-recheck phase re-issues
    /// `AssignSubscription` on a refresh, which leaves the message in the same
    /// `Assigned` variant, so exclusion is what lets repeated pulls advance past it.
    async fn get_next_undelivered_message(
        &self,
        exclude: &[MessageId],
    ) -> StoreResult<Option<Message>>;

    /// Messages `Assigned` for longer than `timeout`.
    async fn get_unacknowledged_messages(&self, timeout: Duration) -> StoreResult<Vec<Message>>;

    /// One eligible subscriber of `role` for `topic`. Implementations are expected to
    /// balance load across repeated calls; the engine imposes no fairness requirement
    /// of its own.
    async fn get_subscriber(&self, topic: &str, role: Role) -> StoreResult<Option<SubscriptionId>>;

    /// Transition a message's assignment state.
    async fn assignment_operation(
        &self,
        message: &MessageId,
        subscriber: Option<&SubscriptionId>,
        kind: AssignmentKind,
    ) -> StoreResult<()>;

    /// Messages currently `Delivered`.
    async fn get_delivered_messages(&self) -> StoreResult<Vec<Message>>;

    /// Remove a batch of messages, recording why.
    async fn remove_messages(
        &self,
        messages: &[MessageId],
        reason: crate::model::RemoveReason,
    ) -> StoreResult<()>;

    /// Messages past their expiry.
    async fn get_expired_messages(&self) -> StoreResult<Vec<Message>>;

    /// A set of messages whose combined size is at least `bytes_wanted`. The store
    /// chooses which; the engine only asks for the quantity.
    async fn get_evictable_messages(&self, bytes_wanted: i64) -> StoreResult<Vec<Message>>;

    /// Client ids with pending deliveries that haven't been told to poll recently.
    async fn get_notifiable_clients(&self) -> StoreResult<Vec<String>>;
}
