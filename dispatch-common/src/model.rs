//! Data model shared between the dispatch engine and any `Store` implementation.

use std::fmt;

use chrono::{DateTime, Utc};

/// The role a subscription plays on a topic.
///
/// Publishers confirm delivery of messages with `DeliveryOption::Any`; subscribers
/// receive them. See invariant 5 in the spec: an undelivered message on a topic with
/// no publisher is dropped, since nothing can ever confirm it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Publisher,
    Subscriber,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => write!(f, "publisher"),
            Role::Subscriber => write!(f, "subscriber"),
        }
    }
}

/// Who a published message should be delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryOption {
    /// Exactly one eligible subscriber receives the message.
    Any,
    /// Every eligible subscriber receives the message (fan-out).
    All,
}

/// A client's registered interest in a topic, in a specific role.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    pub topic: String,
    pub client_id: String,
    pub role: Role,
}

impl SubscriptionId {
    pub fn new(topic: impl Into<String>, client_id: impl Into<String>, role: Role) -> Self {
        Self {
            topic: topic.into(),
            client_id: client_id.into(),
            role,
        }
    }
}

/// A client's registered interest in a topic, carrying the bookkeeping the engine needs
/// to decide whether it is still active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub last_active: DateTime<Utc>,
}

impl Subscription {
    pub fn is_inactive(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        now - self.last_active > threshold
    }
}

/// A message's identity within its topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub topic: String,
    pub message_id: String,
}

/// Where a message stands in its delivery lifecycle.
///
/// `Unassigned -> Assigned(subscriber) -> Delivered -> (removed)`, with the one backward
/// edge `Assigned -> Unassigned` on an acknowledgement timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentState {
    Unassigned,
    Assigned {
        subscriber: String,
        assigned_at: DateTime<Utc>,
    },
    Delivered,
}

impl fmt::Display for AssignmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssignmentState::Unassigned => write!(f, "unassigned"),
            AssignmentState::Assigned { subscriber, .. } => {
                write!(f, "assigned({subscriber})")
            }
            AssignmentState::Delivered => write!(f, "delivered"),
        }
    }
}

/// A message published on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub delivery_option: DeliveryOption,
    pub published_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub state: AssignmentState,
}

impl Message {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

/// Why a message was removed from the store, for accounting/metrics purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    Delivered,
    Expired,
    Evicted,
    /// Dropped because the invariant it depended on (e.g. a publisher to confirm
    /// delivery to) no longer holds.
    Removed,
}

impl fmt::Display for RemoveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoveReason::Delivered => write!(f, "delivered"),
            RemoveReason::Expired => write!(f, "expired"),
            RemoveReason::Evicted => write!(f, "evicted"),
            RemoveReason::Removed => write!(f, "removed"),
        }
    }
}

/// A topic-level mutation, as passed to `Store::topic_operation`.
///
/// The store's full operation set is wider than this (subscription metadata updates,
/// administrative actions, etc.) but those variants are outside the engine's concern;
/// this enum only carries the ones the dispatch engine itself issues.
#[derive(Debug, Clone)]
pub enum TopicOperation {
    Subscribe {
        topic: String,
        subscription: SubscriptionId,
    },
    Unsubscribe {
        topic: String,
        subscription: SubscriptionId,
        /// Internal operations (e.g. the inactivity sweep) bypass external-caller
        /// authorization checks the store would otherwise apply.
        internal: bool,
    },
}

/// The kind of assignment mutation to apply via `Store::assignment_operation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentKind {
    AssignSubscription,
    RevokeAssignment,
}

/// The protocol event code passed to the client-notify callback. Its value is an
/// opaque constant inherited from the wire protocol; it carries no meaning inside
/// the engine beyond "poll for pub/sub deliveries".
pub const PUBSUB_POLL_EVENT_CODE: i32 = 11;

/// The event type passed alongside [`PUBSUB_POLL_EVENT_CODE`] to the client-notify callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEventType {
    PubSub,
}
