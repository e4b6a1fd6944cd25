//! An in-memory [`Store`] implementation.
//!
//! This is the reference store used by the workspace's own tests and the demo binary.
//! It is intentionally simple: one mutex around a per-topic map, no persistence, no
//! replication. A production deployment backs [`Store`] with the real distributed
//! message store instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dispatch_common::model::{
    AssignmentKind, AssignmentState, DeliveryOption, Message, MessageId, RemoveReason, Role,
    Subscription, SubscriptionId, TopicOperation,
};
use dispatch_common::store::{Store, StoreError, StoreResult, TopicListener};
use tokio::sync::Mutex;
use tracing::warn;

/// The synthetic client id `assign_pending_messages` uses for `DeliveryOption::All`
/// fan-out. Kept as a literal subscriber id rather than a real subscription; this
/// store does not attempt per-subscriber fan-out delivery bookkeeping.
const FAN_OUT_MARKER: &str = "*";

#[derive(Default)]
struct Topic {
    subscriptions: HashMap<(String, Role), Subscription>,
    messages: Vec<Message>,
    round_robin: HashMap<Role, usize>,
    notified_at: HashMap<String, DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    topics: HashMap<String, Topic>,
    listener: Option<Arc<dyn TopicListener>>,
}

pub struct MemStore {
    inner: Mutex<Inner>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Test/demo helper: register a subscription and notify the listener.
    pub async fn subscribe(&self, topic: &str, client_id: &str, role: Role) -> SubscriptionId {
        let id = SubscriptionId::new(topic, client_id, role);
        let mut inner = self.inner.lock().await;
        inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .subscriptions
            .insert(
                (client_id.to_string(), role),
                Subscription {
                    id: id.clone(),
                    last_active: Utc::now(),
                },
            );
        if let Some(listener) = inner.listener.clone() {
            listener.on_subscription_created(&id);
        }
        id
    }

    /// Test/demo helper: publish a message as `Unassigned`.
    pub async fn publish(
        &self,
        topic: &str,
        message_id: &str,
        delivery_option: DeliveryOption,
        expires_at: Option<DateTime<Utc>>,
    ) -> MessageId {
        let id = MessageId {
            topic: topic.to_string(),
            message_id: message_id.to_string(),
        };
        let message = Message {
            id: id.clone(),
            delivery_option,
            published_at: Utc::now(),
            expires_at,
            state: AssignmentState::Unassigned,
        };
        let mut inner = self.inner.lock().await;
        inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .messages
            .push(message);
        if let Some(listener) = inner.listener.clone() {
            listener.on_message_arrived(&id);
        }
        id
    }

    /// Test helper: backdates a subscription's last-activity timestamp, to simulate
    /// an idle client without waiting out `inactivityThreshold` in real time.
    pub async fn seed_stale_subscription(
        &self,
        topic: &str,
        client_id: &str,
        role: Role,
        last_active: DateTime<Utc>,
    ) {
        let id = SubscriptionId::new(topic, client_id, role);
        let mut inner = self.inner.lock().await;
        inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .subscriptions
            .entry((client_id.to_string(), role))
            .or_insert_with(|| Subscription { id, last_active })
            .last_active = last_active;
    }

    /// Test helper: seeds a message directly into `Assigned(subscriber)` with a given
    /// assignment timestamp, to simulate an already-aged assignment without waiting
    /// out `assignmentTimeout` in real time.
    pub async fn seed_assigned_message(
        &self,
        topic: &str,
        message_id: &str,
        subscriber: &str,
        assigned_at: DateTime<Utc>,
    ) {
        let id = MessageId {
            topic: topic.to_string(),
            message_id: message_id.to_string(),
        };
        let message = Message {
            id,
            delivery_option: DeliveryOption::Any,
            published_at: assigned_at,
            expires_at: None,
            state: AssignmentState::Assigned {
                subscriber: subscriber.to_string(),
                assigned_at,
            },
        };
        self.inner
            .lock()
            .await
            .topics
            .entry(topic.to_string())
            .or_default()
            .messages
            .push(message);
    }

    /// Test/demo helper: simulates the subscriber's acknowledgement of delivery, the
    /// one state transition this store owns that the engine never drives itself.
    pub async fn mark_delivered(&self, message: &MessageId) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let topic = inner
            .topics
            .get_mut(&message.topic)
            .ok_or_else(|| StoreError::UnknownTopic(message.topic.clone()))?;
        let found = topic
            .messages
            .iter_mut()
            .find(|m| m.id == *message)
            .ok_or_else(|| StoreError::UnknownMessage(message.clone()))?;
        found.state = AssignmentState::Delivered;
        let listener = inner.listener.clone();
        drop(inner);
        if let Some(listener) = listener {
            listener.on_message_delivered(message);
        }
        Ok(())
    }

    /// Test helper: current state of a message, for assertions.
    pub async fn message_state(&self, message: &MessageId) -> Option<AssignmentState> {
        let inner = self.inner.lock().await;
        inner
            .topics
            .get(&message.topic)?
            .messages
            .iter()
            .find(|m| m.id == *message)
            .map(|m| m.state.clone())
    }

    /// Test helper: whether a message still exists in the store at all.
    pub async fn message_exists(&self, message: &MessageId) -> bool {
        let inner = self.inner.lock().await;
        inner
            .topics
            .get(&message.topic)
            .is_some_and(|t| t.messages.iter().any(|m| m.id == *message))
    }
}

#[async_trait]
impl Store for MemStore {
    fn register_topic_listener(&self, listener: Arc<dyn TopicListener>) {
        // `try_lock` is safe here: this is only ever called once at startup, before
        // any async store call is in flight.
        match self.inner.try_lock() {
            Ok(mut inner) => inner.listener = Some(listener),
            Err(_) => warn!("register_topic_listener: store busy, listener not installed"),
        }
    }

    async fn get_inactive_client_subscriptions(
        &self,
        threshold: Duration,
    ) -> StoreResult<HashMap<String, Vec<String>>> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let mut result = HashMap::new();
        for (topic_name, topic) in &inner.topics {
            let stale: Vec<String> = topic
                .subscriptions
                .values()
                .filter(|s| s.is_inactive(now, threshold))
                .map(|s| s.id.client_id.clone())
                .collect();
            if !stale.is_empty() {
                result.insert(topic_name.clone(), stale);
            }
        }
        Ok(result)
    }

    async fn topic_operation(&self, op: TopicOperation) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        match op {
            TopicOperation::Subscribe {
                topic,
                subscription,
            } => {
                inner.topics.entry(topic).or_default().subscriptions.insert(
                    (subscription.client_id.clone(), subscription.role),
                    Subscription {
                        id: subscription.clone(),
                        last_active: Utc::now(),
                    },
                );
                if let Some(listener) = inner.listener.clone() {
                    drop(inner);
                    listener.on_subscription_created(&subscription);
                }
            }
            TopicOperation::Unsubscribe {
                topic,
                subscription,
                internal: _,
            } => {
                if let Some(t) = inner.topics.get_mut(&topic) {
                    t.subscriptions
                        .remove(&(subscription.client_id.clone(), subscription.role));
                }
                if let Some(listener) = inner.listener.clone() {
                    drop(inner);
                    listener.on_subscription_removed(&subscription);
                }
            }
        }
        Ok(())
    }

    async fn get_next_unassigned_message(
        &self,
        exclude: &[MessageId],
    ) -> StoreResult<Option<Message>> {
        let inner = self.inner.lock().await;
        for topic in inner.topics.values() {
            if let Some(message) = topic.messages.iter().find(|m| {
                matches!(m.state, AssignmentState::Unassigned) && !exclude.contains(&m.id)
            }) {
                return Ok(Some(message.clone()));
            }
        }
        Ok(None)
    }

    async fn get_next_undelivered_message(
        &self,
        exclude: &[MessageId],
    ) -> StoreResult<Option<Message>> {
        let inner = self.inner.lock().await;
        for topic in inner.topics.values() {
            if let Some(message) = topic.messages.iter().find(|m| {
                matches!(m.state, AssignmentState::Assigned { .. }) && !exclude.contains(&m.id)
            }) {
                return Ok(Some(message.clone()));
            }
        }
        Ok(None)
    }

    async fn get_unacknowledged_messages(&self, timeout: Duration) -> StoreResult<Vec<Message>> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let mut out = Vec::new();
        for topic in inner.topics.values() {
            for message in &topic.messages {
                if let AssignmentState::Assigned { assigned_at, .. } = message.state {
                    if now - assigned_at > timeout {
                        out.push(message.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    async fn get_subscriber(&self, topic: &str, role: Role) -> StoreResult<Option<SubscriptionId>> {
        let mut inner = self.inner.lock().await;
        let Some(t) = inner.topics.get_mut(topic) else {
            return Ok(None);
        };
        let mut candidates: Vec<SubscriptionId> = t
            .subscriptions
            .values()
            .filter(|s| s.id.role == role)
            .map(|s| s.id.clone())
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }
        candidates.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        let idx = t.round_robin.entry(role).or_insert(0);
        let chosen = candidates[*idx % candidates.len()].clone();
        *idx = (*idx + 1) % candidates.len();
        Ok(Some(chosen))
    }

    async fn assignment_operation(
        &self,
        message: &MessageId,
        subscriber: Option<&SubscriptionId>,
        kind: AssignmentKind,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let topic = inner
            .topics
            .get_mut(&message.topic)
            .ok_or_else(|| StoreError::UnknownTopic(message.topic.clone()))?;
        let found = topic
            .messages
            .iter_mut()
            .find(|m| m.id == *message)
            .ok_or_else(|| StoreError::UnknownMessage(message.clone()))?;

        match kind {
            AssignmentKind::AssignSubscription => {
                let subscriber = subscriber.ok_or_else(|| {
                    StoreError::Backend("AssignSubscription requires a subscriber".to_string())
                })?;
                found.state = AssignmentState::Assigned {
                    subscriber: subscriber.client_id.clone(),
                    assigned_at: Utc::now(),
                };
            }
            AssignmentKind::RevokeAssignment => {
                found.state = AssignmentState::Unassigned;
            }
        }
        Ok(())
    }

    async fn get_delivered_messages(&self) -> StoreResult<Vec<Message>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .topics
            .values()
            .flat_map(|t| &t.messages)
            .filter(|m| matches!(m.state, AssignmentState::Delivered))
            .cloned()
            .collect())
    }

    async fn remove_messages(
        &self,
        messages: &[MessageId],
        reason: RemoveReason,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        for id in messages {
            if let Some(topic) = inner.topics.get_mut(&id.topic) {
                topic.messages.retain(|m| m.id != *id);
            }
        }
        tracing::debug!(count = messages.len(), %reason, "removed messages");
        Ok(())
    }

    async fn get_expired_messages(&self) -> StoreResult<Vec<Message>> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        Ok(inner
            .topics
            .values()
            .flat_map(|t| &t.messages)
            .filter(|m| m.is_expired(now))
            .cloned()
            .collect())
    }

    async fn get_evictable_messages(&self, bytes_wanted: i64) -> StoreResult<Vec<Message>> {
        // No size tracking in this reference store: each message counts as 1 "byte"
        // for the purpose of satisfying a request, oldest-published first.
        let inner = self.inner.lock().await;
        let mut all: Vec<Message> = inner
            .topics
            .values()
            .flat_map(|t| t.messages.iter().cloned())
            .collect();
        all.sort_by_key(|m| m.published_at);
        let take = bytes_wanted.max(0) as usize;
        Ok(all.into_iter().take(take).collect())
    }

    async fn get_notifiable_clients(&self) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut due = Vec::new();
        for topic in inner.topics.values_mut() {
            for message in &topic.messages {
                if let AssignmentState::Assigned {
                    subscriber,
                    assigned_at,
                } = &message.state
                {
                    if subscriber == FAN_OUT_MARKER {
                        continue;
                    }
                    let last_notified = topic.notified_at.get(subscriber).copied();
                    if last_notified.is_none_or(|t| t < *assigned_at) {
                        due.push(subscriber.clone());
                    }
                }
            }
            let now_ref = now;
            for client_id in &due {
                topic.notified_at.insert(client_id.clone(), now_ref);
            }
        }
        due.sort();
        due.dedup();
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_fetch_unassigned() {
        let store = MemStore::new();
        let id = store.publish("t", "m1", DeliveryOption::Any, None).await;
        let fetched = store.get_next_unassigned_message(&[]).await.unwrap();
        assert_eq!(fetched.unwrap().id, id);
    }

    #[tokio::test]
    async fn assign_then_revoke_round_trips() {
        let store = MemStore::new();
        let sub = store.subscribe("t", "s1", Role::Subscriber).await;
        let msg = store.publish("t", "m1", DeliveryOption::Any, None).await;
        store
            .assignment_operation(&msg, Some(&sub), AssignmentKind::AssignSubscription)
            .await
            .unwrap();
        assert!(matches!(
            store.message_state(&msg).await.unwrap(),
            AssignmentState::Assigned { .. }
        ));
        store
            .assignment_operation(&msg, None, AssignmentKind::RevokeAssignment)
            .await
            .unwrap();
        assert_eq!(
            store.message_state(&msg).await.unwrap(),
            AssignmentState::Unassigned
        );
    }

    #[tokio::test]
    async fn remove_messages_drops_them() {
        let store = MemStore::new();
        let msg = store.publish("t", "m1", DeliveryOption::Any, None).await;
        store
            .remove_messages(std::slice::from_ref(&msg), RemoveReason::Removed)
            .await
            .unwrap();
        assert!(!store.message_exists(&msg).await);
    }

    #[tokio::test]
    async fn get_subscriber_round_robins() {
        let store = MemStore::new();
        store.subscribe("t", "a", Role::Subscriber).await;
        store.subscribe("t", "b", Role::Subscriber).await;
        let first = store
            .get_subscriber("t", Role::Subscriber)
            .await
            .unwrap()
            .unwrap();
        let second = store
            .get_subscriber("t", Role::Subscriber)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.client_id, second.client_id);
    }
}
