//! Pub/sub topics: fan-out delivery with no cross-subscriber ordering
//! guarantee beyond each subscriber's own commit-order view (§3 Topic,
//! §4.4.1, §8).

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::broker::connection::Connection;
use crate::broker::protocol::Response;
use crate::domain_types::{ChannelCapacity, ConnectionId, TopicName};
use crate::envelope::Envelope;

/// Number of recently-published envelopes a topic keeps around for newly
/// joining subscribers to inspect (not replayed automatically — the core
/// does not persist topic history across restarts, §6.6, §9 Open
/// Questions).
const RECENT_HISTORY_LEN: usize = 100;

struct Topic {
    subscribers: HashSet<ConnectionId>,
    recent: VecDeque<Envelope>,
}

impl Topic {
    fn new() -> Self {
        Self { subscribers: HashSet::new(), recent: VecDeque::new() }
    }

    fn record(&mut self, envelope: Envelope) {
        if self.recent.len() >= RECENT_HISTORY_LEN {
            self.recent.pop_front();
        }
        self.recent.push_back(envelope);
    }
}

/// Registry of all topics the broker has lazily created (§3 Topic
/// Lifecycle).
#[derive(Clone, Default)]
pub struct TopicRegistry {
    topics: Arc<DashMap<TopicName, Arc<RwLock<Topic>>>>,
    #[allow(dead_code)]
    capacity: ChannelCapacity,
}

impl TopicRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(capacity: ChannelCapacity) -> Self {
        Self { topics: Arc::new(DashMap::new()), capacity }
    }

    fn topic_handle(&self, name: &TopicName) -> Arc<RwLock<Topic>> {
        Arc::clone(self.topics.entry(name.clone()).or_insert_with(|| Arc::new(RwLock::new(Topic::new()))).value())
    }

    /// Subscribes `connection_id` to `topic`. Idempotent: re-subscribing an
    /// already-subscribed connection is a no-op (§3 Topic invariants).
    pub async fn subscribe(&self, topic: &TopicName, connection_id: ConnectionId) {
        let handle = self.topic_handle(topic);
        let mut guard = handle.write().await;
        guard.subscribers.insert(connection_id);
    }

    /// Removes a connection from every topic it was subscribed to. Called
    /// on disconnect (§3 Topic Lifecycle) or lazily as delivery attempts
    /// fail (§4.4.3).
    pub fn unsubscribe_everywhere(&self, connection_id: ConnectionId) {
        for entry in self.topics.iter() {
            let handle = Arc::clone(entry.value());
            tokio::spawn(async move {
                handle.write().await.subscribers.remove(&connection_id);
            });
        }
    }

    /// Publishes `envelope` to `topic`. Fan-out happens under the topic's
    /// write lock, which is released before this call returns (§4.4.4); a
    /// failed delivery to one subscriber never aborts delivery to others
    /// (§4.4.3). `publisher` never receives its own publish (§8 no-self-echo).
    ///
    /// Returns the number of subscribers the envelope was (attempted to be)
    /// delivered to.
    #[tracing::instrument(skip(self, connections, envelope), fields(topic = %topic))]
    pub async fn publish(
        &self,
        topic: &TopicName,
        envelope: Envelope,
        publisher: ConnectionId,
        connections: &DashMap<ConnectionId, Connection>,
    ) -> usize {
        let handle = self.topic_handle(topic);
        let mut guard = handle.write().await;
        guard.record(envelope.clone());

        let mut delivered = 0;
        let mut dead = Vec::new();
        for &subscriber in &guard.subscribers {
            if subscriber == publisher {
                continue;
            }
            let Some(conn) = connections.get(&subscriber) else {
                dead.push(subscriber);
                continue;
            };
            let payload = serde_json::json!({ "topic": topic.to_string(), "envelope": envelope });
            let response = Response::ok(uuid::Uuid::new_v4().to_string(), payload);
            if conn.try_send(response) {
                delivered += 1;
            } else {
                dead.push(subscriber);
            }
        }
        for subscriber in dead {
            guard.subscribers.remove(&subscriber);
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[tokio::test]
    async fn subscribing_twice_is_idempotent() {
        let registry = TopicRegistry::new(ChannelCapacity::try_from(100).unwrap());
        let topic = TopicName::try_from("events").unwrap();
        let conn = ConnectionId::generate();
        registry.subscribe(&topic, conn).await;
        registry.subscribe(&topic, conn).await;
        let handle = registry.topic_handle(&topic);
        assert_eq!(handle.read().await.subscribers.len(), 1);
    }

    #[tokio::test]
    async fn publish_does_not_deliver_to_the_publisher() {
        let registry = TopicRegistry::new(ChannelCapacity::try_from(100).unwrap());
        let topic = TopicName::try_from("events").unwrap();
        let connections: DashMap<ConnectionId, Connection> = DashMap::new();

        let publisher = ConnectionId::generate();
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        connections.insert(publisher, Connection::new(publisher, tx));
        registry.subscribe(&topic, publisher).await;

        let envelope = Envelope::new("greet", "agent-a", Bytes::from_static(b"hi"));
        let delivered = registry.publish(&topic, envelope, publisher, &connections).await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn publish_fans_out_to_all_other_subscribers() {
        let registry = TopicRegistry::new(ChannelCapacity::try_from(100).unwrap());
        let topic = TopicName::try_from("events").unwrap();
        let connections: DashMap<ConnectionId, Connection> = DashMap::new();

        let publisher = ConnectionId::generate();
        let s1 = ConnectionId::generate();
        let s2 = ConnectionId::generate();
        let (tx1, mut rx1) = tokio::sync::mpsc::channel(8);
        let (tx2, mut rx2) = tokio::sync::mpsc::channel(8);
        connections.insert(s1, Connection::new(s1, tx1));
        connections.insert(s2, Connection::new(s2, tx2));
        registry.subscribe(&topic, s1).await;
        registry.subscribe(&topic, s2).await;

        let envelope = Envelope::new("greet", "agent-a", Bytes::from_static(b"hi"));
        let delivered = registry.publish(&topic, envelope, publisher, &connections).await;
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }
}
