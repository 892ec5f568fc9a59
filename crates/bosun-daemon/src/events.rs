use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};

/// How many events a subscriber may queue before publishing starts to
/// consider it dead.
const SUBSCRIBER_BUFFER: usize = 64;

/// How long a full subscriber is given to drain before it is dropped.
const SLOW_SUBSCRIBER_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, serde::Serialize)]
pub struct Event {
    pub topic: String,
    pub data: serde_json::Value,
}

struct Listener {
    id: u64,
    tx: mpsc::Sender<Event>,
}

/// Topic-keyed in-process publish/subscribe. One bus exists per instance
/// and one per environment; websocket sessions and internal listeners hang
/// off of it.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    topics: RwLock<HashMap<String, Vec<Listener>>>,
}

pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new listener on every topic in `topics` and returns the
    /// receiving half. All topics share one channel so delivery stays FIFO
    /// for the subscriber.
    pub async fn subscribe(&self, topics: &[&str]) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        let mut map = self.topics.write().await;
        for topic in topics {
            map.entry(topic.to_string())
                .or_default()
                .push(Listener { id, tx: tx.clone() });
        }

        Subscription { id, rx }
    }

    pub async fn unsubscribe(&self, id: u64) {
        let mut map = self.topics.write().await;
        for listeners in map.values_mut() {
            listeners.retain(|l| l.id != id);
        }
        map.retain(|_, listeners| !listeners.is_empty());
    }

    /// Delivers `data` to every subscriber of `topic`. Delivery never blocks
    /// the publisher beyond a short grace period: a subscriber that cannot
    /// accept the event in that window is assumed dead and removed.
    pub async fn publish(&self, topic: &str, data: serde_json::Value) {
        let event = Event {
            topic: topic.to_string(),
            data,
        };

        let mut dead = Vec::new();
        {
            let map = self.topics.read().await;
            let Some(listeners) = map.get(topic) else {
                return;
            };

            for l in listeners {
                match l.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(l.id),
                    Err(mpsc::error::TrySendError::Full(ev)) => {
                        match tokio::time::timeout(SLOW_SUBSCRIBER_GRACE, l.tx.send(ev)).await {
                            Ok(Ok(())) => {}
                            _ => dead.push(l.id),
                        }
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut map = self.topics.write().await;
            for listeners in map.values_mut() {
                listeners.retain(|l| !dead.contains(&l.id));
            }
            map.retain(|_, listeners| !listeners.is_empty());
        }
    }

    /// Convenience for string payloads, which is what the console topics
    /// carry.
    pub async fn publish_line(&self, topic: &str, line: impl Into<String>) {
        self.publish(topic, serde_json::Value::String(line.into()))
            .await;
    }

    /// Drops every subscriber and clears the topic map. Receivers observe
    /// their channel closing.
    pub async fn destroy(&self) {
        self.topics.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_matching_topic_only() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(&["status"]).await;
        let mut b = bus.subscribe(&["stats"]).await;

        bus.publish("status", serde_json::json!("running")).await;

        let ev = a.rx.recv().await.unwrap();
        assert_eq!(ev.topic, "status");
        assert_eq!(ev.data, serde_json::json!("running"));
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn one_channel_for_many_topics_preserves_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(&["console output", "status"]).await;

        bus.publish_line("console output", "one").await;
        bus.publish("status", serde_json::json!("starting")).await;
        bus.publish_line("console output", "two").await;

        assert_eq!(sub.rx.recv().await.unwrap().data, serde_json::json!("one"));
        assert_eq!(sub.rx.recv().await.unwrap().topic, "status");
        assert_eq!(sub.rx.recv().await.unwrap().data, serde_json::json!("two"));
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_not_waited_on() {
        let bus = EventBus::new();
        let sub = bus.subscribe(&["console output"]).await;
        // Fill the buffer without draining it.
        for i in 0..(SUBSCRIBER_BUFFER + 1) {
            bus.publish_line("console output", format!("line {i}")).await;
        }

        // The dead subscriber must be gone; publishing again reaches nobody
        // and does not block.
        bus.publish_line("console output", "after").await;
        let mut rx = sub.rx;
        // Buffered events are still readable, but the channel has been
        // closed by the bus side.
        let mut drained = 0;
        while rx.recv().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, SUBSCRIBER_BUFFER);
    }

    #[tokio::test]
    async fn unsubscribe_removes_listener() {
        let bus = EventBus::new();
        let sub = bus.subscribe(&["status"]).await;
        bus.unsubscribe(sub.id).await;

        bus.publish("status", serde_json::json!("offline")).await;
        let mut rx = sub.rx;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn destroy_closes_all_receivers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(&["status"]).await;
        let mut b = bus.subscribe(&["stats"]).await;
        bus.destroy().await;

        assert!(a.rx.recv().await.is_none());
        assert!(b.rx.recv().await.is_none());
    }
}
