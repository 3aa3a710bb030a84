//! In-process publish/subscribe bus.
//!
//! One `tokio::sync::broadcast` channel is created per topic, lazily. A
//! broadcast channel already gives us the two properties wanted here: FIFO
//! delivery per `(topic, subscriber)` pair, and a slow subscriber dropping
//! the oldest messages instead of blocking the publisher — that's exactly
//! what happens when a receiver falls behind the channel's ring buffer and
//! gets `RecvError::Lagged`, which [`Subscription::recv`] treats as "skip
//! ahead", not an error.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Value,
}

struct Topic {
    tx: broadcast::Sender<BusMessage>,
}

/// The shared bus handle. Cloning is cheap (an `Arc` underneath); every
/// subsystem that publishes or subscribes holds a clone.
#[derive(Clone)]
pub struct PubSubBus {
    topics: Arc<DashMap<String, Topic>>,
}

impl Default for PubSubBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSubBus {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
        }
    }

    fn topic_sender(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic {
                tx: broadcast::channel(CHANNEL_CAPACITY).0,
            })
            .tx
            .clone()
    }

    /// Deliver `msg` to every current subscriber of `topic`. Best-effort:
    /// if nobody is subscribed, the send target count is zero and the
    /// message is simply dropped.
    pub fn publish(&self, topic: &str, payload: Value) {
        let tx = self.topic_sender(topic);
        let _ = tx.send(BusMessage {
            topic: topic.to_string(),
            payload,
        });
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let tx = self.topic_sender(topic);
        Subscription {
            topic: topic.to_string(),
            rx: tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|t| t.tx.receiver_count())
            .unwrap_or(0)
    }
}

/// A handle yielding messages in publication order for the topic it was
/// created from. Dropping it (or calling [`Subscription::unsubscribe`],
/// equivalent) detaches without affecting delivery to other subscribers.
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<BusMessage>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Await the next message, silently skipping past any gap caused by a
    /// slow consumer falling behind (the "drop oldest" policy).
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}
