//! Publish/subscribe message bus.
//!
//! Nodes talk through a [`MessageBus`]. Production nodes use the MQTT
//! implementation in [`crate::network::mqtt`]; tests and embedded setups use
//! the [`InMemoryBroker`] defined here.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Delivery guarantee of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Failed to encode message for {topic}: {source}")]
    Encode {
        topic: String,
        source: serde_json::Error,
    },

    #[error("Message bus is closed")]
    Closed,
}

/// Transport used by the coordination layer.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), BusError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), BusError>;
}

/// Serialize `message` as JSON and publish it.
pub async fn publish_json<T: Serialize + Sync>(
    bus: &dyn MessageBus,
    topic: &str,
    message: &T,
    qos: Qos,
) -> Result<(), BusError> {
    let payload = serde_json::to_vec(message).map_err(|source| BusError::Encode {
        topic: topic.to_string(),
        source,
    })?;
    bus.publish(topic, payload, qos).await
}

struct Subscriber {
    topics: Arc<Mutex<HashSet<String>>>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

/// Process-local broker. Every connection receives the messages published
/// on topics it subscribed to, including its own.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection and the stream of messages delivered to it.
    pub fn connect(&self) -> (Arc<InMemoryBus>, mpsc::UnboundedReceiver<BusMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let topics = Arc::new(Mutex::new(HashSet::new()));
        self.subscribers.lock().push(Subscriber {
            topics: topics.clone(),
            tx,
        });
        let bus = InMemoryBus {
            broker: self.clone(),
            topics,
        };
        (Arc::new(bus), rx)
    }

    fn route(&self, message: &BusMessage) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| !subscriber.tx.is_closed());
        for subscriber in subscribers.iter() {
            if subscriber.topics.lock().contains(&message.topic) {
                let _ = subscriber.tx.send(message.clone());
            }
        }
    }
}

/// One connection to an [`InMemoryBroker`].
pub struct InMemoryBus {
    broker: InMemoryBroker,
    topics: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.topics.lock().insert(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, _qos: Qos) -> Result<(), BusError> {
        self.broker.route(&BusMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}
