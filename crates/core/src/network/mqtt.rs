//! MQTT transport.

use crate::network::bus::{BusError, BusMessage, MessageBus, Qos};
use async_trait::async_trait;
use dcp_protocol::config_models::BrokerConfig;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Largest packet accepted in either direction.
const MAX_PACKET_SIZE: usize = 256 * 1024 * 1024;

fn to_mqtt(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

/// Connection to an MQTT broker.
///
/// Subscriptions are remembered and renewed after every reconnect.
pub struct MqttBus {
    client: AsyncClient,
    topics: Arc<Mutex<Vec<String>>>,
    event_loop: JoinHandle<()>,
}

impl MqttBus {
    /// Connect to the broker described by `config`.
    ///
    /// Returns the bus and the stream of incoming publishes. The connection
    /// is driven by a background task that retries after
    /// `reconnect_delay_ms` whenever the broker is unreachable.
    pub fn connect(
        config: &BrokerConfig,
        participant_id: &str,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<BusMessage>) {
        let client_id = format!("{participant_id}_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        let (client, mut event_loop) = AsyncClient::new(options, config.capacity);
        let (tx, rx) = mpsc::unbounded_channel();
        let topics: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let reconnect_delay = Duration::from_millis(config.reconnect_delay_ms);

        let resubscribe_client = client.clone();
        let resubscribe_topics = topics.clone();
        let host = format!("{}:{}", config.host, config.port);
        let event_loop = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = BusMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        if tx.send(message).is_err() {
                            debug!("MQTT receiver dropped, stopping event loop");
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(broker = %host, "MQTT connection up");
                        let topics = resubscribe_topics.lock().clone();
                        for topic in topics {
                            if let Err(e) = resubscribe_client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                                warn!("Failed to renew subscription to {topic}: {e}");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(broker = %host, "MQTT connection error: {e}");
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
        });

        let bus = Self {
            client,
            topics,
            event_loop,
        };
        (Arc::new(bus), rx)
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        {
            let mut topics = self.topics.lock();
            if !topics.iter().any(|t| t == topic) {
                topics.push(topic.to_string());
            }
        }
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| BusError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), BusError> {
        self.client
            .publish(topic, to_mqtt(qos), false, payload)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}
