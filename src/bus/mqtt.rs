//! MQTT bus binding
//!
//! Wraps a rumqttc client: publishes fire-and-forget at QoS 0 and
//! forwards every inbound publish into a single bounded channel.
//! Connection errors back off and the event loop reconnects on its own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::error::BusError;
use super::{BusMessage, MessageBus};

/// Connection settings for the shared broker
#[derive(Debug, Clone)]
pub struct MqttBusConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Capacity of the inbound message channel
    pub channel_capacity: usize,
    pub keep_alive: Duration,
}

impl Default for MqttBusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: random_client_id("gearlink"),
            channel_capacity: 1024,
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// A client id that survives several processes on one broker
pub fn random_client_id(prefix: &str) -> String {
    format!("{}-{:08x}", prefix, rand::random::<u32>())
}

/// One MQTT connection shared by publishers and the subscriber stream
pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    /// Open a connection; inbound publishes arrive on the returned
    /// channel until the bus is dropped.
    pub fn connect(config: MqttBusConfig) -> (Arc<Self>, mpsc::Receiver<BusMessage>) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);

        let (client, event_loop) = AsyncClient::new(options, 64);
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        tokio::spawn(drive_event_loop(event_loop, tx));

        info!(host = %config.host, port = config.port, id = %config.client_id, "MQTT bus connecting");
        (Arc::new(Self { client }), rx)
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))
    }

    async fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        self.client
            .subscribe(filter, QoS::AtMostOnce)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        info!(filter, "MQTT subscribed");
        Ok(())
    }
}

async fn drive_event_loop(mut event_loop: EventLoop, tx: mpsc::Sender<BusMessage>) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = BusMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if tx.send(message).await.is_err() {
                    debug!("inbound channel closed, stopping MQTT event loop");
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "MQTT connection error, retrying in 1s");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
