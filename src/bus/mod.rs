//! Pub/sub bus bindings
//!
//! The abstract `MessageBus` with two implementations (a shared MQTT
//! broker and an embedded in-process bus for tests), the topic adapters
//! binding port transports onto it, and the listener that demultiplexes
//! inbound traffic into per-gear server ports.

mod adapter;
mod error;
mod listener;
mod local;
mod mqtt;

use async_trait::async_trait;

pub use adapter::{bind_downlink, subscribe_downlink, BusDownlinkTx, BusUplinkTx};
pub use error::BusError;
pub use listener::{Listener, ListenerConfig};
pub use local::{LocalBus, LocalBusClient};
pub use mqtt::{random_client_id, MqttBus, MqttBusConfig};

/// One message as delivered to subscribers
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A topic-based pub/sub connection
///
/// Implementations deliver subscribed messages on the channel handed
/// out at connection time; delivery is at-most-once.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Register a topic filter (`+` matches one segment)
    async fn subscribe(&self, filter: &str) -> Result<(), BusError>;
}
