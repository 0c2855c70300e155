//! Embedded in-process bus
//!
//! A tiny broker with MQTT-style single-level `+` wildcard matching,
//! used by tests and loopback runs. Every client gets its own inbound
//! channel; a publish is delivered to every client whose filters match.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::error::BusError;
use super::{BusMessage, MessageBus};

/// Per-client inbound channel capacity
const CLIENT_CHANNEL_CAPACITY: usize = 256;

struct Registration {
    filters: Vec<String>,
    tx: mpsc::Sender<BusMessage>,
}

struct Inner {
    clients: Mutex<HashMap<u64, Registration>>,
    next_id: Mutex<u64>,
}

/// The broker; create one per test or loopback run
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<Inner>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                clients: Mutex::new(HashMap::new()),
                next_id: Mutex::new(0),
            }),
        }
    }

    /// Attach a client connection
    pub fn client(&self) -> (LocalBusClient, mpsc::Receiver<BusMessage>) {
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        let id = {
            let mut next_id = self.inner.next_id.lock();
            let id = *next_id;
            *next_id += 1;
            id
        };
        self.inner.clients.lock().insert(
            id,
            Registration {
                filters: Vec::new(),
                tx,
            },
        );
        (
            LocalBusClient {
                id,
                inner: self.inner.clone(),
            },
            rx,
        )
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One connection to the embedded broker
pub struct LocalBusClient {
    id: u64,
    inner: Arc<Inner>,
}

#[async_trait]
impl MessageBus for LocalBusClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let targets: Vec<mpsc::Sender<BusMessage>> = {
            let clients = self.inner.clients.lock();
            clients
                .values()
                .filter(|r| r.filters.iter().any(|f| topic_matches(f, topic)))
                .map(|r| r.tx.clone())
                .collect()
        };
        for target in targets {
            let message = BusMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            // A vanished subscriber is not a publish error
            let _ = target.send(message).await;
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        let mut clients = self.inner.clients.lock();
        let registration = clients
            .get_mut(&self.id)
            .ok_or(BusError::Closed)?;
        registration.filters.push(filter.to_string());
        Ok(())
    }
}

impl Drop for LocalBusClient {
    fn drop(&mut self) {
        self.inner.clients.lock().remove(&self.id);
    }
}

/// MQTT-style filter match: `+` matches one segment, `#` the rest
fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_segments = filter.split('/');
    let mut topic_segments = topic.split('/');
    loop {
        match (filter_segments.next(), topic_segments.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
