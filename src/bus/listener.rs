//! Listener: wildcard subscription to per-gear ports
//!
//! Subscribes to the three uplink wildcards under a scope, demultiplexes
//! every inbound message onto its gear's server port (creating the port
//! and its downlink task on first contact), offers new ports on a
//! bounded accept queue, and releases ports that go quiet or announce
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::port::{ServerPort, ServerPortConfig};
use crate::protocol::{StampedFrame, State, StateEvent, StatsEvent, TopicKind, TopicScheme};

use super::adapter::BusDownlinkTx;
use super::error::BusError;
use super::{BusMessage, MessageBus};

/// Listener tunables
#[derive(Clone)]
pub struct ListenerConfig {
    /// Topic scope prefix; may be empty
    pub scope: String,
    /// Accept queue depth; offers beyond it are dropped with a warning
    pub accept_backlog: usize,
    /// Release ports with no uplink traffic for this long
    pub idle_timeout: Duration,
    /// Cadence of the idle sweep
    pub sweep_interval: Duration,
    pub port: ServerPortConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            scope: String::new(),
            accept_backlog: 16,
            idle_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            port: ServerPortConfig::default(),
        }
    }
}

impl ListenerConfig {
    fn validate(&self) -> Result<(), BusError> {
        if self.accept_backlog == 0 {
            return Err(BusError::Config("accept_backlog must be positive".into()));
        }
        if self.idle_timeout.is_zero() {
            return Err(BusError::Config("idle_timeout must be positive".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(BusError::Config("sweep_interval must be positive".into()));
        }
        Ok(())
    }
}

type PortMap = Arc<DashMap<String, Arc<ServerPort>>>;

/// Accepts gears appearing on the bus and owns their server ports
pub struct Listener {
    ports: PortMap,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<(String, Arc<ServerPort>)>>,
    cancel: CancellationToken,
}

impl Listener {
    /// Subscribe and start dispatching
    ///
    /// `inbound` must be the subscription stream of `bus`.
    pub async fn start(
        bus: Arc<dyn MessageBus>,
        inbound: mpsc::Receiver<BusMessage>,
        config: ListenerConfig,
    ) -> Result<Self, BusError> {
        config.validate()?;

        let scheme = TopicScheme::new(&config.scope);
        for filter in scheme.uplink_wildcards() {
            bus.subscribe(&filter).await?;
        }

        let ports: PortMap = Arc::new(DashMap::new());
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);
        let cancel = CancellationToken::new();

        tokio::spawn(dispatch(
            ports.clone(),
            bus,
            inbound,
            scheme,
            config.clone(),
            accept_tx,
            cancel.clone(),
        ));
        tokio::spawn(sweep(
            ports.clone(),
            config.idle_timeout,
            config.sweep_interval,
            cancel.clone(),
        ));

        Ok(Self {
            ports,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            cancel,
        })
    }

    /// Next newly appeared gear; `Closed` once the listener shuts down
    pub async fn accept(&self) -> Result<(String, Arc<ServerPort>), BusError> {
        let mut rx = self.accept_rx.lock().await;
        rx.recv().await.ok_or(BusError::Closed)
    }

    /// Look up a live port
    pub fn get(&self, gear_id: &str) -> Option<Arc<ServerPort>> {
        self.ports.get(gear_id).map(|entry| entry.value().clone())
    }

    /// Number of live ports
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Release one gear's port, closing it and everything it owns
    pub fn release(&self, gear_id: &str) {
        release_port(&self.ports, gear_id);
    }

    /// Shut the listener down; idempotent
    pub fn close(&self) {
        self.cancel.cancel();
        let ids: Vec<String> = self.ports.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            release_port(&self.ports, &id);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

fn release_port(ports: &DashMap<String, Arc<ServerPort>>, gear_id: &str) {
    if let Some((_, port)) = ports.remove(gear_id) {
        info!(gear = gear_id, "releasing port");
        port.close();
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    ports: PortMap,
    bus: Arc<dyn MessageBus>,
    mut inbound: mpsc::Receiver<BusMessage>,
    scheme: TopicScheme,
    config: ListenerConfig,
    accept_tx: mpsc::Sender<(String, Arc<ServerPort>)>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            m = inbound.recv() => match m {
                Some(m) => m,
                None => break,
            },
        };

        let Some((gear_id, kind)) = scheme.parse(&message.topic) else {
            debug!(topic = %message.topic, "ignoring unrecognized topic");
            continue;
        };

        let port = match ports.entry(gear_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                info!(gear = %gear_id, "new gear, accepting port");
                let port = Arc::new(ServerPort::with_cancellation(
                    gear_id.clone(),
                    config.port.clone(),
                    cancel.child_token(),
                ));
                entry.insert(port.clone());

                let adapter = BusDownlinkTx::new(bus.clone(), &scheme, &gear_id);
                let writer = port.clone();
                let writer_id = gear_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = writer.write_to(&adapter).await {
                        warn!(gear = %writer_id, error = %e, "downlink task failed");
                    }
                });

                if accept_tx.try_send((gear_id.clone(), port.clone())).is_err() {
                    warn!(gear = %gear_id, "accept queue full, dropping offer");
                }
                port
            }
        };

        match kind {
            TopicKind::InputAudio => match StampedFrame::from_bytes(&message.payload) {
                Ok(stamped) => port.handle_audio(stamped.stamp, stamped.frame),
                Err(e) => warn!(gear = %gear_id, error = %e, "dropping invalid audio frame"),
            },
            TopicKind::State => match serde_json::from_slice::<StateEvent>(&message.payload) {
                Ok(event) => {
                    let state = event.state;
                    port.handle_state(event);
                    if matches!(state, State::ShuttingDown | State::Sleeping) {
                        info!(gear = %gear_id, ?state, "gear going away");
                        release_port(&ports, &gear_id);
                    }
                }
                Err(e) => warn!(gear = %gear_id, error = %e, "dropping invalid state event"),
            },
            TopicKind::Stats => match serde_json::from_slice::<StatsEvent>(&message.payload) {
                Ok(event) => port.handle_stats(event),
                Err(e) => warn!(gear = %gear_id, error = %e, "dropping invalid stats event"),
            },
            // Downlink kinds never match the uplink wildcards
            TopicKind::OutputAudio | TopicKind::Command => {}
        }
    }
    debug!("listener dispatch loop ended");
}

async fn sweep(
    ports: PortMap,
    idle_timeout: Duration,
    sweep_interval: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(sweep_interval);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let now = crate::protocol::EpochMillis::now();
        let expired: Vec<String> = ports
            .iter()
            .filter(|entry| now - entry.value().last_active() > idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();
        for gear_id in expired {
            info!(gear = %gear_id, "idle timeout");
            release_port(&ports, &gear_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::port::UplinkData;
    use crate::protocol::{EpochMillis, Frame};

    async fn start_listener(
        bus: &LocalBus,
        config: ListenerConfig,
    ) -> (Listener, Arc<dyn MessageBus>) {
        let (server_client, inbound) = bus.client();
        let server_client: Arc<dyn MessageBus> = Arc::new(server_client);
        let listener = Listener::start(server_client.clone(), inbound, config)
            .await
            .unwrap();
        (listener, server_client)
    }

    fn state_payload(time: i64, state: &str) -> Vec<u8> {
        format!(r#"{{"v":1,"t":{time},"s":"{state}","ut":{time}}}"#).into_bytes()
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let bus = LocalBus::new();
        let (client, inbound) = bus.client();
        let config = ListenerConfig {
            accept_backlog: 0,
            ..ListenerConfig::default()
        };
        assert!(matches!(
            Listener::start(Arc::new(client), inbound, config).await,
            Err(BusError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_accepts_new_gear_and_routes_messages() {
        let bus = LocalBus::new();
        let (listener, _server) = start_listener(&bus, ListenerConfig::default()).await;

        let (device, _rx) = bus.client();
        device
            .publish("device/g1/state", state_payload(1000, "ready"))
            .await
            .unwrap();

        let (gear_id, port) = listener.accept().await.unwrap();
        assert_eq!(gear_id, "g1");
        match port.poll().await.unwrap() {
            UplinkData::State(event) => assert_eq!(event.state, State::Ready),
            other => panic!("unexpected {other:?}"),
        }

        // Audio for the same gear reuses the port
        let stamped =
            StampedFrame::new(EpochMillis::from_millis(5), Frame::new(vec![0xF8]).unwrap());
        device
            .publish("device/g1/input_audio_stream", stamped.to_bytes())
            .await
            .unwrap();
        match port.poll().await.unwrap() {
            UplinkData::Audio { stamp, .. } => assert_eq!(stamp.as_millis(), 5),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(listener.len(), 1);
    }

    #[tokio::test]
    async fn test_shutting_down_releases_port() {
        let bus = LocalBus::new();
        let (listener, _server) = start_listener(&bus, ListenerConfig::default()).await;

        let (device, _rx) = bus.client();
        device
            .publish("device/g2/state", state_payload(1000, "ready"))
            .await
            .unwrap();
        let (_, port) = listener.accept().await.unwrap();

        device
            .publish("device/g2/state", state_payload(2000, "shutting_down"))
            .await
            .unwrap();

        // The release is driven by the dispatch task; wait for it
        tokio::time::timeout(Duration::from_secs(1), async {
            while listener.get("g2").is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("port released");
        assert!(port.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_payloads_are_dropped() {
        let bus = LocalBus::new();
        let (listener, _server) = start_listener(&bus, ListenerConfig::default()).await;

        let (device, _rx) = bus.client();
        device
            .publish("device/g3/input_audio_stream", vec![0xFF, 0x00])
            .await
            .unwrap();
        let (_, port) = listener.accept().await.unwrap();

        // Malformed frame dropped, valid state still flows
        device
            .publish("device/g3/state", state_payload(1, "recording"))
            .await
            .unwrap();
        match port.poll().await.unwrap() {
            UplinkData::State(event) => assert_eq!(event.state, State::Recording),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_idle_sweeper_releases_quiet_ports() {
        let bus = LocalBus::new();
        let config = ListenerConfig {
            idle_timeout: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(20),
            ..ListenerConfig::default()
        };
        let (listener, _server) = start_listener(&bus, config).await;

        let (device, _rx) = bus.client();
        device
            .publish("device/g4/state", state_payload(1, "ready"))
            .await
            .unwrap();
        let (_, port) = listener.accept().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while listener.get("g4").is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("idle port released");
        assert!(port.is_closed());
    }

    #[tokio::test]
    async fn test_close_ends_accept() {
        let bus = LocalBus::new();
        let (listener, _server) = start_listener(&bus, ListenerConfig::default()).await;
        listener.close();
        listener.close();
        assert!(matches!(listener.accept().await, Err(BusError::Closed)));
    }
}
