//! Bus-backed transport adapters
//!
//! Bind the abstract port tx/rx contracts to topics on a message bus:
//! audio travels as stamped-frame binaries, state, stats, and commands
//! as one JSON object per message.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::port::{DownlinkRx, DownlinkTx, EventSource, PortError, UplinkTx};
use crate::protocol::{
    EpochMillis, Frame, SessionCommandEvent, StampedFrame, StateEvent, StatsEvent, TopicKind,
    TopicScheme,
};

use super::error::BusError;
use super::{BusMessage, MessageBus};

/// Demux channel capacity on the device side
const DEMUX_CAPACITY: usize = 64;

fn transport_error(e: BusError) -> PortError {
    PortError::Transport(e.to_string())
}

/// Device-side uplink sender publishing to this gear's topics
pub struct BusUplinkTx {
    bus: Arc<dyn MessageBus>,
    audio_topic: String,
    state_topic: String,
    stats_topic: String,
}

impl BusUplinkTx {
    pub fn new(bus: Arc<dyn MessageBus>, scheme: &TopicScheme, gear_id: &str) -> Self {
        Self {
            bus,
            audio_topic: scheme.topic(gear_id, TopicKind::InputAudio),
            state_topic: scheme.topic(gear_id, TopicKind::State),
            stats_topic: scheme.topic(gear_id, TopicKind::Stats),
        }
    }
}

#[async_trait]
impl UplinkTx for BusUplinkTx {
    async fn send_audio_frame(&self, stamp: EpochMillis, frame: Frame) -> Result<(), PortError> {
        let payload = StampedFrame::new(stamp, frame).to_bytes();
        self.bus
            .publish(&self.audio_topic, payload)
            .await
            .map_err(transport_error)
    }

    async fn send_state(&self, event: StateEvent) -> Result<(), PortError> {
        let payload = serde_json::to_vec(&event).map_err(crate::protocol::ProtocolError::from)?;
        self.bus
            .publish(&self.state_topic, payload)
            .await
            .map_err(transport_error)
    }

    async fn send_stats(&self, event: StatsEvent) -> Result<(), PortError> {
        let payload = serde_json::to_vec(&event).map_err(crate::protocol::ProtocolError::from)?;
        self.bus
            .publish(&self.stats_topic, payload)
            .await
            .map_err(transport_error)
    }
}

/// Server-side downlink sender publishing to this gear's topics
pub struct BusDownlinkTx {
    bus: Arc<dyn MessageBus>,
    audio_topic: String,
    command_topic: String,
}

impl BusDownlinkTx {
    pub fn new(bus: Arc<dyn MessageBus>, scheme: &TopicScheme, gear_id: &str) -> Self {
        Self {
            bus,
            audio_topic: scheme.topic(gear_id, TopicKind::OutputAudio),
            command_topic: scheme.topic(gear_id, TopicKind::Command),
        }
    }
}

#[async_trait]
impl DownlinkTx for BusDownlinkTx {
    async fn send_audio_frame(&self, stamp: EpochMillis, frame: Frame) -> Result<(), PortError> {
        let payload = StampedFrame::new(stamp, frame).to_bytes();
        self.bus
            .publish(&self.audio_topic, payload)
            .await
            .map_err(transport_error)
    }

    async fn send_command(&self, event: SessionCommandEvent) -> Result<(), PortError> {
        let payload = serde_json::to_vec(&event).map_err(crate::protocol::ProtocolError::from)?;
        self.bus
            .publish(&self.command_topic, payload)
            .await
            .map_err(transport_error)
    }
}

struct ChannelSource<T>(mpsc::Receiver<T>);

#[async_trait]
impl<T: Send> EventSource<T> for ChannelSource<T> {
    async fn next(&mut self) -> Option<Result<T, PortError>> {
        self.0.recv().await.map(Ok)
    }
}

/// Subscribe a device-side connection to its downlink topics
pub async fn subscribe_downlink(
    bus: &dyn MessageBus,
    scheme: &TopicScheme,
    gear_id: &str,
) -> Result<(), BusError> {
    bus.subscribe(&scheme.topic(gear_id, TopicKind::OutputAudio))
        .await?;
    bus.subscribe(&scheme.topic(gear_id, TopicKind::Command))
        .await?;
    Ok(())
}

/// Split a device connection's inbound stream into the downlink halves
///
/// Malformed payloads are logged and dropped; the task ends with the
/// inbound channel.
pub fn bind_downlink(
    mut inbound: mpsc::Receiver<BusMessage>,
    scheme: TopicScheme,
) -> DownlinkRx {
    let (frame_tx, frame_rx) = mpsc::channel(DEMUX_CAPACITY);
    let (command_tx, command_rx) = mpsc::channel(DEMUX_CAPACITY);

    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            let Some((_, kind)) = scheme.parse(&message.topic) else {
                continue;
            };
            match kind {
                TopicKind::OutputAudio => match StampedFrame::from_bytes(&message.payload) {
                    Ok(stamped) => {
                        if frame_tx.send((stamped.stamp, stamped.frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping invalid downlink frame"),
                },
                TopicKind::Command => {
                    match serde_json::from_slice::<SessionCommandEvent>(&message.payload) {
                        Ok(event) => {
                            if command_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping invalid command"),
                    }
                }
                _ => {}
            }
        }
    });

    DownlinkRx {
        frames: Box::new(ChannelSource(frame_rx)),
        commands: Box::new(ChannelSource(command_rx)),
    }
}
