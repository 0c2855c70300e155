//! In-process pipe transport
//!
//! Channel-backed implementations of the four transport contracts, used
//! by tests and loopback runs to wire a client port straight into a
//! server port without a bus.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::{EpochMillis, Frame, SessionCommandEvent, StateEvent, StatsEvent};

use super::error::PortError;
use super::traits::{DownlinkRx, DownlinkTx, EventSource, UplinkRx, UplinkTx};

/// Default per-stream capacity
const PIPE_CAPACITY: usize = 64;

/// An `EventSource` over a plain channel
pub(crate) struct ChannelSource<T>(pub(crate) mpsc::Receiver<T>);

#[async_trait]
impl<T: Send> EventSource<T> for ChannelSource<T> {
    async fn next(&mut self) -> Option<Result<T, PortError>> {
        self.0.recv().await.map(Ok)
    }
}

/// Sender half of an in-process uplink
///
/// Sends after the receiving half is gone are silently dropped, not an
/// error, so a still-open port keeps running when its peer closes.
pub struct PipeUplinkTx {
    frames: mpsc::Sender<(EpochMillis, Frame)>,
    states: mpsc::Sender<StateEvent>,
    stats: mpsc::Sender<StatsEvent>,
}

#[async_trait]
impl UplinkTx for PipeUplinkTx {
    async fn send_audio_frame(&self, stamp: EpochMillis, frame: Frame) -> Result<(), PortError> {
        let _ = self.frames.send((stamp, frame)).await;
        Ok(())
    }

    async fn send_state(&self, event: StateEvent) -> Result<(), PortError> {
        let _ = self.states.send(event).await;
        Ok(())
    }

    async fn send_stats(&self, event: StatsEvent) -> Result<(), PortError> {
        let _ = self.stats.send(event).await;
        Ok(())
    }
}

/// Sender half of an in-process downlink
///
/// Sends after the receiving half is gone are silently dropped, not an
/// error, so a still-open port keeps running when its peer closes.
pub struct PipeDownlinkTx {
    frames: mpsc::Sender<(EpochMillis, Frame)>,
    commands: mpsc::Sender<SessionCommandEvent>,
}

#[async_trait]
impl DownlinkTx for PipeDownlinkTx {
    async fn send_audio_frame(&self, stamp: EpochMillis, frame: Frame) -> Result<(), PortError> {
        let _ = self.frames.send((stamp, frame)).await;
        Ok(())
    }

    async fn send_command(&self, event: SessionCommandEvent) -> Result<(), PortError> {
        let _ = self.commands.send(event).await;
        Ok(())
    }
}

/// Create an uplink pipe; dropping the tx ends the rx streams
pub fn uplink_pipe() -> (PipeUplinkTx, UplinkRx) {
    let (frame_tx, frame_rx) = mpsc::channel(PIPE_CAPACITY);
    let (state_tx, state_rx) = mpsc::channel(PIPE_CAPACITY);
    let (stats_tx, stats_rx) = mpsc::channel(PIPE_CAPACITY);
    (
        PipeUplinkTx {
            frames: frame_tx,
            states: state_tx,
            stats: stats_tx,
        },
        UplinkRx {
            frames: Box::new(ChannelSource(frame_rx)),
            states: Box::new(ChannelSource(state_rx)),
            stats: Box::new(ChannelSource(stats_rx)),
        },
    )
}

/// Create a downlink pipe; dropping the tx ends the rx streams
pub fn downlink_pipe() -> (PipeDownlinkTx, DownlinkRx) {
    let (frame_tx, frame_rx) = mpsc::channel(PIPE_CAPACITY);
    let (command_tx, command_rx) = mpsc::channel(PIPE_CAPACITY);
    (
        PipeDownlinkTx {
            frames: frame_tx,
            commands: command_tx,
        },
        DownlinkRx {
            frames: Box::new(ChannelSource(frame_rx)),
            commands: Box::new(ChannelSource(command_rx)),
        },
    )
}
