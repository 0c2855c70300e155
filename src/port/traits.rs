//! Transport capabilities at the port seams
//!
//! A port composes two abstract links, each with a tx and an rx half.
//! The in-process pipe and the over-the-bus transport implement the same
//! contracts, so ports never know which one they are bound to.

use async_trait::async_trait;

use crate::protocol::{EpochMillis, Frame, SessionCommandEvent, StateEvent, StatsEvent};

use super::error::PortError;

/// Device-side sender: mic audio, state transitions, device stats
#[async_trait]
pub trait UplinkTx: Send + Sync {
    async fn send_audio_frame(&self, stamp: EpochMillis, frame: Frame) -> Result<(), PortError>;
    async fn send_state(&self, event: StateEvent) -> Result<(), PortError>;
    async fn send_stats(&self, event: StatsEvent) -> Result<(), PortError>;
}

/// Server-side sender: synthesized audio and control commands
#[async_trait]
pub trait DownlinkTx: Send + Sync {
    async fn send_audio_frame(&self, stamp: EpochMillis, frame: Frame) -> Result<(), PortError>;
    async fn send_command(&self, event: SessionCommandEvent) -> Result<(), PortError>;
}

/// A single-consumer lazy sequence
///
/// Each element is yielded exactly once; `None` signals end of stream.
#[async_trait]
pub trait EventSource<T: Send>: Send {
    async fn next(&mut self) -> Option<Result<T, PortError>>;
}

/// Receiving half of the uplink, consumed by a server port
pub struct UplinkRx {
    pub frames: Box<dyn EventSource<(EpochMillis, Frame)>>,
    pub states: Box<dyn EventSource<StateEvent>>,
    pub stats: Box<dyn EventSource<StatsEvent>>,
}

/// Receiving half of the downlink, consumed by a client port
pub struct DownlinkRx {
    pub frames: Box<dyn EventSource<(EpochMillis, Frame)>>,
    pub commands: Box<dyn EventSource<SessionCommandEvent>>,
}

/// Microphone seam on the device side
#[async_trait]
pub trait MicSource: Send {
    /// Fill `buf` with interleaved samples; `Ok(0)` at end of stream
    async fn read_frame(&mut self, buf: &mut [i16]) -> Result<usize, PortError>;
}

/// Speaker seam on the device side
#[async_trait]
pub trait SpeakerSink: Send {
    async fn write(&mut self, samples: &[i16]) -> Result<(), PortError>;
}
