//! Audio transport building blocks
//!
//! Jitter buffering, wall-clock-paced delivery, multi-track PCM mixing,
//! and the codec boundary.

mod codec;
mod decoder;
mod error;
mod jitter;
mod link;
mod mixer;
mod plc;
mod realtime;

pub use codec::{
    create_codec, AudioCodec, CodecConfig, CodecError, CodecType, PcmCodec, PcmFormat,
    FRAME_DURATION,
};
#[cfg(feature = "opus-codec")]
pub use codec::OpusCodec;
pub use decoder::{StreamDecoder, StreamDecoderStats};
pub use error::AudioError;
pub use jitter::{JitterBuffer, JitterPoll, JitterStats, DEFAULT_MAX_DURATION};
pub use link::{LinkMonitor, LinkQuality};
pub use mixer::{Mixer, MixerOptions, Track, TrackCallback, TrackController};
pub use plc::PcmPlc;
pub use realtime::{RealtimeBuffer, RealtimeEvent, READ_TICK, STALL_THRESHOLD};
