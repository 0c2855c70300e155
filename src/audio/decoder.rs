//! Uplink stream decoder
//!
//! Turns the realtime buffer's frame/loss sequence into continuous PCM:
//! good frames decode through the codec, losses are concealed, so the
//! consumer always receives audio covering the elapsed stream time.

use tracing::warn;

use super::codec::{create_codec, AudioCodec, CodecConfig, CodecError, PcmFormat, FRAME_DURATION};
use super::plc::PcmPlc;
use super::realtime::RealtimeEvent;

/// Decoder statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamDecoderStats {
    pub frames_decoded: u64,
    pub frames_failed: u64,
    pub losses_concealed: u64,
}

/// Decodes a paced uplink event sequence into continuous PCM
pub struct StreamDecoder {
    codec: Box<dyn AudioCodec>,
    plc: PcmPlc,
    stats: StreamDecoderStats,
}

impl StreamDecoder {
    pub fn new(config: &CodecConfig) -> Result<Self, CodecError> {
        let codec = create_codec(config)?;
        let format = codec.format();
        Ok(Self {
            codec,
            plc: PcmPlc::new(format),
            stats: StreamDecoderStats::default(),
        })
    }

    pub fn format(&self) -> PcmFormat {
        self.codec.format()
    }

    /// Decode one event into interleaved samples
    ///
    /// A frame that fails to decode is concealed like a loss of one
    /// frame duration.
    pub fn decode_event(&mut self, event: &RealtimeEvent) -> Vec<i16> {
        match event {
            RealtimeEvent::Frame(frame) => match self.codec.decode(frame.as_bytes()) {
                Ok(samples) => {
                    self.stats.frames_decoded += 1;
                    self.plc.store_frame(&samples);
                    samples
                }
                Err(e) => {
                    warn!(error = %e, "frame failed to decode, concealing");
                    self.stats.frames_failed += 1;
                    self.plc.conceal(FRAME_DURATION)
                }
            },
            RealtimeEvent::Loss(duration) => {
                self.stats.losses_concealed += 1;
                self.plc.conceal(*duration)
            }
        }
    }

    pub fn stats(&self) -> StreamDecoderStats {
        self.stats
    }
}
