//! Audio codec abstraction for the voice up/downlinks
//!
//! Provides a unified interface over the compressed-frame boundary.
//! The PCM passthrough codec is always available; Opus requires the
//! `opus-codec` feature and the libopus system library.

use std::time::Duration;

use thiserror::Error;

/// Duration of one voice frame on both links
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Uncompressed sample layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels (1 = mono, 2 = stereo)
    pub channels: u16,
}

impl PcmFormat {
    /// Voice-grade default: 16 kHz mono
    pub const VOICE: PcmFormat = PcmFormat {
        sample_rate: 16_000,
        channels: 1,
    };

    /// Interleaved sample count covering `duration`
    pub fn samples_in(&self, duration: Duration) -> usize {
        let per_channel = self.sample_rate as u128 * duration.as_micros() / 1_000_000;
        per_channel as usize * self.channels as usize
    }

    /// Duration covered by `samples` interleaved samples
    pub fn duration_of(&self, samples: usize) -> Duration {
        let per_channel = samples / self.channels.max(1) as usize;
        Duration::from_micros(per_channel as u64 * 1_000_000 / self.sample_rate as u64)
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        PcmFormat::VOICE
    }
}

/// Codec type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecType {
    /// Framed PCM passthrough (tests, loopback)
    #[default]
    Pcm,
    /// Opus voice codec
    Opus,
}

impl CodecType {
    /// Check if this codec type is available in the current build
    pub fn is_available(&self) -> bool {
        match self {
            CodecType::Pcm => true,
            #[cfg(feature = "opus-codec")]
            CodecType::Opus => true,
            #[cfg(not(feature = "opus-codec"))]
            CodecType::Opus => false,
        }
    }
}

/// Codec configuration
#[derive(Debug, Clone, Default)]
pub struct CodecConfig {
    pub codec_type: CodecType,
    pub format: PcmFormat,
    /// Bitrate in bits per second, Opus only
    pub bitrate: u32,
}

/// Errors that can occur during codec operations
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Codec initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Encode failed: {0}")]
    EncodeFailed(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Invalid frame size: expected {expected}, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },

    #[error("Invalid data format: {0}")]
    InvalidData(String),

    #[error("Codec not available: {0}")]
    NotAvailable(String),
}

/// Trait for voice codecs
///
/// Encoders may return an empty packet for a silent frame (discontinuous
/// transmission); callers advance their clocks without sending anything.
pub trait AudioCodec: Send {
    /// Encode one frame of interleaved i16 samples
    fn encode(&mut self, samples: &[i16]) -> Result<Vec<u8>, CodecError>;

    /// Decode one compressed packet to interleaved i16 samples
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, CodecError>;

    /// Sample layout on the uncompressed side
    fn format(&self) -> PcmFormat;

    /// Interleaved samples per frame
    fn frame_samples(&self) -> usize {
        self.format().samples_in(FRAME_DURATION)
    }
}

// Table-of-contents byte announcing one 20ms sub-frame, so framed PCM
// packets stay duration-derivable like compressed ones.
fn pcm_toc(format: &PcmFormat) -> u8 {
    if format.channels == 2 {
        0xFC
    } else {
        0xF8
    }
}

/// Framed PCM passthrough (no compression)
///
/// One leading table-of-contents byte followed by little-endian i16
/// samples. Used where bandwidth is not a concern.
pub struct PcmCodec {
    format: PcmFormat,
}

impl PcmCodec {
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            format: config.format,
        }
    }
}

impl AudioCodec for PcmCodec {
    fn encode(&mut self, samples: &[i16]) -> Result<Vec<u8>, CodecError> {
        let expected = self.frame_samples();
        if samples.len() != expected {
            return Err(CodecError::InvalidFrameSize {
                expected,
                actual: samples.len(),
            });
        }
        let mut bytes = Vec::with_capacity(1 + samples.len() * 2);
        bytes.push(pcm_toc(&self.format));
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        Ok(bytes)
    }

    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, CodecError> {
        if data.is_empty() {
            return Err(CodecError::InvalidData("empty packet".into()));
        }
        let body = &data[1..];
        if body.len() % 2 != 0 {
            return Err(CodecError::InvalidData(format!(
                "PCM body length {} is not a multiple of 2",
                body.len()
            )));
        }
        Ok(body
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect())
    }

    fn format(&self) -> PcmFormat {
        self.format
    }
}

// Opus codec implementation (requires opus-codec feature)
#[cfg(feature = "opus-codec")]
mod opus_impl {
    use super::*;

    /// Opus voice codec wrapper
    pub struct OpusCodec {
        encoder: opus::Encoder,
        decoder: opus::Decoder,
        format: PcmFormat,
        encode_buffer: Vec<u8>,
    }

    impl OpusCodec {
        pub fn new(config: &CodecConfig) -> Result<Self, CodecError> {
            let channels = match config.format.channels {
                1 => opus::Channels::Mono,
                2 => opus::Channels::Stereo,
                n => {
                    return Err(CodecError::InitializationFailed(format!(
                        "Unsupported channel count: {}",
                        n
                    )))
                }
            };

            let mut encoder = opus::Encoder::new(
                config.format.sample_rate,
                channels,
                opus::Application::Voip,
            )
            .map_err(|e| {
                CodecError::InitializationFailed(format!("Encoder init failed: {}", e))
            })?;

            if config.bitrate > 0 {
                encoder
                    .set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
                    .map_err(|e| {
                        CodecError::InitializationFailed(format!("Set bitrate failed: {}", e))
                    })?;
            }

            let decoder =
                opus::Decoder::new(config.format.sample_rate, channels).map_err(|e| {
                    CodecError::InitializationFailed(format!("Decoder init failed: {}", e))
                })?;

            Ok(Self {
                encoder,
                decoder,
                format: config.format,
                // Max Opus packet size is ~1275 bytes
                encode_buffer: vec![0u8; 1500],
            })
        }
    }

    impl AudioCodec for OpusCodec {
        fn encode(&mut self, samples: &[i16]) -> Result<Vec<u8>, CodecError> {
            let expected = self.frame_samples();
            if samples.len() != expected {
                return Err(CodecError::InvalidFrameSize {
                    expected,
                    actual: samples.len(),
                });
            }

            let len = self
                .encoder
                .encode(samples, &mut self.encode_buffer)
                .map_err(|e| CodecError::EncodeFailed(format!("Opus encode failed: {}", e)))?;

            // DTX packets of up to two bytes carry no audio
            if len <= 2 {
                return Ok(Vec::new());
            }
            Ok(self.encode_buffer[..len].to_vec())
        }

        fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, CodecError> {
            let mut output = vec![0i16; self.frame_samples()];
            let decoded = self
                .decoder
                .decode(data, &mut output, false)
                .map_err(|e| CodecError::DecodeFailed(format!("Opus decode failed: {}", e)))?;
            output.truncate(decoded * self.format.channels as usize);
            Ok(output)
        }

        fn format(&self) -> PcmFormat {
            self.format
        }
    }
}

#[cfg(feature = "opus-codec")]
pub use opus_impl::OpusCodec;

/// Create a codec based on configuration
pub fn create_codec(config: &CodecConfig) -> Result<Box<dyn AudioCodec>, CodecError> {
    match config.codec_type {
        CodecType::Pcm => Ok(Box::new(PcmCodec::new(config))),
        #[cfg(feature = "opus-codec")]
        CodecType::Opus => Ok(Box::new(OpusCodec::new(config)?)),
        #[cfg(not(feature = "opus-codec"))]
        CodecType::Opus => Err(CodecError::NotAvailable(
            "Opus codec requires the 'opus-codec' feature and libopus system library".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;

    #[test]
    fn test_format_arithmetic() {
        let format = PcmFormat::VOICE;
        assert_eq!(format.samples_in(FRAME_DURATION), 320);
        assert_eq!(format.duration_of(320), FRAME_DURATION);

        let stereo = PcmFormat {
            sample_rate: 48_000,
            channels: 2,
        };
        assert_eq!(stereo.samples_in(FRAME_DURATION), 1920);
    }

    #[test]
    fn test_pcm_roundtrip() {
        let config = CodecConfig::default();
        let mut codec = PcmCodec::new(&config);

        let samples: Vec<i16> = (0..320).map(|i| (i * 17 - 2000) as i16).collect();
        let encoded = codec.encode(&samples).unwrap();
        assert_eq!(encoded.len(), 1 + samples.len() * 2);

        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_pcm_frames_are_duration_derivable() {
        let mut codec = PcmCodec::new(&CodecConfig::default());
        let encoded = codec.encode(&vec![0i16; 320]).unwrap();
        let frame = Frame::new(encoded).unwrap();
        assert_eq!(frame.duration(), FRAME_DURATION);
        assert!(!frame.is_stereo());
    }

    #[test]
    fn test_pcm_rejects_wrong_frame_size() {
        let mut codec = PcmCodec::new(&CodecConfig::default());
        assert!(matches!(
            codec.encode(&[0i16; 100]),
            Err(CodecError::InvalidFrameSize {
                expected: 320,
                actual: 100
            })
        ));
    }

    #[test]
    fn test_codec_availability() {
        assert!(CodecType::Pcm.is_available());

        #[cfg(feature = "opus-codec")]
        assert!(CodecType::Opus.is_available());

        #[cfg(not(feature = "opus-codec"))]
        assert!(!CodecType::Opus.is_available());
    }

    #[cfg(feature = "opus-codec")]
    mod opus_tests {
        use super::*;

        #[test]
        fn test_opus_roundtrip() {
            let config = CodecConfig {
                codec_type: CodecType::Opus,
                format: PcmFormat::VOICE,
                bitrate: 24_000,
            };
            let mut codec = OpusCodec::new(&config).unwrap();

            let samples: Vec<i16> = (0..320)
                .map(|i| ((i as f32 * 0.1).sin() * 8000.0) as i16)
                .collect();
            let encoded = codec.encode(&samples).unwrap();
            assert!(!encoded.is_empty());
            assert!(encoded.len() < samples.len() * 2);

            let decoded = codec.decode(&encoded).unwrap();
            assert_eq!(decoded.len(), samples.len());
        }
    }
}
