//! Compressed audio frames and the stamped-frame wire format
//!
//! Stamped frame layout (8-byte header):
//! - version: 1 byte (most-significant byte of the big-endian word, = 1)
//! - timestamp: 7 bytes (big-endian, milliseconds since the Unix epoch)
//! followed by one compressed audio frame of at least one byte.

use std::time::Duration;

use super::error::ProtocolError;
use super::time::EpochMillis;

/// Stamped-frame protocol version
pub const STAMP_VERSION: u8 = 1;

/// Stamped-frame header size in bytes
pub const STAMP_HEADER_SIZE: usize = 8;

/// Mask for the 56-bit millisecond field of the header word
const STAMP_MS_MASK: u64 = (1 << 56) - 1;

/// One compressed audio packet
///
/// The first byte is the codec's table-of-contents byte: a 5-bit duration
/// configuration, a stereo flag, and a 2-bit frame-count code. The frame
/// duration is derivable from it without a full decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    /// Wrap a compressed packet; fails on empty input
    pub fn new(data: Vec<u8>) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        Ok(Frame(data))
    }

    /// Frame bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Frame length in bytes (always >= 1)
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept for slice-like ergonomics
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the packet carries stereo audio
    pub fn is_stereo(&self) -> bool {
        self.0[0] & 0x04 != 0
    }

    /// Number of sub-frames in the packet (1, 2, or up to 48)
    pub fn subframe_count(&self) -> u32 {
        match self.0[0] & 0x03 {
            0 => 1,
            1 | 2 => 2,
            _ => self.0.get(1).map(|b| (b & 0x3F) as u32).unwrap_or(0),
        }
    }

    /// Playback duration, decoded from the table-of-contents byte
    ///
    /// Returns zero for a malformed multi-frame packet with no count byte.
    pub fn duration(&self) -> Duration {
        let config = self.0[0] >> 3;
        let subframe_us: u64 = match config {
            0..=11 => [10_000, 20_000, 40_000, 60_000][(config % 4) as usize],
            12..=15 => [10_000, 20_000][(config % 2) as usize],
            _ => [2_500, 5_000, 10_000, 20_000][(config % 4) as usize],
        };
        Duration::from_micros(subframe_us * self.subframe_count() as u64)
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

/// A compressed frame paired with its capture timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampedFrame {
    pub stamp: EpochMillis,
    pub frame: Frame,
}

impl StampedFrame {
    pub fn new(stamp: EpochMillis, frame: Frame) -> Self {
        Self { stamp, frame }
    }

    /// Serialize to the wire layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let word = ((STAMP_VERSION as u64) << 56)
            | (self.stamp.as_millis() as u64 & STAMP_MS_MASK);
        let mut buf = Vec::with_capacity(STAMP_HEADER_SIZE + self.frame.len());
        buf.extend_from_slice(&word.to_be_bytes());
        buf.extend_from_slice(self.frame.as_bytes());
        buf
    }

    /// Deserialize from the wire layout
    ///
    /// Fails if the input is shorter than the header, the version byte is
    /// not 1, or the trailing frame is empty.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < STAMP_HEADER_SIZE {
            return Err(ProtocolError::InvalidStampedFrame("short header"));
        }
        let word = u64::from_be_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ]);
        if (word >> 56) as u8 != STAMP_VERSION {
            return Err(ProtocolError::InvalidStampedFrame("bad version"));
        }
        let frame = Frame::new(data[STAMP_HEADER_SIZE..].to_vec())
            .map_err(|_| ProtocolError::InvalidStampedFrame("empty frame"))?;
        Ok(Self {
            stamp: EpochMillis::from_millis((word & STAMP_MS_MASK) as i64),
            frame,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(bytes: &[u8]) -> Frame {
        Frame::new(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_empty_frame_rejected() {
        assert!(Frame::new(Vec::new()).is_err());
    }

    #[test]
    fn test_duration_single_subframe() {
        // config 31 (2.5/5/10/20 family, index 3 = 20ms), count code 0 = 1 frame
        assert_eq!(frame(&[0xF8]).duration(), Duration::from_millis(20));
        // config 1 = 20ms SILK subframe
        assert_eq!(frame(&[0x08]).duration(), Duration::from_millis(20));
        // config 3 = 60ms SILK subframe
        assert_eq!(frame(&[0x18]).duration(), Duration::from_millis(60));
        // config 16 = 2.5ms subframe
        assert_eq!(frame(&[0x80]).duration(), Duration::from_micros(2500));
    }

    #[test]
    fn test_duration_two_subframes() {
        // count code 1 = two subframes of 10ms (config 12, hybrid)
        assert_eq!(frame(&[0x61]).duration(), Duration::from_millis(20));
        // count code 2 behaves the same for duration purposes
        assert_eq!(frame(&[0x62]).duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_duration_counted_subframes() {
        // count code 3: count in the low six bits of the second byte
        assert_eq!(
            frame(&[0x83, 0x04]).duration(),
            Duration::from_millis(10) // 4 x 2.5ms
        );
        // Missing count byte yields zero duration
        assert_eq!(frame(&[0x83]).duration(), Duration::ZERO);
    }

    #[test]
    fn test_stereo_flag() {
        assert!(frame(&[0xFC]).is_stereo());
        assert!(!frame(&[0xF8]).is_stereo());
    }

    #[test]
    fn test_stamp_wire_layout() {
        // 2024-01-15T10:30:00Z
        let t = EpochMillis::from_millis(1_705_315_800_000);
        let stamped = StampedFrame::new(t, frame(&[0xFC, 0x00, 0x01, 0x02]));
        let bytes = stamped.to_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(
            bytes,
            vec![0x01, 0x00, 0x01, 0x8D, 0x0C, 0xBE, 0x13, 0xC0, 0xFC, 0x00, 0x01, 0x02]
        );
    }

    #[test]
    fn test_stamp_roundtrip() {
        let t = EpochMillis::from_millis(1_705_315_800_000);
        let original = StampedFrame::new(t, frame(&[0xFC, 0x00, 0x01, 0x02]));
        let decoded = StampedFrame::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_unstamp_short_input() {
        assert!(StampedFrame::from_bytes(&[0x01, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_unstamp_bad_version() {
        let mut bytes = StampedFrame::new(EpochMillis::from_millis(1), frame(&[0xF8])).to_bytes();
        bytes[0] = 2;
        assert!(StampedFrame::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_unstamp_empty_frame() {
        let bytes = StampedFrame::new(EpochMillis::from_millis(1), frame(&[0xF8])).to_bytes();
        assert!(StampedFrame::from_bytes(&bytes[..STAMP_HEADER_SIZE]).is_err());
    }
}
