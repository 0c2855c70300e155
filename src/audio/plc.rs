//! Packet Loss Concealment for PCM audio
//!
//! Implements a "front frame repeat + fadeout" strategy for concealing
//! lost stretches in the decoded uplink stream.

use std::time::Duration;

use super::codec::PcmFormat;

/// PCM Packet Loss Concealment
///
/// Strategy:
/// - lost frames repeat the last good frame with a fadeout of
///   `factor^consecutive_losses`
/// - after enough consecutive losses: output silence
pub struct PcmPlc {
    format: PcmFormat,
    /// Last successfully decoded frame
    last_frame: Vec<i16>,
    /// Number of consecutive concealed frames
    consecutive_losses: u32,
    /// Maximum consecutive concealments before silence
    max_losses_before_silence: u32,
    /// Multiplier applied per consecutive concealment
    fadeout_factor: f32,
}

impl PcmPlc {
    pub fn new(format: PcmFormat) -> Self {
        Self::with_config(format, 5, 0.85)
    }

    /// Create with custom fadeout parameters
    pub fn with_config(format: PcmFormat, max_losses: u32, fadeout_factor: f32) -> Self {
        Self {
            format,
            last_frame: Vec::new(),
            consecutive_losses: 0,
            max_losses_before_silence: max_losses,
            fadeout_factor: fadeout_factor.clamp(0.0, 1.0),
        }
    }

    /// Store a successfully decoded frame
    ///
    /// Call this for every good frame to keep the concealment source
    /// fresh.
    pub fn store_frame(&mut self, samples: &[i16]) {
        self.last_frame.clear();
        self.last_frame.extend_from_slice(samples);
        self.consecutive_losses = 0;
    }

    /// Generate concealment audio covering `duration`
    ///
    /// Repeats the last good frame with a fadeout; silence once the
    /// source is stale or nothing was ever received.
    pub fn conceal(&mut self, duration: Duration) -> Vec<i16> {
        let needed = self.format.samples_in(duration);
        if needed == 0 {
            return Vec::new();
        }

        self.consecutive_losses += 1;
        if self.last_frame.is_empty() || self.consecutive_losses > self.max_losses_before_silence
        {
            return vec![0; needed];
        }

        // Fadeout gain: factor^consecutive_losses
        let gain = self.fadeout_factor.powi(self.consecutive_losses as i32);
        let mut out = Vec::with_capacity(needed);
        for i in 0..needed {
            let source = self.last_frame[i % self.last_frame.len()];
            out.push((source as f32 * gain) as i16);
        }
        out
    }

    /// Consecutive concealed frames since the last good one
    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    pub fn reset(&mut self) {
        self.last_frame.clear();
        self.consecutive_losses = 0;
    }
}
