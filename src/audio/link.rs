//! Uplink link-quality monitor
//!
//! Every stamped frame carries its capture time, so the receiving side
//! can observe one-way transit delay and its variation, and the paced
//! event sequence makes loss directly measurable. Delay and jitter are
//! smoothed with exponential moving averages; loss rate is the lost
//! share of the covered stream time.

use std::time::Duration;

use crate::protocol::EpochMillis;

/// Smoothing factor for the delay estimate
const DELAY_ALPHA: f32 = 0.125;

/// Smoothing factor for the jitter estimate
const JITTER_BETA: f32 = 0.25;

/// A snapshot of the monitored link
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkQuality {
    /// Smoothed one-way transit delay in milliseconds
    ///
    /// Includes any clock offset between the two ends; the trend is
    /// meaningful even when the absolute value is not.
    pub delay_ms: f32,
    /// Smoothed delay variation in milliseconds
    pub jitter_ms: f32,
    /// Lost share of the covered stream time (0.0 - 1.0)
    pub loss_rate: f32,
    pub frames: u64,
    pub losses: u64,
}

/// Tracks delay, jitter, and loss for one uplink
#[derive(Debug, Default)]
pub struct LinkMonitor {
    delay_ms: f32,
    jitter_ms: f32,
    frame_time: Duration,
    loss_time: Duration,
    frames: u64,
    losses: u64,
}

impl LinkMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an arrived frame: its capture stamp and playback duration
    pub fn observe_frame(&mut self, stamp: EpochMillis, duration: Duration) {
        let delay = (EpochMillis::now().as_millis() - stamp.as_millis()) as f32;

        if self.frames == 0 {
            self.delay_ms = delay;
        } else {
            self.delay_ms = (1.0 - DELAY_ALPHA) * self.delay_ms + DELAY_ALPHA * delay;
        }
        let deviation = (delay - self.delay_ms).abs();
        self.jitter_ms = (1.0 - JITTER_BETA) * self.jitter_ms + JITTER_BETA * deviation;

        self.frame_time += duration;
        self.frames += 1;
    }

    /// Record a loss event of the given duration
    pub fn observe_loss(&mut self, duration: Duration) {
        self.loss_time += duration;
        self.losses += 1;
    }

    pub fn snapshot(&self) -> LinkQuality {
        let covered = self.frame_time + self.loss_time;
        let loss_rate = if covered.is_zero() {
            0.0
        } else {
            self.loss_time.as_secs_f32() / covered.as_secs_f32()
        };
        LinkQuality {
            delay_ms: self.delay_ms,
            jitter_ms: self.jitter_ms,
            loss_rate,
            frames: self.frames,
            losses: self.losses,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_snapshot_is_zero() {
        let monitor = LinkMonitor::new();
        assert_eq!(monitor.snapshot(), LinkQuality::default());
    }

    #[test]
    fn test_first_frame_sets_delay_directly() {
        let mut monitor = LinkMonitor::new();
        let stamp = EpochMillis::now().saturating_sub(Duration::from_millis(100));
        monitor.observe_frame(stamp, Duration::from_millis(20));

        let quality = monitor.snapshot();
        assert!(quality.delay_ms >= 100.0 && quality.delay_ms < 150.0);
        assert_eq!(quality.frames, 1);
    }

    #[test]
    fn test_delay_is_smoothed() {
        let mut monitor = LinkMonitor::new();
        let now = EpochMillis::now();
        monitor.observe_frame(now.saturating_sub(Duration::from_millis(100)), Duration::from_millis(20));
        // A single spike moves the estimate only one alpha step
        monitor.observe_frame(now.saturating_sub(Duration::from_millis(500)), Duration::from_millis(20));

        let quality = monitor.snapshot();
        assert!(quality.delay_ms < 300.0);
        assert!(quality.jitter_ms > 0.0);
    }

    #[test]
    fn test_loss_rate_is_time_weighted() {
        let mut monitor = LinkMonitor::new();
        let stamp = EpochMillis::now();
        for _ in 0..3 {
            monitor.observe_frame(stamp, Duration::from_millis(20));
        }
        monitor.observe_loss(Duration::from_millis(60));

        let quality = monitor.snapshot();
        assert!((quality.loss_rate - 0.5).abs() < 1e-6);
        assert_eq!(quality.losses, 1);
    }

    #[test]
    fn test_reset() {
        let mut monitor = LinkMonitor::new();
        monitor.observe_frame(EpochMillis::now(), Duration::from_millis(20));
        monitor.observe_loss(Duration::from_millis(20));
        monitor.reset();
        assert_eq!(monitor.snapshot(), LinkQuality::default());
    }
}
