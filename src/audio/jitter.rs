//! Jitter buffer for stamped-frame reordering
//!
//! Accepts stamped frames in arbitrary arrival order and emits them in
//! non-decreasing timestamp order. Total buffered duration is bounded;
//! gaps between consecutive stamps surface as explicit loss, packets
//! older than already-emitted data are rejected.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use crate::protocol::{EpochMillis, Frame, StampedFrame};

use super::error::AudioError;

/// Default cap on total buffered wall-clock duration
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(2);

/// Tolerance for clock-resolution error between producer and consumer
/// clocks; stamp gaps at or below this are not reported as loss.
const REORDER_TOLERANCE: Duration = Duration::from_millis(2);

/// One buffered frame, ordered by `(stamp, arrival sequence)`
struct Entry {
    stamp: EpochMillis,
    seq: u64,
    frame: Frame,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.stamp == other.stamp && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the BinaryHeap pops the smallest stamp first
    fn cmp(&self, other: &Self) -> Ordering {
        (other.stamp, other.seq).cmp(&(self.stamp, self.seq))
    }
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitterStats {
    pub frames_appended: u64,
    pub frames_emitted: u64,
    /// Frames evicted by the duration cap
    pub frames_dropped: u64,
    pub losses_emitted: u64,
    pub disordered_rejected: u64,
}

/// Result of polling the buffer for the next frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JitterPoll {
    /// The next frame in stamp order
    Frame(Frame),
    /// A gap between the emitted tail and the next buffered frame;
    /// the frame itself is returned by the following poll
    Loss(Duration),
    /// Nothing buffered right now
    Empty,
}

struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    /// End time of the last emitted frame
    tail: EpochMillis,
    started: bool,
    buffered: Duration,
    closed: bool,
    close_error: Option<AudioError>,
    stats: JitterStats,
}

/// Min-heap jitter buffer bounded by total buffered duration
///
/// All operations serialize on an internal mutex; readers never observe
/// partial state.
pub struct JitterBuffer {
    inner: Mutex<Inner>,
    max_duration: Duration,
}

impl JitterBuffer {
    pub fn new() -> Self {
        Self::with_max_duration(DEFAULT_MAX_DURATION)
    }

    pub fn with_max_duration(max_duration: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                tail: EpochMillis::ZERO,
                started: false,
                buffered: Duration::ZERO,
                closed: false,
                close_error: None,
                stats: JitterStats::default(),
            }),
            max_duration,
        }
    }

    /// Insert a frame with its capture stamp
    ///
    /// Fails with `DisorderedPacket` iff the stamp is older than data
    /// already emitted. When the duration cap is exceeded the oldest
    /// buffered frames are dropped until the invariant holds.
    pub fn append(&self, frame: Frame, stamp: EpochMillis) -> Result<(), AudioError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(inner.close_error.clone().unwrap_or(AudioError::Closed));
        }
        if inner.started && stamp < inner.tail {
            inner.stats.disordered_rejected += 1;
            return Err(AudioError::DisorderedPacket);
        }

        inner.buffered += frame.duration();
        inner.stats.frames_appended += 1;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry { stamp, seq, frame });

        while inner.buffered > self.max_duration {
            if let Some(oldest) = inner.heap.pop() {
                inner.buffered = inner
                    .buffered
                    .saturating_sub(oldest.frame.duration());
                inner.stats.frames_dropped += 1;
                warn!(
                    stamp = oldest.stamp.as_millis(),
                    "jitter buffer over capacity, dropping oldest frame"
                );
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Parse a stamped frame from `data` and append it
    ///
    /// Returns the number of bytes consumed.
    pub fn write(&self, data: &[u8]) -> Result<usize, AudioError> {
        let stamped = StampedFrame::from_bytes(data)
            .map_err(|e| AudioError::InvalidStampedFrame(e.to_string()))?;
        self.append(stamped.frame, stamped.stamp)?;
        Ok(data.len())
    }

    /// Pull the next frame, loss, or emptiness in stamp order
    ///
    /// After close the remaining frames drain, then `Err` carries the
    /// close reason.
    pub fn poll(&self) -> Result<JitterPoll, AudioError> {
        let mut inner = self.inner.lock();

        let (top_stamp, top_duration) = match inner.heap.peek() {
            Some(top) => (top.stamp, top.frame.duration()),
            None => {
                return if inner.closed {
                    Err(inner.close_error.clone().unwrap_or(AudioError::Closed))
                } else {
                    Ok(JitterPoll::Empty)
                };
            }
        };

        if !inner.started {
            inner.tail = top_stamp;
            inner.started = true;
        }

        let gap = top_stamp - inner.tail;
        if gap > REORDER_TOLERANCE {
            inner.tail = top_stamp;
            inner.stats.losses_emitted += 1;
            return Ok(JitterPoll::Loss(gap));
        }

        let entry = inner.heap.pop().expect("peeked entry");
        inner.buffered = inner.buffered.saturating_sub(top_duration);
        inner.tail = entry.stamp + top_duration;
        inner.stats.frames_emitted += 1;
        Ok(JitterPoll::Frame(entry.frame))
    }

    /// Drop all buffered frames and rewind the tail
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.heap.clear();
        inner.tail = EpochMillis::ZERO;
        inner.started = false;
        inner.buffered = Duration::ZERO;
    }

    /// Stop accepting new frames; buffered frames still drain
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    /// Close and surface `error` to the reader once drained
    pub fn close_with_error(&self, error: AudioError) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        if inner.close_error.is_none() {
            inner.close_error = Some(error);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Sum of buffered frame durations
    pub fn buffered(&self) -> Duration {
        self.inner.lock().buffered
    }

    /// End time of the last emitted frame
    pub fn tail(&self) -> EpochMillis {
        self.inner.lock().tail
    }

    pub fn stats(&self) -> JitterStats {
        self.inner.lock().stats
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single 20ms sub-frame table-of-contents byte
    fn frame_20ms(marker: u8) -> Frame {
        Frame::new(vec![0xF8, marker]).unwrap()
    }

    fn stamp(ms: i64) -> EpochMillis {
        EpochMillis::from_millis(ms)
    }

    fn expect_frame(buffer: &JitterBuffer, marker: u8) {
        match buffer.poll().unwrap() {
            JitterPoll::Frame(f) => assert_eq!(f.as_bytes()[1], marker),
            other => panic!("Expected frame {marker}, got {other:?}"),
        }
    }

    #[test]
    fn test_in_order_delivery() {
        let buffer = JitterBuffer::new();
        buffer.append(frame_20ms(0), stamp(100)).unwrap();
        buffer.append(frame_20ms(1), stamp(120)).unwrap();
        buffer.append(frame_20ms(2), stamp(140)).unwrap();

        expect_frame(&buffer, 0);
        expect_frame(&buffer, 1);
        expect_frame(&buffer, 2);
        assert_eq!(buffer.poll().unwrap(), JitterPoll::Empty);
    }

    #[test]
    fn test_reorder() {
        let buffer = JitterBuffer::new();
        buffer.append(frame_20ms(2), stamp(140)).unwrap();
        buffer.append(frame_20ms(0), stamp(100)).unwrap();
        buffer.append(frame_20ms(1), stamp(120)).unwrap();

        expect_frame(&buffer, 0);
        expect_frame(&buffer, 1);
        expect_frame(&buffer, 2);
    }

    #[test]
    fn test_gap_surfaces_as_loss() {
        let buffer = JitterBuffer::new();
        buffer.append(frame_20ms(0), stamp(100)).unwrap();
        buffer.append(frame_20ms(1), stamp(200)).unwrap();

        expect_frame(&buffer, 0);
        // 200 - (100 + 20) = 80ms gap; the frame itself comes next
        assert_eq!(
            buffer.poll().unwrap(),
            JitterPoll::Loss(Duration::from_millis(80))
        );
        expect_frame(&buffer, 1);
    }

    #[test]
    fn test_tolerance_swallows_small_gaps() {
        let buffer = JitterBuffer::new();
        buffer.append(frame_20ms(0), stamp(100)).unwrap();
        // 2ms late: within clock tolerance, no loss event
        buffer.append(frame_20ms(1), stamp(122)).unwrap();

        expect_frame(&buffer, 0);
        expect_frame(&buffer, 1);
    }

    #[test]
    fn test_disordered_packet_rejected() {
        let buffer = JitterBuffer::new();
        buffer.append(frame_20ms(0), stamp(100)).unwrap();
        expect_frame(&buffer, 0); // tail now 120

        assert_eq!(
            buffer.append(frame_20ms(1), stamp(60)),
            Err(AudioError::DisorderedPacket)
        );
    }

    #[test]
    fn test_duration_cap_drops_oldest() {
        let buffer = JitterBuffer::with_max_duration(Duration::from_millis(50));
        for i in 0..10 {
            buffer.append(frame_20ms(i), stamp(i as i64 * 20)).unwrap();
            assert!(buffer.buffered() <= Duration::from_millis(50));
        }
        // Oldest frames were evicted; the first poll sees a late stamp
        match buffer.poll().unwrap() {
            JitterPoll::Frame(f) => assert!(f.as_bytes()[1] >= 8),
            other => panic!("Expected frame, got {other:?}"),
        }
    }

    #[test]
    fn test_span_conservation() {
        // Sum of emitted durations and losses covers the stamped span
        let buffer = JitterBuffer::new();
        let stamps = [300i64, 100, 240, 140];
        for (i, s) in stamps.iter().enumerate() {
            buffer.append(frame_20ms(i as u8), stamp(*s)).unwrap();
        }

        let mut covered = Duration::ZERO;
        loop {
            match buffer.poll().unwrap() {
                JitterPoll::Frame(f) => covered += f.duration(),
                JitterPoll::Loss(d) => covered += d,
                JitterPoll::Empty => break,
            }
        }
        // max(stamp) + 20 - min(stamp)
        assert_eq!(covered, Duration::from_millis(220));
    }

    #[test]
    fn test_every_arrival_order_restores_stamp_order() {
        // All 24 orderings of four distinct stamps yield the same
        // ascending frame sequence and cover the same span
        fn permutations(items: &mut Vec<usize>, k: usize, out: &mut Vec<Vec<usize>>) {
            if k <= 1 {
                out.push(items.clone());
                return;
            }
            for i in 0..k {
                permutations(items, k - 1, out);
                if k % 2 == 0 {
                    items.swap(i, k - 1);
                } else {
                    items.swap(0, k - 1);
                }
            }
        }

        let stamps = [100i64, 140, 200, 260];
        let mut indices: Vec<usize> = (0..stamps.len()).collect();
        let mut orders = Vec::new();
        permutations(&mut indices, stamps.len(), &mut orders);
        assert_eq!(orders.len(), 24);

        for order in orders {
            let buffer = JitterBuffer::new();
            for &i in &order {
                buffer.append(frame_20ms(i as u8), stamp(stamps[i])).unwrap();
            }

            let mut emitted = Vec::new();
            let mut covered = Duration::ZERO;
            loop {
                match buffer.poll().unwrap() {
                    JitterPoll::Frame(f) => {
                        covered += f.duration();
                        emitted.push(f.as_bytes()[1]);
                    }
                    JitterPoll::Loss(d) => covered += d,
                    JitterPoll::Empty => break,
                }
            }
            assert_eq!(emitted, vec![0, 1, 2, 3], "order {order:?}");
            assert_eq!(covered, Duration::from_millis(180), "order {order:?}");
        }
    }

    #[test]
    fn test_write_parses_stamped_bytes() {
        let buffer = JitterBuffer::new();
        let stamped = StampedFrame::new(stamp(100), frame_20ms(7));
        let bytes = stamped.to_bytes();
        assert_eq!(buffer.write(&bytes).unwrap(), bytes.len());
        expect_frame(&buffer, 7);
    }

    #[test]
    fn test_write_rejects_garbage() {
        let buffer = JitterBuffer::new();
        assert!(matches!(
            buffer.write(&[0x00, 0x01]),
            Err(AudioError::InvalidStampedFrame(_))
        ));
    }

    #[test]
    fn test_close_drains_then_reports() {
        let buffer = JitterBuffer::new();
        buffer.append(frame_20ms(0), stamp(100)).unwrap();
        buffer.close();

        assert_eq!(
            buffer.append(frame_20ms(1), stamp(120)),
            Err(AudioError::Closed)
        );
        expect_frame(&buffer, 0);
        assert_eq!(buffer.poll(), Err(AudioError::Closed));
        // close is idempotent
        buffer.close();
        assert_eq!(buffer.poll(), Err(AudioError::Closed));
    }

    #[test]
    fn test_close_with_error_surfaces_reason() {
        let buffer = JitterBuffer::new();
        buffer.close_with_error(AudioError::Codec("decoder gone".into()));
        assert_eq!(
            buffer.poll(),
            Err(AudioError::Codec("decoder gone".into()))
        );
    }

    #[test]
    fn test_stats_track_everything() {
        let buffer = JitterBuffer::new();
        buffer.append(frame_20ms(0), stamp(100)).unwrap();
        buffer.append(frame_20ms(1), stamp(200)).unwrap();
        expect_frame(&buffer, 0);
        let _ = buffer.poll(); // loss
        expect_frame(&buffer, 1);
        let _ = buffer.append(frame_20ms(2), stamp(60));

        let stats = buffer.stats();
        assert_eq!(stats.frames_appended, 2);
        assert_eq!(stats.frames_emitted, 2);
        assert_eq!(stats.losses_emitted, 1);
        assert_eq!(stats.disordered_rejected, 1);
        assert_eq!(stats.frames_dropped, 0);
    }

    #[test]
    fn test_reset_rewinds_tail() {
        let buffer = JitterBuffer::new();
        buffer.append(frame_20ms(0), stamp(100)).unwrap();
        expect_frame(&buffer, 0);
        buffer.reset();

        // A stamp older than the previous tail is accepted again
        buffer.append(frame_20ms(1), stamp(10)).unwrap();
        expect_frame(&buffer, 1);
    }
}
