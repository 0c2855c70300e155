//! Wall-clock-paced frame delivery
//!
//! Wraps a jitter buffer with a background producer that emits frames at
//! their natural pace and interleaves explicit loss events, so a single
//! consumer always has either audio or a concealment cue to work with.
//! When the uplink stalls completely, synthetic losses keep flowing: the
//! first after the stall threshold, then one per tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::{EpochMillis, Frame};

use super::error::AudioError;
use super::jitter::{JitterBuffer, JitterPoll};

/// Producer tick; smaller than a typical frame, large enough to avoid
/// busy-waiting.
pub const READ_TICK: Duration = Duration::from_millis(20);

/// Accumulated emptiness before the first synthetic loss is emitted
pub const STALL_THRESHOLD: Duration = Duration::from_millis(200);

/// Capacity of the frame/loss event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One element of the paced output sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    Frame(Frame),
    /// Duration of audio known or presumed lost
    Loss(Duration),
}

/// A jitter buffer with a wall-clock producer task in front of it
///
/// The writer half feeds stamped frames in; the single consumer pulls
/// `RealtimeEvent`s out at playback pace. `next` returns `None` once the
/// writer has closed and the buffer is drained.
pub struct RealtimeBuffer {
    jitter: Arc<JitterBuffer>,
    events: mpsc::Receiver<RealtimeEvent>,
    cancel: CancellationToken,
}

impl RealtimeBuffer {
    pub fn new() -> Self {
        Self::with_jitter(JitterBuffer::new())
    }

    pub fn with_jitter(jitter: JitterBuffer) -> Self {
        let jitter = Arc::new(jitter);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        tokio::spawn(produce(jitter.clone(), tx, cancel.clone()));
        Self {
            jitter,
            events: rx,
            cancel,
        }
    }

    /// Append a parsed frame directly
    pub fn append(&self, frame: Frame, stamp: EpochMillis) -> Result<(), AudioError> {
        self.jitter.append(frame, stamp)
    }

    /// Parse a stamped frame from `data` and append it
    pub fn write(&self, data: &[u8]) -> Result<usize, AudioError> {
        self.jitter.write(data)
    }

    /// Signal that no more frames will be written; buffered frames drain
    pub fn close_write(&self) {
        self.jitter.close();
    }

    /// Next frame or loss event; `None` at end of stream
    pub async fn next(&mut self) -> Option<RealtimeEvent> {
        self.events.recv().await
    }

    /// Counters of the jitter buffer behind this sequence
    pub fn jitter_stats(&self) -> super::jitter::JitterStats {
        self.jitter.stats()
    }

    /// Stop the producer and the writer side immediately
    pub fn close(&self) {
        self.jitter.close();
        self.cancel.cancel();
    }
}

impl Default for RealtimeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RealtimeBuffer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn produce(
    jitter: Arc<JitterBuffer>,
    events: mpsc::Sender<RealtimeEvent>,
    cancel: CancellationToken,
) {
    let mut read_tick = Instant::now();
    let mut loss_sum = Duration::ZERO;
    let mut stalled = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(read_tick) => {}
        }

        let event = match jitter.poll() {
            Ok(JitterPoll::Frame(frame)) => {
                read_tick += frame.duration();
                loss_sum = Duration::ZERO;
                stalled = false;
                RealtimeEvent::Frame(frame)
            }
            Ok(JitterPoll::Loss(duration)) => {
                // Gap in the stream; the frame behind it follows at once
                loss_sum = Duration::ZERO;
                stalled = false;
                RealtimeEvent::Loss(duration)
            }
            Ok(JitterPoll::Empty) => {
                read_tick += READ_TICK;
                if stalled {
                    RealtimeEvent::Loss(READ_TICK)
                } else {
                    loss_sum += READ_TICK;
                    if loss_sum <= STALL_THRESHOLD {
                        continue;
                    }
                    stalled = true;
                    loss_sum = Duration::ZERO;
                    RealtimeEvent::Loss(STALL_THRESHOLD)
                }
            }
            Err(_) => break, // writer closed and buffer drained
        };

        if events.send(event).await.is_err() {
            debug!("realtime event channel closed, stopping producer");
            break;
        }
    }
}
