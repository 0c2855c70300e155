//! Multi-track PCM mixer
//!
//! A track is a one-way sink for uncompressed PCM chunks. The mixer owns
//! every track's buffer and produces a single mixed stream on demand;
//! track controllers are weak handles that can adjust gain and fade-out
//! or close the track, but never read.
//!
//! Closing a track's write side means "no more data from this source":
//! the remaining samples drain through a linear fade-out ramp, then the
//! track is removed. With no data anywhere a read blocks, unless the
//! `silence_gap` option turns prolonged emptiness into silence frames.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use super::codec::PcmFormat;
use super::error::AudioError;

/// Track lifecycle callback
pub type TrackCallback = Arc<dyn Fn() + Send + Sync>;

/// Mixer construction options
#[derive(Clone, Default)]
pub struct MixerOptions {
    /// Emit silence after this long with no track data, instead of
    /// blocking the reader
    pub silence_gap: Option<Duration>,
    pub on_track_created: Option<TrackCallback>,
    pub on_track_closed: Option<TrackCallback>,
}

struct FadeState {
    /// Ramp length in interleaved samples
    total: usize,
    done: usize,
}

struct TrackState {
    id: u64,
    buf: VecDeque<i16>,
    gain: f32,
    fade_out: Duration,
    fade: Option<FadeState>,
    write_closed: bool,
}

struct MixerState {
    tracks: Vec<TrackState>,
    closed: bool,
    next_id: u64,
}

struct Shared {
    state: Mutex<MixerState>,
    notify: Notify,
    format: PcmFormat,
    on_track_closed: Option<TrackCallback>,
}

impl Shared {
    fn fire_closed(&self, count: usize) {
        if let Some(cb) = &self.on_track_closed {
            for _ in 0..count {
                cb();
            }
        }
    }

    /// Remove a track immediately, no fade
    fn remove_track(&self, id: u64) {
        let removed = {
            let mut state = self.state.lock();
            let before = state.tracks.len();
            state.tracks.retain(|t| t.id != id);
            before != state.tracks.len()
        };
        if removed {
            self.fire_closed(1);
            self.notify.notify_one();
        }
    }

    fn close_write_track(&self, id: u64) {
        let mut drained = false;
        {
            let mut state = self.state.lock();
            if let Some(track) = state.tracks.iter_mut().find(|t| t.id == id) {
                if !track.write_closed {
                    track.write_closed = true;
                    if !track.fade_out.is_zero() && !track.buf.is_empty() {
                        track.fade = Some(FadeState {
                            total: self.format.samples_in(track.fade_out).max(1),
                            done: 0,
                        });
                    }
                }
                drained = track.buf.is_empty();
            }
        }
        if drained {
            self.remove_track(id);
        } else {
            self.notify.notify_one();
        }
    }
}

/// Multi-track PCM mixer
pub struct Mixer {
    shared: Arc<Shared>,
    silence_gap: Option<Duration>,
    on_track_created: Option<TrackCallback>,
}

/// Writer half of a track; dropping it closes the write side
pub struct Track {
    id: u64,
    shared: Arc<Shared>,
}

/// Weak control handle for a track owned by a mixer
#[derive(Clone)]
pub struct TrackController {
    id: u64,
    shared: Weak<Shared>,
}

impl Mixer {
    pub fn new(format: PcmFormat, options: MixerOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MixerState {
                    tracks: Vec::new(),
                    closed: false,
                    next_id: 0,
                }),
                notify: Notify::new(),
                format,
                on_track_closed: options.on_track_closed,
            }),
            silence_gap: options.silence_gap,
            on_track_created: options.on_track_created,
        }
    }

    pub fn format(&self) -> PcmFormat {
        self.shared.format
    }

    /// Add a fresh track with unit gain and no fade-out
    pub fn new_track(&self) -> Result<(Track, TrackController), AudioError> {
        let id = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(AudioError::Closed);
            }
            let id = state.next_id;
            state.next_id += 1;
            state.tracks.push(TrackState {
                id,
                buf: VecDeque::new(),
                gain: 1.0,
                fade_out: Duration::ZERO,
                fade: None,
                write_closed: false,
            });
            id
        };
        if let Some(cb) = &self.on_track_created {
            cb();
        }
        Ok((
            Track {
                id,
                shared: self.shared.clone(),
            },
            TrackController {
                id,
                shared: Arc::downgrade(&self.shared),
            },
        ))
    }

    /// Mix up to `out.len()` samples from all live tracks
    ///
    /// Returns the number of mixed samples; the remainder of `out` is
    /// zeroed. Blocks while no track has data, unless a silence gap is
    /// configured.
    pub async fn read(&self, out: &mut [i16]) -> Result<usize, AudioError> {
        out.fill(0);
        loop {
            let notified = self.shared.notify.notified();
            let (produced, removed) = {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(AudioError::Closed);
                }
                mix_into(&mut state, out)
            };
            self.shared.fire_closed(removed);

            if produced > 0 {
                return Ok(produced);
            }
            match self.silence_gap {
                Some(gap) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep(gap) => return Ok(out.len()),
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Close the mixer and every track; reads fail afterwards
    pub fn close(&self) {
        let removed = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let n = state.tracks.len();
            state.tracks.clear();
            n
        };
        self.shared.fire_closed(removed);
        self.shared.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Number of live tracks
    pub fn track_count(&self) -> usize {
        self.shared.state.lock().tracks.len()
    }
}

impl Drop for Mixer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Drain each track into `out`, applying gain and fade ramps, summing
/// with saturating-i16 clipping. Returns mixed sample count and how many
/// finished tracks were removed.
fn mix_into(state: &mut MixerState, out: &mut [i16]) -> (usize, usize) {
    let mut produced = 0usize;
    for track in state.tracks.iter_mut() {
        let n = track.buf.len().min(out.len());
        for slot in out.iter_mut().take(n) {
            let sample = track.buf.pop_front().unwrap_or(0) as f32;
            let ramp = match &mut track.fade {
                Some(fade) => {
                    let factor = 1.0 - fade.done as f32 / fade.total as f32;
                    fade.done += 1;
                    factor.max(0.0)
                }
                None => 1.0,
            };
            let mixed = *slot as i32 + (sample * track.gain * ramp) as i32;
            *slot = mixed.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        }
        produced = produced.max(n);
    }

    let before = state.tracks.len();
    state.tracks.retain(|t| {
        let fade_done = t.fade.as_ref().map_or(false, |f| f.done >= f.total);
        !(t.write_closed && (t.buf.is_empty() || fade_done))
    });
    (produced, before - state.tracks.len())
}

impl Track {
    /// Append interleaved PCM samples
    pub fn write(&self, samples: &[i16]) -> Result<(), AudioError> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(AudioError::Closed);
            }
            let track = state
                .tracks
                .iter_mut()
                .find(|t| t.id == self.id)
                .filter(|t| !t.write_closed)
                .ok_or(AudioError::Closed)?;
            track.buf.extend(samples.iter().copied());
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// No more data from this source; pending samples drain with fade-out
    pub fn close_write(&self) {
        self.shared.close_write_track(self.id);
    }

    /// Tear the track down, logging the reason
    pub fn close_with_error(&self, error: AudioError) {
        warn!(track = self.id, %error, "track closed with error");
        self.shared.remove_track(self.id);
    }
}

impl Drop for Track {
    fn drop(&mut self) {
        self.shared.close_write_track(self.id);
    }
}

impl TrackController {
    pub fn set_gain(&self, gain: f32) {
        if let Some(shared) = self.shared.upgrade() {
            let mut state = shared.state.lock();
            if let Some(track) = state.tracks.iter_mut().find(|t| t.id == self.id) {
                track.gain = gain;
            }
        }
    }

    pub fn set_fade_out_duration(&self, duration: Duration) {
        if let Some(shared) = self.shared.upgrade() {
            let mut state = shared.state.lock();
            if let Some(track) = state.tracks.iter_mut().find(|t| t.id == self.id) {
                track.fade_out = duration;
            }
        }
    }

    /// Remove the track immediately, without fade
    pub fn close(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_track(self.id);
        }
    }

    /// Close the write side; pending samples drain with fade-out
    pub fn close_write(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.close_write_track(self.id);
        }
    }

    /// Whether the track is still owned by the mixer
    pub fn is_live(&self) -> bool {
        self.shared
            .upgrade()
            .map(|shared| {
                shared
                    .state
                    .lock()
                    .tracks
                    .iter()
                    .any(|t| t.id == self.id)
            })
            .unwrap_or(false)
    }
}
