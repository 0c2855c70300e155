//! Device-side gear port
//!
//! Owns the five queues a gear needs: downlink audio and commands in,
//! uplink audio, states, and stats out. Device health lives in a
//! two-layer stats model: `stats` is the full storage, `pending` a
//! sparse event holding only what changed since the last upload. Batch
//! mode defers uploads until `end_batch` flushes the whole storage once.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audio::{create_codec, AudioError, CodecConfig, FRAME_DURATION};
use crate::protocol::{
    Battery, CellularNetwork, EpochMillis, Frame, LightMode, NfcTag, PairStatus,
    SessionCommandEvent, Shaking, State, StateCause, StateEvent, StatsEvent, SystemVersion,
    Volume, WifiNetwork, WifiStore, WifiStoreEntry,
};

use super::error::PortError;
use super::traits::{DownlinkRx, MicSource, SpeakerSink, UplinkTx};

/// Cadence of unconditional state refreshes
pub const STATE_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Cadence of the tiered stats rounds
pub const STATS_ROUND_INTERVAL: Duration = Duration::from_secs(20);

/// Client port tunables
#[derive(Debug, Clone)]
pub struct ClientPortConfig {
    pub codec: CodecConfig,
    pub audio_capacity: usize,
    pub event_capacity: usize,
}

impl Default for ClientPortConfig {
    fn default() -> Self {
        Self {
            codec: CodecConfig::default(),
            audio_capacity: 64,
            event_capacity: 16,
        }
    }
}

/// Storage plus pending-diff layers of the stats model
struct StatsModel {
    stats: StatsEvent,
    pending: Option<StatsEvent>,
    batch: bool,
}

/// Lazy sequence of commands received from the server
pub struct CommandStream {
    rx: mpsc::Receiver<SessionCommandEvent>,
}

impl CommandStream {
    /// Next command; `None` once the port closes
    pub async fn next(&mut self) -> Option<SessionCommandEvent> {
        self.rx.recv().await
    }
}

/// One gear as seen from the device side
pub struct ClientPort {
    config: ClientPortConfig,
    state: RwLock<State>,
    stats: RwLock<StatsModel>,

    uplink_audio_tx: Mutex<Option<mpsc::Sender<(EpochMillis, Frame)>>>,
    uplink_audio_rx: tokio::sync::Mutex<mpsc::Receiver<(EpochMillis, Frame)>>,
    uplink_state_tx: Mutex<Option<mpsc::Sender<StateEvent>>>,
    uplink_state_rx: tokio::sync::Mutex<mpsc::Receiver<StateEvent>>,
    uplink_stats_tx: Mutex<Option<mpsc::Sender<StatsEvent>>>,
    uplink_stats_rx: tokio::sync::Mutex<mpsc::Receiver<StatsEvent>>,

    downlink_audio_tx: Mutex<Option<mpsc::Sender<(EpochMillis, Frame)>>>,
    downlink_audio_rx: tokio::sync::Mutex<mpsc::Receiver<(EpochMillis, Frame)>>,
    command_tx: Mutex<Option<mpsc::Sender<SessionCommandEvent>>>,
    command_rx: Mutex<Option<mpsc::Receiver<SessionCommandEvent>>>,

    cancel: CancellationToken,
}

impl ClientPort {
    pub fn new(config: ClientPortConfig) -> Self {
        Self::with_cancellation(config, CancellationToken::new())
    }

    pub fn with_cancellation(config: ClientPortConfig, cancel: CancellationToken) -> Self {
        let (ua_tx, ua_rx) = mpsc::channel(config.audio_capacity);
        let (us_tx, us_rx) = mpsc::channel(config.event_capacity);
        let (ust_tx, ust_rx) = mpsc::channel(config.event_capacity);
        let (da_tx, da_rx) = mpsc::channel(config.audio_capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(config.event_capacity);

        Self {
            config,
            state: RwLock::new(State::Unknown),
            stats: RwLock::new(StatsModel {
                stats: StatsEvent::default(),
                pending: None,
                batch: false,
            }),
            uplink_audio_tx: Mutex::new(Some(ua_tx)),
            uplink_audio_rx: tokio::sync::Mutex::new(ua_rx),
            uplink_state_tx: Mutex::new(Some(us_tx)),
            uplink_state_rx: tokio::sync::Mutex::new(us_rx),
            uplink_stats_tx: Mutex::new(Some(ust_tx)),
            uplink_stats_rx: tokio::sync::Mutex::new(ust_rx),
            downlink_audio_tx: Mutex::new(Some(da_tx)),
            downlink_audio_rx: tokio::sync::Mutex::new(da_rx),
            command_tx: Mutex::new(Some(cmd_tx)),
            command_rx: Mutex::new(Some(cmd_rx)),
            cancel,
        }
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn state(&self) -> State {
        *self.state.read()
    }

    /// Update the state and report the transition; same-state calls are
    /// no-ops.
    pub fn set_state(&self, state: State) {
        self.set_state_event(state, None);
    }

    /// State transition carrying a cause, for the calling flows
    pub fn set_state_with_cause(&self, state: State, cause: StateCause) {
        self.set_state_event(state, Some(cause));
    }

    fn set_state_event(&self, state: State, cause: Option<StateCause>) {
        {
            let mut current = self.state.write();
            if *current == state {
                return;
            }
            *current = state;
        }
        let mut event = StateEvent::now(state);
        event.cause = cause;
        self.enqueue_state(event);
    }

    fn enqueue_state(&self, event: StateEvent) {
        let Some(tx) = self.uplink_state_tx.lock().clone() else {
            return;
        };
        if tx.try_send(event).is_err() {
            warn!("uplink state queue full, dropping event");
        }
    }

    fn enqueue_stats(&self, event: StatsEvent) {
        let Some(tx) = self.uplink_stats_tx.lock().clone() else {
            return;
        };
        if tx.try_send(event).is_err() {
            warn!("uplink stats queue full, dropping event");
        }
    }

    // ========================================================================
    // Stats setters
    // ========================================================================

    /// Apply `write` to the storage layer and, outside batch mode,
    /// upload the same change immediately as a sparse event.
    fn update_stats(&self, mut write: impl FnMut(&mut StatsEvent, EpochMillis)) {
        let now = EpochMillis::now();
        let upload = {
            let mut model = self.stats.write();
            write(&mut model.stats, now);
            if model.batch {
                None
            } else {
                let mut pending = model
                    .pending
                    .take()
                    .unwrap_or_else(|| StatsEvent::at(now));
                write(&mut pending, now);
                pending.time = now;
                Some(pending)
            }
        };
        if let Some(event) = upload {
            self.enqueue_stats(event);
        }
    }

    pub fn set_volume(&self, percentage: i32) {
        self.update_stats(|s, now| {
            s.volume = Some(Volume {
                percentage,
                update_at: now,
            });
        });
    }

    pub fn set_brightness(&self, percentage: i32) {
        self.update_stats(|s, now| {
            s.brightness = Some(crate::protocol::Brightness {
                percentage,
                update_at: now,
            });
        });
    }

    pub fn set_light_mode(&self, mode: impl Into<String>) {
        let mode = mode.into();
        self.update_stats(move |s, now| {
            s.light_mode = Some(LightMode {
                mode: mode.clone(),
                update_at: now,
            });
        });
    }

    pub fn set_battery(&self, battery: Battery) {
        self.update_stats(move |s, _| {
            s.battery = Some(battery.clone());
        });
    }

    pub fn set_system_version(&self, mut version: SystemVersion) {
        self.update_stats(move |s, now| {
            version.update_at = Some(now);
            s.system_version = Some(version.clone());
        });
    }

    pub fn set_cellular(&self, network: CellularNetwork) {
        self.update_stats(move |s, _| {
            s.cellular = Some(network.clone());
        });
    }

    pub fn set_wifi_network(&self, network: WifiNetwork) {
        self.update_stats(move |s, _| {
            s.wifi_network = Some(network.clone());
        });
    }

    pub fn set_wifi_store(&self, entries: Vec<WifiStoreEntry>) {
        self.update_stats(move |s, now| {
            s.wifi_store = Some(WifiStore {
                list: Some(entries.clone()),
                update_at: now,
            });
        });
    }

    pub fn set_pair_status(&self, pair_with: Option<String>) {
        self.update_stats(move |s, now| {
            s.pair_status = Some(PairStatus {
                pair_with: pair_with.clone(),
                update_at: Some(now),
            });
        });
    }

    pub fn set_read_nfc_tag(&self, tags: Vec<NfcTag>) {
        self.update_stats(move |s, _| {
            s.read_nfc_tag = Some(tags.clone());
        });
    }

    pub fn set_shaking(&self, level: i32) {
        self.update_stats(move |s, _| {
            s.shaking = Some(Shaking { level });
        });
    }

    /// Snapshot of the storage layer
    pub fn stats(&self) -> StatsEvent {
        self.stats.read().stats.clone()
    }

    // ========================================================================
    // Batch mode
    // ========================================================================

    /// Defer stat uploads; setters only touch storage until `end_batch`
    pub fn begin_batch(&self) {
        self.stats.write().batch = true;
    }

    /// Exit batch mode, uploading one full clone of the storage layer
    pub fn end_batch(&self) {
        let event = {
            let mut model = self.stats.write();
            if !model.batch {
                return;
            }
            model.batch = false;
            model.pending = None;
            let mut event = model.stats.clone();
            event.time = EpochMillis::now();
            event
        };
        self.enqueue_stats(event);
    }

    // ========================================================================
    // Periodic reporting
    // ========================================================================

    /// Start the 5s state refresh and 20s tiered stats loops
    pub fn start_periodic_reporting(self: &Arc<Self>) {
        let port = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATE_REPORT_INTERVAL);
            interval.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = port.cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                port.enqueue_state(StateEvent::now(port.state()));
            }
        });

        let port = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_ROUND_INTERVAL);
            interval.tick().await;
            let mut round: u64 = 0;
            loop {
                tokio::select! {
                    _ = port.cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                round += 1;
                let now = EpochMillis::now();
                let event = {
                    let model = port.stats.read();
                    tier_snapshot(&model.stats, round, now)
                };
                if let Some(event) = event {
                    port.enqueue_stats(event);
                }
            }
        });
    }

    // ========================================================================
    // Audio bridges
    // ========================================================================

    /// Read 20ms PCM frames from the mic, encode, stamp, and enqueue
    ///
    /// The stamp clock is monotone: `max(now, last + frame_duration)`.
    /// Empty encoder output (discontinuous transmission) advances the
    /// clock without enqueueing.
    pub async fn read_from_mic<M: MicSource + ?Sized>(&self, mic: &mut M) -> Result<(), PortError> {
        let mut codec = create_codec(&self.config.codec)
            .map_err(|e| PortError::Audio(AudioError::Codec(e.to_string())))?;
        let mut pcm = vec![0i16; codec.frame_samples()];
        let mut last_stamp = EpochMillis::ZERO;

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                r = mic.read_frame(&mut pcm) => r?,
            };
            if read == 0 {
                return Ok(());
            }
            pcm[read..].fill(0);

            let stamp = EpochMillis::now().max(last_stamp + FRAME_DURATION);
            last_stamp = stamp;

            let encoded = codec
                .encode(&pcm)
                .map_err(|e| PortError::Audio(AudioError::Codec(e.to_string())))?;
            if encoded.is_empty() {
                continue;
            }
            let frame = Frame::new(encoded)?;
            let Some(tx) = self.uplink_audio_tx.lock().clone() else {
                return Ok(());
            };
            if tx.try_send((stamp, frame)).is_err() {
                warn!("uplink audio queue full, dropping frame");
            }
        }
    }

    /// Decode downlink frames and play them
    ///
    /// Decoder errors are logged and the frame skipped; speaker errors
    /// propagate.
    pub async fn write_to_speaker<S: SpeakerSink + ?Sized>(
        &self,
        speaker: &mut S,
    ) -> Result<(), PortError> {
        let mut codec = create_codec(&self.config.codec)
            .map_err(|e| PortError::Audio(AudioError::Codec(e.to_string())))?;
        let mut rx = self.downlink_audio_rx.lock().await;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                n = rx.recv() => n,
            };
            let Some((_stamp, frame)) = next else {
                return Ok(());
            };
            match codec.decode(frame.as_bytes()) {
                Ok(pcm) => speaker.write(&pcm).await?,
                Err(e) => {
                    warn!(error = %e, "skipping undecodable downlink frame");
                }
            }
        }
    }

    // ========================================================================
    // Transport bridges
    // ========================================================================

    /// Bridge a transport's downlink streams into the inbound queues
    pub async fn read_from(&self, rx: DownlinkRx) -> Result<(), PortError> {
        let DownlinkRx {
            mut frames,
            mut commands,
        } = rx;

        let audio_loop = async {
            while let Some(item) = frames.next().await {
                let (stamp, frame) = item?;
                let Some(tx) = self.downlink_audio_tx.lock().clone() else {
                    break;
                };
                if tx.try_send((stamp, frame)).is_err() {
                    warn!("downlink audio queue full, dropping frame");
                }
            }
            Ok(())
        };
        let command_loop = async {
            while let Some(item) = commands.next().await {
                let event = item?;
                let Some(tx) = self.command_tx.lock().clone() else {
                    break;
                };
                if tx.try_send(event).is_err() {
                    warn!("command queue full, dropping command");
                }
            }
            Ok(())
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            result = async {
                let (a, b) = tokio::join!(audio_loop, command_loop);
                a.and(b)
            } => result,
        }
    }

    /// Bridge the outbound queues onto a transport's uplink
    pub async fn write_to<T: UplinkTx + ?Sized>(&self, tx: &T) -> Result<(), PortError> {
        let audio_loop = async {
            let mut rx = self.uplink_audio_rx.lock().await;
            while let Some((stamp, frame)) = rx.recv().await {
                tx.send_audio_frame(stamp, frame).await?;
            }
            Ok(())
        };
        let state_loop = async {
            let mut rx = self.uplink_state_rx.lock().await;
            while let Some(event) = rx.recv().await {
                tx.send_state(event).await?;
            }
            Ok(())
        };
        let stats_loop = async {
            let mut rx = self.uplink_stats_rx.lock().await;
            while let Some(event) = rx.recv().await {
                tx.send_stats(event).await?;
            }
            Ok(())
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            result = async {
                let (a, b, c) = tokio::join!(audio_loop, state_loop, stats_loop);
                a.and(b).and(c)
            } => result,
        }
    }

    /// Take the inbound command sequence; at most one consumer
    pub fn commands(&self) -> Option<CommandStream> {
        self.command_rx
            .lock()
            .take()
            .map(|rx| CommandStream { rx })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Close the port and all five queues; idempotent
    pub fn close(&self) {
        self.cancel.cancel();
        self.uplink_audio_tx.lock().take();
        self.uplink_state_tx.lock().take();
        self.uplink_stats_tx.lock().take();
        self.downlink_audio_tx.lock().take();
        self.command_tx.lock().take();
        debug!("client port closed");
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ClientPort {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sparse tier snapshot for one reporting round, or `None` when the
/// round matches no tier.
///
/// Every 60s: battery, volume, brightness, light mode, system version,
/// wifi network, pair status. Every 120s: shaking, cellular. Every
/// 600s: wifi store.
fn tier_snapshot(stats: &StatsEvent, round: u64, now: EpochMillis) -> Option<StatsEvent> {
    let mut event = StatsEvent::at(now);
    let mut matched = false;

    if round % 3 == 0 {
        matched = true;
        event.battery = stats.battery.clone();
        event.volume = stats.volume.clone();
        event.brightness = stats.brightness.clone();
        event.light_mode = stats.light_mode.clone();
        event.system_version = stats.system_version.clone();
        event.wifi_network = stats.wifi_network.clone();
        event.pair_status = stats.pair_status.clone();
    }
    if round % 6 == 1 {
        matched = true;
        event.shaking = stats.shaking;
        event.cellular = stats.cellular.clone();
    }
    if round % 30 == 2 {
        matched = true;
        event.wifi_store = stats.wifi_store.clone();
    }

    matched.then_some(event)
}
