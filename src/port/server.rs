//! Server-side gear port
//!
//! Represents a single gear from the compute side: an uplink fan-in
//! queue surfaced through `poll`, a downlink mixer re-encoded into paced
//! stamped frames, a command FIFO, and cached snapshots of the latest
//! state and stats.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audio::{
    create_codec, CodecConfig, Mixer, MixerOptions, Track, TrackController, FRAME_DURATION,
};
use crate::protocol::{
    Battery, CellularNetwork, EpochMillis, Frame, NfcTag, OtaUpgrade, PairStatus,
    SessionCommand, SessionCommandEvent, Shaking, StateEvent, StatsChanges, StatsEvent,
    SystemVersion, WifiCredentials, WifiNetwork, WifiStore, STATE_EVENT_VERSION,
};

use super::error::PortError;
use super::traits::{DownlinkTx, UplinkRx};

/// Lead the encoder keeps over wall clock on the downlink; balances
/// network jitter against interactive latency.
pub const BUFFERING_DURATION: Duration = Duration::from_millis(360);

/// Sleep while the lead is still being built up
const FAST_FILL_SLEEP: Duration = Duration::from_millis(5);

/// One element of the uplink as seen by the agent
#[derive(Debug, Clone, PartialEq)]
pub enum UplinkData {
    Audio { stamp: EpochMillis, frame: Frame },
    State(StateEvent),
    StatsChanges(StatsChanges),
}

/// Server port tunables
#[derive(Debug, Clone)]
pub struct ServerPortConfig {
    pub codec: CodecConfig,
    pub uplink_capacity: usize,
    pub command_capacity: usize,
}

impl Default for ServerPortConfig {
    fn default() -> Self {
        Self {
            codec: CodecConfig::default(),
            uplink_capacity: 64,
            command_capacity: 32,
        }
    }
}

#[derive(Default)]
struct TrackSlots {
    background: Option<TrackController>,
    foreground: Option<TrackController>,
    overlay: Option<TrackController>,
}

/// One gear as seen from the compute side
pub struct ServerPort {
    gear_id: String,
    config: ServerPortConfig,
    mixer: Mixer,
    uplink_tx: Mutex<Option<mpsc::Sender<UplinkData>>>,
    uplink_rx: tokio::sync::Mutex<mpsc::Receiver<UplinkData>>,
    command_tx: Mutex<Option<mpsc::Sender<SessionCommandEvent>>>,
    command_rx: tokio::sync::Mutex<mpsc::Receiver<SessionCommandEvent>>,
    state: RwLock<Option<StateEvent>>,
    stats: RwLock<Option<StatsEvent>>,
    tracks: Mutex<TrackSlots>,
    last_active: AtomicI64,
    cancel: CancellationToken,
}

impl ServerPort {
    pub fn new(gear_id: impl Into<String>, config: ServerPortConfig) -> Self {
        Self::with_cancellation(gear_id, config, CancellationToken::new())
    }

    pub fn with_cancellation(
        gear_id: impl Into<String>,
        config: ServerPortConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (uplink_tx, uplink_rx) = mpsc::channel(config.uplink_capacity);
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity);

        // Track lifecycle drives the streaming on/off command: only the
        // global 0<->1 transitions are announced to the gear.
        let live_tracks = Arc::new(AtomicUsize::new(0));
        let created_count = live_tracks.clone();
        let created_commands = command_tx.clone();
        let closed_count = live_tracks;
        let closed_commands = command_tx.clone();

        let mixer = Mixer::new(
            config.codec.format,
            MixerOptions {
                silence_gap: None,
                on_track_created: Some(Arc::new(move || {
                    if created_count.fetch_add(1, Ordering::SeqCst) == 0 {
                        push_command(
                            &created_commands,
                            SessionCommandEvent::now(SessionCommand::Streaming(true)),
                        );
                    }
                })),
                on_track_closed: Some(Arc::new(move || {
                    if closed_count.fetch_sub(1, Ordering::SeqCst) == 1 {
                        push_command(
                            &closed_commands,
                            SessionCommandEvent::now(SessionCommand::Streaming(false)),
                        );
                    }
                })),
            },
        );

        Self {
            gear_id: gear_id.into(),
            config,
            mixer,
            uplink_tx: Mutex::new(Some(uplink_tx)),
            uplink_rx: tokio::sync::Mutex::new(uplink_rx),
            command_tx: Mutex::new(Some(command_tx)),
            command_rx: tokio::sync::Mutex::new(command_rx),
            state: RwLock::new(None),
            stats: RwLock::new(None),
            tracks: Mutex::new(TrackSlots::default()),
            last_active: AtomicI64::new(EpochMillis::now().as_millis()),
            cancel,
        }
    }

    pub fn gear_id(&self) -> &str {
        &self.gear_id
    }

    /// When this port last saw uplink traffic
    pub fn last_active(&self) -> EpochMillis {
        EpochMillis::from_millis(self.last_active.load(Ordering::Relaxed))
    }

    fn touch(&self) {
        self.last_active
            .store(EpochMillis::now().as_millis(), Ordering::Relaxed);
    }

    // ========================================================================
    // Uplink
    // ========================================================================

    /// Feed one parsed uplink audio frame
    pub fn handle_audio(&self, stamp: EpochMillis, frame: Frame) {
        self.touch();
        self.emit(UplinkData::Audio { stamp, frame });
    }

    /// Feed one state event; stale or unknown-version events are dropped
    pub fn handle_state(&self, event: StateEvent) {
        self.touch();
        if event.version != STATE_EVENT_VERSION {
            debug!(gear = %self.gear_id, version = event.version, "dropping state event");
            return;
        }
        {
            let mut cached = self.state.write();
            match cached.as_ref() {
                Some(current) if event.time < current.time => {
                    debug!(gear = %self.gear_id, "dropping stale state event");
                    return;
                }
                _ => *cached = Some(event.clone()),
            }
        }
        self.emit(UplinkData::State(event));
    }

    /// Feed one stats event; emits the delta when anything changed
    pub fn handle_stats(&self, event: StatsEvent) {
        self.touch();
        let changes = {
            let mut cached = self.stats.write();
            match cached.as_mut() {
                Some(current) => current.merge_with(&event),
                None => {
                    *cached = Some(event);
                    None
                }
            }
        };
        if let Some(changes) = changes {
            self.emit(UplinkData::StatsChanges(changes));
        }
    }

    fn emit(&self, data: UplinkData) {
        let Some(tx) = self.uplink_tx.lock().clone() else {
            return; // closed: sends are silently dropped
        };
        if tx.try_send(data).is_err() {
            warn!(gear = %self.gear_id, "uplink queue full, dropping event");
        }
    }

    /// Next uplink element; `Closed` once the port shuts down and the
    /// queue drains
    pub async fn poll(&self) -> Result<UplinkData, PortError> {
        let mut rx = self.uplink_rx.lock().await;
        rx.recv().await.ok_or(PortError::Closed)
    }

    /// Consume a transport's uplink streams until it closes
    ///
    /// The first error from any of the three readers is returned once
    /// all of them have quit.
    pub async fn read_from(&self, rx: UplinkRx) -> Result<(), PortError> {
        let UplinkRx {
            mut frames,
            mut states,
            mut stats,
        } = rx;

        let audio_loop = async {
            while let Some(item) = frames.next().await {
                let (stamp, frame) = item?;
                self.handle_audio(stamp, frame);
            }
            Ok(())
        };
        let state_loop = async {
            while let Some(item) = states.next().await {
                self.handle_state(item?);
            }
            Ok(())
        };
        let stats_loop = async {
            while let Some(item) = stats.next().await {
                self.handle_stats(item?);
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

    // ========================================================================
    // Downlink
    // ========================================================================

    /// Drive the downlink: paced audio streaming and command forwarding
    /// run in parallel until the port closes or the transport fails.
    pub async fn write_to<T: DownlinkTx + ?Sized>(&self, tx: &T) -> Result<(), PortError> {
        let (audio, commands) =
            tokio::join!(self.stream_audio_to(tx), self.forward_commands_to(tx));
        audio.and(commands)
    }

    /// Read mixed PCM, encode, and send stamped frames paced against the
    /// buffering target.
    pub async fn stream_audio_to<T: DownlinkTx + ?Sized>(&self, tx: &T) -> Result<(), PortError> {
        let mut codec = create_codec(&self.config.codec)
            .map_err(|e| PortError::Transport(e.to_string()))?;
        let mut pcm = vec![0i16; codec.frame_samples()];
        let mut stamp = EpochMillis::now();

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                r = self.mixer.read(&mut pcm) => r,
            };
            if read.is_err() {
                return Ok(()); // mixer closed with the port
            }

            let now = EpochMillis::now();
            if stamp < now {
                // Behind the clock: catch up and send immediately
                stamp = now;
            } else {
                let delay = stamp - now;
                let sleep = if delay < BUFFERING_DURATION {
                    FAST_FILL_SLEEP
                } else {
                    delay - BUFFERING_DURATION
                };
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(sleep) => {}
                }
            }

            let encoded = codec
                .encode(&pcm)
                .map_err(|e| PortError::Audio(crate::audio::AudioError::Codec(e.to_string())))?;
            if encoded.is_empty() {
                // Discontinuous transmission: advance the clock only
                stamp += FRAME_DURATION;
                continue;
            }
            let frame = Frame::new(encoded)?;
            tx.send_audio_frame(stamp, frame).await?;
            stamp += FRAME_DURATION;
        }
    }

    async fn forward_commands_to<T: DownlinkTx + ?Sized>(&self, tx: &T) -> Result<(), PortError> {
        let mut rx = self.command_rx.lock().await;
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                e = rx.recv() => e,
            };
            match event {
                Some(mut event) => {
                    event.issue_at = EpochMillis::now();
                    tx.send_command(event).await?;
                }
                None => return Ok(()),
            }
        }
    }

    // ========================================================================
    // Tracks
    // ========================================================================

    /// Low-gain bed audio; replaces the previous background track
    pub fn new_background_track(&self) -> Result<Track, PortError> {
        self.new_slot_track(0.1, Duration::from_secs(1), |slots, ctl| {
            slots.background.replace(ctl)
        })
    }

    /// Primary speech; replaces the previous foreground track
    pub fn new_foreground_track(&self) -> Result<Track, PortError> {
        self.new_slot_track(1.0, Duration::from_millis(200), |slots, ctl| {
            slots.foreground.replace(ctl)
        })
    }

    /// Short cues layered on top; replaces the previous overlay track
    pub fn new_overlay_track(&self) -> Result<Track, PortError> {
        self.new_slot_track(1.0, Duration::from_secs(1), |slots, ctl| {
            slots.overlay.replace(ctl)
        })
    }

    fn new_slot_track(
        &self,
        gain: f32,
        fade_out: Duration,
        store: impl FnOnce(&mut TrackSlots, TrackController) -> Option<TrackController>,
    ) -> Result<Track, PortError> {
        let (track, controller) = self.mixer.new_track()?;
        controller.set_gain(gain);
        controller.set_fade_out_duration(fade_out);
        let previous = {
            let mut slots = self.tracks.lock();
            store(&mut slots, controller)
        };
        // The new track is live before the old one winds down, so the
        // global track count never dips through zero on replacement.
        if let Some(previous) = previous {
            previous.close_write();
        }
        Ok(track)
    }

    /// Close all three track slots immediately, no fade
    pub fn interrupt(&self) {
        let slots = {
            let mut tracks = self.tracks.lock();
            std::mem::take(&mut *tracks)
        };
        for controller in [slots.background, slots.foreground, slots.overlay]
            .into_iter()
            .flatten()
        {
            controller.close();
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Queue an arbitrary command for the gear
    pub fn issue_command(&self, command: SessionCommand) {
        let Some(tx) = self.command_tx.lock().clone() else {
            return;
        };
        push_command(&tx, SessionCommandEvent::now(command));
    }

    pub fn set_volume(&self, percentage: i32) {
        self.issue_command(SessionCommand::SetVolume(percentage));
    }

    pub fn set_brightness(&self, percentage: i32) {
        self.issue_command(SessionCommand::SetBrightness(percentage));
    }

    pub fn set_light_mode(&self, mode: impl Into<String>) {
        self.issue_command(SessionCommand::SetLightMode(mode.into()));
    }

    pub fn set_wifi(&self, credentials: WifiCredentials) {
        self.issue_command(SessionCommand::SetWifi(credentials));
    }

    pub fn delete_wifi(&self, ssid: impl Into<String>) {
        self.issue_command(SessionCommand::DeleteWifi(ssid.into()));
    }

    pub fn reset(&self) {
        self.issue_command(SessionCommand::Reset { unpair: false });
    }

    pub fn unpair(&self) {
        self.issue_command(SessionCommand::Reset { unpair: true });
    }

    pub fn sleep(&self) {
        self.issue_command(SessionCommand::Halt {
            sleep: true,
            shutdown: false,
            interrupt: false,
        });
    }

    pub fn shutdown(&self) {
        self.issue_command(SessionCommand::Halt {
            sleep: false,
            shutdown: true,
            interrupt: false,
        });
    }

    pub fn raise_call(&self, call: bool) {
        self.issue_command(SessionCommand::Raise { call });
    }

    pub fn upgrade_firmware(&self, descriptor: OtaUpgrade) {
        self.issue_command(SessionCommand::OtaUpgrade(descriptor));
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub fn state(&self) -> Option<StateEvent> {
        self.state.read().clone()
    }

    pub fn stats(&self) -> Option<StatsEvent> {
        self.stats.read().clone()
    }

    pub fn volume(&self) -> Option<i32> {
        self.stats.read().as_ref()?.volume.as_ref().map(|v| v.percentage)
    }

    pub fn brightness(&self) -> Option<i32> {
        self.stats
            .read()
            .as_ref()?
            .brightness
            .as_ref()
            .map(|b| b.percentage)
    }

    pub fn light_mode(&self) -> Option<String> {
        self.stats
            .read()
            .as_ref()?
            .light_mode
            .as_ref()
            .map(|l| l.mode.clone())
    }

    pub fn battery(&self) -> Option<Battery> {
        self.stats.read().as_ref()?.battery.clone()
    }

    pub fn system_version(&self) -> Option<SystemVersion> {
        self.stats.read().as_ref()?.system_version.clone()
    }

    pub fn cellular(&self) -> Option<CellularNetwork> {
        self.stats.read().as_ref()?.cellular.clone()
    }

    pub fn wifi_network(&self) -> Option<WifiNetwork> {
        self.stats.read().as_ref()?.wifi_network.clone()
    }

    pub fn wifi_store(&self) -> Option<WifiStore> {
        self.stats.read().as_ref()?.wifi_store.clone()
    }

    pub fn pair_status(&self) -> Option<PairStatus> {
        self.stats.read().as_ref()?.pair_status.clone()
    }

    pub fn read_nfc_tag(&self) -> Option<Vec<NfcTag>> {
        self.stats.read().as_ref()?.read_nfc_tag.clone()
    }

    pub fn shaking(&self) -> Option<Shaking> {
        self.stats.read().as_ref()?.shaking
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Close the port: cancel owned tasks, drop queues, close the mixer.
    /// Idempotent; all methods stay safe to call afterwards.
    pub fn close(&self) {
        self.cancel.cancel();
        self.uplink_tx.lock().take();
        self.command_tx.lock().take();
        self.interrupt();
        self.mixer.close();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ServerPort {
    fn drop(&mut self) {
        self.close();
    }
}

fn push_command(tx: &mpsc::Sender<SessionCommandEvent>, event: SessionCommandEvent) {
    if tx.try_send(event).is_err() {
        warn!("command queue full, dropping command");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::traits::UplinkTx;
    use crate::protocol::State;

    fn port() -> ServerPort {
        ServerPort::new("gear-1", ServerPortConfig::default())
    }

    fn state_event(time: i64, state: State) -> StateEvent {
        StateEvent {
            time: EpochMillis::from_millis(time),
            update_at: EpochMillis::from_millis(time),
            state,
            ..StateEvent::default()
        }
    }

    #[tokio::test]
    async fn test_state_last_writer_wins() {
        let port = port();
        port.handle_state(state_event(1000, State::Recording));
        port.handle_state(state_event(500, State::Ready));

        assert_eq!(port.state().unwrap().state, State::Recording);
        // Only the accepted event reached the uplink queue
        match port.poll().await.unwrap() {
            UplinkData::State(e) => assert_eq!(e.state, State::Recording),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_stats_event_produces_no_delta() {
        let port = port();
        let mut event = StatsEvent::at(EpochMillis::from_millis(100));
        event.shaking = Some(Shaking { level: 2 });
        port.handle_stats(event);

        assert_eq!(port.shaking(), Some(Shaking { level: 2 }));

        // Second event with a change produces exactly that delta
        let mut event = StatsEvent::at(EpochMillis::from_millis(200));
        event.shaking = Some(Shaking { level: 5 });
        port.handle_stats(event);

        match port.poll().await.unwrap() {
            UplinkData::StatsChanges(changes) => {
                assert_eq!(changes.shaking, Some(Shaking { level: 5 }));
                assert!(changes.battery.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_audio_flows_through_uplink_queue() {
        let port = port();
        let frame = Frame::new(vec![0xF8, 1]).unwrap();
        port.handle_audio(EpochMillis::from_millis(50), frame.clone());

        match port.poll().await.unwrap() {
            UplinkData::Audio { stamp, frame: got } => {
                assert_eq!(stamp.as_millis(), 50);
                assert_eq!(got, frame);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_track_lifecycle_issues_streaming_commands() {
        let port = port();
        let track = port.new_foreground_track().unwrap();
        // Replacing the slot closes the drained predecessor without the
        // global count dipping through zero
        let track2 = port.new_foreground_track().unwrap();

        {
            let mut rx = port.command_rx.lock().await;
            let first = rx.try_recv().unwrap();
            assert_eq!(first.command, SessionCommand::Streaming(true));
            assert!(rx.try_recv().is_err());
        }

        drop(track); // already replaced, no effect
        drop(track2); // last live track: 1 -> 0

        let mut rx = port.command_rx.lock().await;
        let next = rx.try_recv().unwrap();
        assert_eq!(next.command, SessionCommand::Streaming(false));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_command_builders_preserve_order() {
        let port = port();
        port.set_volume(40);
        port.set_light_mode("pulse");
        port.raise_call(true);

        let mut rx = port.command_rx.lock().await;
        assert_eq!(
            rx.try_recv().unwrap().command,
            SessionCommand::SetVolume(40)
        );
        assert_eq!(
            rx.try_recv().unwrap().command,
            SessionCommand::SetLightMode("pulse".into())
        );
        assert_eq!(
            rx.try_recv().unwrap().command,
            SessionCommand::Raise { call: true }
        );
    }

    #[tokio::test]
    async fn test_full_uplink_queue_drops_instead_of_blocking() {
        let port = ServerPort::new(
            "gear-1",
            ServerPortConfig {
                uplink_capacity: 2,
                ..ServerPortConfig::default()
            },
        );
        for i in 0..5 {
            port.handle_audio(EpochMillis::from_millis(i * 20), Frame::new(vec![0xF8]).unwrap());
        }
        // Only the queue capacity survives; the rest were dropped
        assert!(port.poll().await.is_ok());
        assert!(port.poll().await.is_ok());
        port.close();
        assert!(matches!(port.poll().await, Err(PortError::Closed)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_silences_handlers() {
        let port = port();
        port.close();
        port.close();
        assert!(port.is_closed());

        // Safe no-ops after close
        port.handle_audio(EpochMillis::ZERO, Frame::new(vec![0xF8]).unwrap());
        port.set_volume(10);
        assert!(port.new_foreground_track().is_err());
        assert!(matches!(port.poll().await, Err(PortError::Closed)));
    }

    #[tokio::test]
    async fn test_read_from_pipe_until_closed() {
        let port = port();
        let (tx, rx) = crate::port::pipe::uplink_pipe();

        tx.send_state(state_event(10, State::Ready)).await.unwrap();
        drop(tx);

        port.read_from(rx).await.unwrap();
        assert_eq!(port.state().unwrap().state, State::Ready);
    }
}
