//! gearlink - Real-time audio and control plane for edge gears

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gearlink::audio::{
    CodecConfig, LinkMonitor, RealtimeBuffer, RealtimeEvent, StreamDecoder, FRAME_DURATION,
};
use gearlink::bus::{
    bind_downlink, random_client_id, subscribe_downlink, BusUplinkTx, MessageBus, MqttBus,
    MqttBusConfig,
};
use gearlink::config::BrokerConfig;
use gearlink::port::{
    ClientPort, ClientPortConfig, MicSource, PortError, ServerPort, SpeakerSink, UplinkData,
};
use gearlink::protocol::{Battery, State, TopicScheme};
use gearlink::{Listener, ListenerConfig};

#[derive(Parser)]
#[command(name = "gearlink")]
#[command(about = "Real-time audio and control plane for edge gears")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the compute-side listener against a broker
    Serve {
        #[command(flatten)]
        broker: BrokerConfig,

        /// Release ports with no uplink traffic for this many seconds
        #[arg(long, default_value_t = 30)]
        idle_timeout: u64,
    },

    /// Emulate a gear: test-tone mic, periodic stats, command log
    Simulate {
        #[command(flatten)]
        broker: BrokerConfig,

        /// Gear id (random if omitted)
        #[arg(long)]
        gear_id: Option<String>,
    },
}

fn setup_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run_serve(broker: BrokerConfig, idle_timeout: u64) -> Result<()> {
    let (bus, inbound) = MqttBus::connect(MqttBusConfig {
        host: broker.mqtt_host.clone(),
        port: broker.mqtt_port,
        client_id: random_client_id("gearlink-serve"),
        ..MqttBusConfig::default()
    });

    let listener = Listener::start(
        bus,
        inbound,
        ListenerConfig {
            scope: broker.scope.clone(),
            idle_timeout: Duration::from_secs(idle_timeout),
            ..ListenerConfig::default()
        },
    )
    .await?;

    info!(scope = %broker.scope, "listener running");
    println!("Listening for gears. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            accepted = listener.accept() => match accepted {
                Ok((gear_id, port)) => {
                    println!("gear connected: {}", gear_id);
                    tokio::spawn(monitor_gear(gear_id, port));
                }
                Err(_) => break,
            },
        }
    }

    info!("shutting down");
    listener.close();
    Ok(())
}

/// Drive a gear's uplink until its port closes: audio goes through the
/// jitter/realtime pipeline and the loss-concealing decoder, state and
/// stats deltas are logged.
async fn monitor_gear(gear_id: String, port: Arc<ServerPort>) {
    let mut playout = RealtimeBuffer::new();
    let mut decoder = match StreamDecoder::new(&CodecConfig::default()) {
        Ok(decoder) => decoder,
        Err(e) => {
            warn!(gear = %gear_id, error = %e, "cannot open uplink decoder");
            return;
        }
    };
    let mut link = LinkMonitor::new();

    let mut report = tokio::time::interval(Duration::from_secs(30));
    report.tick().await;
    loop {
        tokio::select! {
            data = port.poll() => match data {
                Ok(UplinkData::Audio { stamp, frame }) => {
                    link.observe_frame(stamp, frame.duration());
                    if let Err(e) = playout.append(frame, stamp) {
                        warn!(gear = %gear_id, error = %e, "uplink frame rejected");
                    }
                }
                Ok(UplinkData::State(event)) => {
                    info!(gear = %gear_id, state = ?event.state, "state");
                }
                Ok(UplinkData::StatsChanges(changes)) => {
                    info!(gear = %gear_id, ?changes, "stats changed");
                }
                Err(_) => break,
            },
            event = playout.next() => {
                let Some(event) = event else { break };
                if let RealtimeEvent::Loss(duration) = &event {
                    link.observe_loss(*duration);
                }
                decoder.decode_event(&event);
            },
            _ = report.tick() => {
                let quality = link.snapshot();
                let stream = decoder.stats();
                info!(
                    gear = %gear_id,
                    delay_ms = quality.delay_ms,
                    jitter_ms = quality.jitter_ms,
                    loss_rate = quality.loss_rate,
                    frames = stream.frames_decoded,
                    concealed = stream.losses_concealed,
                    dropped = playout.jitter_stats().frames_dropped,
                    "uplink quality"
                );
            }
        }
    }
    playout.close();
    info!(gear = %gear_id, "gear disconnected");
}

/// 440 Hz test tone at the uplink frame cadence
struct ToneMic {
    phase: f32,
    step: f32,
}

impl ToneMic {
    fn new(sample_rate: u32) -> Self {
        Self {
            phase: 0.0,
            step: 440.0 * 2.0 * std::f32::consts::PI / sample_rate as f32,
        }
    }
}

#[async_trait]
impl MicSource for ToneMic {
    async fn read_frame(&mut self, buf: &mut [i16]) -> Result<usize, PortError> {
        tokio::time::sleep(FRAME_DURATION).await;
        for sample in buf.iter_mut() {
            *sample = (self.phase.sin() * 6000.0) as i16;
            self.phase += self.step;
        }
        self.phase %= 2.0 * std::f32::consts::PI;
        Ok(buf.len())
    }
}

/// Swallows downlink audio, counting what it plays
struct CountingSpeaker {
    samples: u64,
}

#[async_trait]
impl SpeakerSink for CountingSpeaker {
    async fn write(&mut self, samples: &[i16]) -> Result<(), PortError> {
        self.samples += samples.len() as u64;
        Ok(())
    }
}

async fn run_simulate(broker: BrokerConfig, gear_id: Option<String>) -> Result<()> {
    let gear_id =
        gear_id.unwrap_or_else(|| format!("sim-{}", uuid::Uuid::new_v4().simple()));
    let scheme = TopicScheme::new(&broker.scope);

    let (bus, inbound) = MqttBus::connect(MqttBusConfig {
        host: broker.mqtt_host.clone(),
        port: broker.mqtt_port,
        client_id: random_client_id(&format!("gearlink-{}", gear_id)),
        ..MqttBusConfig::default()
    });
    subscribe_downlink(bus.as_ref(), &scheme, &gear_id).await?;
    let downlink = bind_downlink(inbound, scheme.clone());

    let port = Arc::new(ClientPort::new(ClientPortConfig::default()));
    let mut commands = port
        .commands()
        .expect("fresh port has its command stream");

    // Initial health snapshot in one upload
    port.begin_batch();
    port.set_battery(Battery {
        percentage: 87,
        is_charging: false,
        current_capacity: None,
        cycle_count: None,
        original_capacity: None,
        temperature: None,
        voltage: None,
    });
    port.set_volume(60);
    port.set_brightness(50);
    port.end_batch();
    port.set_state(State::Ready);
    port.start_periodic_reporting();

    let uplink = BusUplinkTx::new(bus.clone() as Arc<dyn MessageBus>, &scheme, &gear_id);
    let writer = port.clone();
    tokio::spawn(async move {
        if let Err(e) = writer.write_to(&uplink).await {
            warn!(error = %e, "uplink bridge failed");
        }
    });

    let reader = port.clone();
    tokio::spawn(async move {
        if let Err(e) = reader.read_from(downlink).await {
            warn!(error = %e, "downlink bridge failed");
        }
    });

    let mic_port = port.clone();
    tokio::spawn(async move {
        let mut mic = ToneMic::new(gearlink::audio::PcmFormat::VOICE.sample_rate);
        if let Err(e) = mic_port.read_from_mic(&mut mic).await {
            warn!(error = %e, "mic loop failed");
        }
    });

    let speaker_port = port.clone();
    tokio::spawn(async move {
        let mut speaker = CountingSpeaker { samples: 0 };
        if let Err(e) = speaker_port.write_to_speaker(&mut speaker).await {
            warn!(error = %e, "speaker loop failed");
        }
        info!(samples = speaker.samples, "speaker drained");
    });

    println!("simulating gear {}. Press Ctrl+C to stop.", gear_id);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            command = commands.next() => match command {
                Some(event) => {
                    println!("command: {:?}", event.command);
                    apply_command(&port, &event.command);
                }
                None => break,
            },
        }
    }

    info!("shutting down");
    port.set_state(State::ShuttingDown);
    tokio::time::sleep(Duration::from_millis(100)).await;
    port.close();
    Ok(())
}

/// Reflect the commands a real gear would act on back into its stats
fn apply_command(port: &ClientPort, command: &gearlink::protocol::SessionCommand) {
    use gearlink::protocol::SessionCommand;
    match command {
        SessionCommand::SetVolume(v) => port.set_volume(*v),
        SessionCommand::SetBrightness(v) => port.set_brightness(*v),
        SessionCommand::SetLightMode(mode) => port.set_light_mode(mode.clone()),
        SessionCommand::Streaming(on) => {
            port.set_state(if *on { State::Streaming } else { State::Ready });
        }
        SessionCommand::Halt { sleep, .. } if *sleep => port.set_state(State::Sleeping),
        _ => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Serve {
            broker,
            idle_timeout,
        } => run_serve(broker, idle_timeout).await?,
        Commands::Simulate { broker, gear_id } => run_simulate(broker, gear_id).await?,
    }

    Ok(())
}
