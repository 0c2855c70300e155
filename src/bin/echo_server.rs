//! Echo server for testing gear audio latency
//!
//! Accepts every gear appearing on the bus and plays its own uplink
//! audio back to it after a configurable delay, so a round trip can be
//! heard and measured end to end.
//!
//! Run with:
//!   cargo run --bin echo-server -- --mqtt-host localhost --delay 1000
//!
//! Environment variables:
//!   ECHO_DELAY_MS - Delay in milliseconds (default: 1000)
//!   RUST_LOG - Log level (default: info)

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gearlink::audio::{CodecConfig, RealtimeBuffer, RealtimeEvent, StreamDecoder, Track};
use gearlink::bus::{random_client_id, MqttBus, MqttBusConfig};
use gearlink::config::BrokerConfig;
use gearlink::port::{ServerPort, UplinkData};
use gearlink::{Listener, ListenerConfig};

/// Drop the echo once the gear has been quiet this long
const QUIET_CUTOFF: Duration = Duration::from_millis(500);

/// Echo server for gear audio testing
#[derive(Parser, Debug)]
#[command(name = "echo-server")]
#[command(about = "Echo server for gear audio testing")]
struct Args {
    #[command(flatten)]
    broker: BrokerConfig,

    /// Echo delay in milliseconds
    #[arg(short, long, default_value_t = 1000, env = "ECHO_DELAY_MS")]
    delay: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let (bus, inbound) = MqttBus::connect(MqttBusConfig {
        host: args.broker.mqtt_host.clone(),
        port: args.broker.mqtt_port,
        client_id: random_client_id("gearlink-echo"),
        ..MqttBusConfig::default()
    });
    let listener = Listener::start(
        bus,
        inbound,
        ListenerConfig {
            scope: args.broker.scope.clone(),
            ..ListenerConfig::default()
        },
    )
    .await?;

    let delay = Duration::from_millis(args.delay);
    info!(delay_ms = args.delay, "echo server running");
    println!("Echoing gear audio with {}ms delay. Press Ctrl+C to stop.", args.delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            accepted = listener.accept() => match accepted {
                Ok((gear_id, port)) => {
                    info!(gear = %gear_id, "echoing gear");
                    tokio::spawn(echo_gear(gear_id, port, delay));
                }
                Err(_) => break,
            },
        }
    }

    listener.close();
    Ok(())
}

/// Play one gear's uplink back to it after `delay`
async fn echo_gear(gear_id: String, port: Arc<ServerPort>, delay: Duration) {
    let mut playout = RealtimeBuffer::new();
    let mut decoder = match StreamDecoder::new(&CodecConfig::default()) {
        Ok(decoder) => decoder,
        Err(e) => {
            warn!(gear = %gear_id, error = %e, "cannot open decoder");
            return;
        }
    };

    let mut track: Option<Track> = None;
    let mut queue: VecDeque<(Instant, Vec<i16>)> = VecDeque::new();
    let mut last_frame = Instant::now();

    loop {
        tokio::select! {
            data = port.poll() => match data {
                Ok(UplinkData::Audio { stamp, frame }) => {
                    if let Err(e) = playout.append(frame, stamp) {
                        warn!(gear = %gear_id, error = %e, "uplink frame rejected");
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            },
            event = playout.next() => {
                let Some(event) = event else { break };
                if matches!(event, RealtimeEvent::Frame(_)) {
                    last_frame = Instant::now();
                } else if track.is_none() {
                    // Nothing playing and nothing arriving: skip silence
                    continue;
                }
                let pcm = decoder.decode_event(&event);
                queue.push_back((Instant::now() + delay, pcm));

                if last_frame.elapsed() > QUIET_CUTOFF {
                    // The gear went quiet; let the echo fade out
                    track = None;
                    queue.clear();
                    continue;
                }

                while let Some(entry) = queue.pop_front() {
                    if entry.0 > Instant::now() {
                        queue.push_front(entry);
                        break;
                    }
                    if track.is_none() {
                        match port.new_foreground_track() {
                            Ok(new_track) => track = Some(new_track),
                            Err(_) => return,
                        }
                    }
                    let failed = track
                        .as_ref()
                        .map(|current| current.write(&entry.1).is_err())
                        .unwrap_or(true);
                    if failed {
                        track = None;
                    }
                }
            }
        }
    }
    playout.close();
    info!(gear = %gear_id, "gear gone");
}
