//! Full device-side session over the embedded bus
//!
//! Runs a complete client port (transport bridges, mic loop, command
//! stream) against the listener, wired exactly the way the simulator
//! binary wires a real gear.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use gearlink::bus::{bind_downlink, subscribe_downlink, BusUplinkTx, LocalBus, MessageBus};
use gearlink::port::{ClientPort, ClientPortConfig, MicSource, PortError, UplinkData};
use gearlink::protocol::{SessionCommand, State, TopicScheme};
use gearlink::{Listener, ListenerConfig};

struct BurstMic {
    frames_left: usize,
}

#[async_trait]
impl MicSource for BurstMic {
    async fn read_frame(&mut self, buf: &mut [i16]) -> Result<usize, PortError> {
        if self.frames_left == 0 {
            return Ok(0);
        }
        self.frames_left -= 1;
        buf.fill(1200);
        Ok(buf.len())
    }
}

/// Given a gear built from a client port and the bus adapters
/// When it runs against a listener
/// Then states, audio, stats deltas, and commands all round-trip
#[tokio::test]
async fn test_client_port_session_over_bus() {
    let bus = LocalBus::new();
    let (server_connection, server_inbound) = bus.client();
    let listener = Listener::start(
        Arc::new(server_connection),
        server_inbound,
        ListenerConfig {
            scope: "lab".to_string(),
            ..ListenerConfig::default()
        },
    )
    .await
    .unwrap();

    // Device side, wired like the simulator
    let scheme = TopicScheme::new("lab");
    let (device_connection, device_inbound) = bus.client();
    let device_connection: Arc<dyn MessageBus> = Arc::new(device_connection);
    subscribe_downlink(device_connection.as_ref(), &scheme, "gear-x")
        .await
        .unwrap();
    let downlink = bind_downlink(device_inbound, scheme.clone());
    let uplink = BusUplinkTx::new(device_connection, &scheme, "gear-x");

    let client = Arc::new(ClientPort::new(ClientPortConfig::default()));
    let mut commands = client.commands().expect("command stream");
    {
        let client = client.clone();
        tokio::spawn(async move { client.write_to(&uplink).await });
    }
    {
        let client = client.clone();
        tokio::spawn(async move { client.read_from(downlink).await });
    }

    client.set_state(State::Ready);
    client.set_volume(10); // seeds the server-side cache, no delta yet

    let (gear_id, port) = timeout(Duration::from_secs(1), listener.accept())
        .await
        .expect("gear accepted")
        .unwrap();
    assert_eq!(gear_id, "gear-x");

    let mut mic = BurstMic { frames_left: 2 };
    client.read_from_mic(&mut mic).await.unwrap();

    let mut states = 0;
    let mut audio_frames = 0;
    for _ in 0..3 {
        match timeout(Duration::from_secs(1), port.poll())
            .await
            .expect("uplink event")
            .unwrap()
        {
            UplinkData::State(event) => {
                assert_eq!(event.state, State::Ready);
                states += 1;
            }
            UplinkData::Audio { frame, .. } => {
                assert!(frame.len() > 1);
                audio_frames += 1;
            }
            UplinkData::StatsChanges(changes) => {
                panic!("seeding stats must not produce a delta: {changes:?}")
            }
        }
    }
    assert_eq!(states, 1);
    assert_eq!(audio_frames, 2);

    // A changed stat now surfaces as a delta on the agent side
    client.set_volume(55);
    match timeout(Duration::from_secs(1), port.poll())
        .await
        .expect("stats delta")
        .unwrap()
    {
        UplinkData::StatsChanges(changes) => {
            assert_eq!(changes.volume.unwrap().percentage, 55);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(port.volume(), Some(55));

    // Commands built on the server arrive on the gear's lazy sequence
    port.set_light_mode("pulse");
    let event = timeout(Duration::from_secs(1), commands.next())
        .await
        .expect("command")
        .unwrap();
    assert_eq!(
        event.command,
        SessionCommand::SetLightMode("pulse".to_string())
    );

    client.close();
    listener.close();
}
