//! Session loopback tests
//!
//! Wire a client port to a server port through the in-process pipe and
//! exercise the full uplink and downlink contracts without a bus.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use gearlink::port::{
    pipe, ClientPort, ClientPortConfig, MicSource, PortError, ServerPort, ServerPortConfig,
    SpeakerSink, UplinkData,
};
use gearlink::protocol::{SessionCommand, State};

/// A mic that produces a fixed number of frames, then ends
struct ScriptedMic {
    frames_left: usize,
}

#[async_trait]
impl MicSource for ScriptedMic {
    async fn read_frame(&mut self, buf: &mut [i16]) -> Result<usize, PortError> {
        if self.frames_left == 0 {
            return Ok(0);
        }
        self.frames_left -= 1;
        for (i, sample) in buf.iter_mut().enumerate() {
            *sample = (i % 100) as i16;
        }
        Ok(buf.len())
    }
}

/// Collects decoded downlink samples
#[derive(Clone)]
struct CollectingSpeaker {
    samples: Arc<Mutex<Vec<i16>>>,
}

#[async_trait]
impl SpeakerSink for CollectingSpeaker {
    async fn write(&mut self, samples: &[i16]) -> Result<(), PortError> {
        self.samples.lock().unwrap().extend_from_slice(samples);
        Ok(())
    }
}

/// Given a client port publishing state, stats, and mic audio
/// When the uplink pipe feeds a server port
/// Then the agent sees the state, the audio, and only real stat deltas
#[tokio::test]
async fn test_uplink_session_over_pipe() {
    let client = Arc::new(ClientPort::new(ClientPortConfig::default()));
    let server = Arc::new(ServerPort::new("g1", ServerPortConfig::default()));

    let (uplink_tx, uplink_rx) = pipe::uplink_pipe();
    let writer = {
        let client = client.clone();
        tokio::spawn(async move { client.write_to(&uplink_tx).await })
    };
    let reader = {
        let server = server.clone();
        tokio::spawn(async move { server.read_from(uplink_rx).await })
    };

    client.set_state(State::Recording);
    client.set_volume(70); // first stats event only seeds the cache
    let mut mic = ScriptedMic { frames_left: 3 };
    client.read_from_mic(&mut mic).await.unwrap();

    let mut states = 0;
    let mut audio_frames = 0;
    for _ in 0..4 {
        match timeout(Duration::from_secs(1), server.poll())
            .await
            .expect("uplink event")
            .unwrap()
        {
            UplinkData::State(event) => {
                assert_eq!(event.state, State::Recording);
                states += 1;
            }
            UplinkData::Audio { stamp, frame } => {
                assert!(stamp.as_millis() > 0);
                assert!(frame.len() > 1);
                audio_frames += 1;
            }
            UplinkData::StatsChanges(changes) => {
                panic!("first stats upload must not produce a delta: {changes:?}")
            }
        }
    }
    assert_eq!(states, 1);
    assert_eq!(audio_frames, 3);

    // A real change now surfaces as a delta
    client.set_volume(85);
    match timeout(Duration::from_secs(1), server.poll())
        .await
        .expect("stats delta")
        .unwrap()
    {
        UplinkData::StatsChanges(changes) => {
            assert_eq!(changes.volume.unwrap().percentage, 85);
            assert!(changes.brightness.is_none());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(server.volume(), Some(85));

    // Closing the client ends both bridge tasks cleanly
    client.close();
    timeout(Duration::from_secs(1), writer)
        .await
        .expect("writer ends")
        .unwrap()
        .unwrap();
    timeout(Duration::from_secs(1), reader)
        .await
        .expect("reader ends")
        .unwrap()
        .unwrap();
}

/// Given a server port with a foreground track and queued commands
/// When the downlink pipe feeds a client port
/// Then the gear receives the commands and plays the decoded audio
#[tokio::test]
async fn test_downlink_session_over_pipe() {
    let client = Arc::new(ClientPort::new(ClientPortConfig::default()));
    let server = Arc::new(ServerPort::new("g1", ServerPortConfig::default()));

    let (downlink_tx, downlink_rx) = pipe::downlink_pipe();
    {
        let server = server.clone();
        tokio::spawn(async move { server.write_to(&downlink_tx).await });
    }
    {
        let client = client.clone();
        tokio::spawn(async move { client.read_from(downlink_rx).await });
    }

    let mut commands = client.commands().expect("command stream");
    let speaker = CollectingSpeaker {
        samples: Arc::new(Mutex::new(Vec::new())),
    };
    {
        let client = client.clone();
        let mut speaker = speaker.clone();
        tokio::spawn(async move { client.write_to_speaker(&mut speaker).await });
    }

    server.set_volume(40);
    let event = timeout(Duration::from_secs(1), commands.next())
        .await
        .expect("command")
        .unwrap();
    assert_eq!(event.command, SessionCommand::SetVolume(40));
    assert!(event.issue_at >= event.time);

    // Opening a track announces streaming and carries audio
    let track = server.new_foreground_track().unwrap();
    let event = timeout(Duration::from_secs(1), commands.next())
        .await
        .expect("streaming on")
        .unwrap();
    assert_eq!(event.command, SessionCommand::Streaming(true));

    track.write(&vec![500i16; 960]).unwrap(); // three 20ms frames

    timeout(Duration::from_secs(5), async {
        loop {
            if speaker.samples.lock().unwrap().len() >= 960 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("downlink audio decoded");
    assert!(speaker
        .samples
        .lock()
        .unwrap()
        .iter()
        .take(960)
        .all(|&s| s == 500));

    // Draining the track turns streaming back off
    drop(track);
    let event = timeout(Duration::from_secs(5), commands.next())
        .await
        .expect("streaming off")
        .unwrap();
    assert_eq!(event.command, SessionCommand::Streaming(false));
}
