//! LiveKit implementation of [`RoomTransport`].

use crate::config::AudioConfig;
use crate::error::VoiceError;
use crate::room::{
    frame_pcm, ParticipantCapture, RoomConnector, RoomEvent, RoomState, RoomTransport,
    PLAYBACK_FRAME_MS,
};
use crate::service::VoiceService;
use crate::wav::samples_to_pcm;
use async_trait::async_trait;
use futures_util::StreamExt;
use livekit::options::TrackPublishOptions;
use livekit::prelude::{
    LocalAudioTrack, LocalTrack, RemoteAudioTrack, RemoteTrack, Room, RoomOptions, TrackSource,
};
use livekit::webrtc::audio_frame::AudioFrame;
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::audio_source::{AudioSourceOptions, RtcAudioSource};
use livekit::webrtc::audio_stream::native::NativeAudioStream;
use std::borrow::Cow;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Name of the agent's published audio track.
const TRACK_NAME: &str = "voice-assistant";

/// Audio buffered inside the native source before `capture_frame` waits.
const SOURCE_QUEUE_MS: u32 = 200;

/// Creates [`LiveKitRoom`]s sharing one token issuer.
#[derive(Debug, Clone)]
pub struct LiveKitConnector {
    service: VoiceService,
    audio: AudioConfig,
    playback_sample_rate: u32,
}

impl LiveKitConnector {
    pub fn new(service: VoiceService, audio: AudioConfig, playback_sample_rate: u32) -> Self {
        Self {
            service,
            audio,
            playback_sample_rate,
        }
    }
}

impl RoomConnector for LiveKitConnector {
    fn create(
        &self,
        events: mpsc::Sender<RoomEvent>,
    ) -> Result<Arc<dyn RoomTransport>, VoiceError> {
        if !self.service.is_enabled() {
            return Err(VoiceError::Config("LiveKit URL is not configured".to_string()));
        }
        if self.playback_sample_rate == 0 {
            return Err(VoiceError::Config(
                "playback sample rate must be positive".to_string(),
            ));
        }
        Ok(Arc::new(LiveKitRoom {
            service: self.service.clone(),
            audio: self.audio.clone(),
            playback_sample_rate: self.playback_sample_rate,
            events,
            state: Arc::new(RwLock::new(RoomState::Disconnected)),
            room: Arc::new(RwLock::new(None)),
            source: RwLock::new(None),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }))
    }
}

/// One agent connection to a LiveKit room.
pub struct LiveKitRoom {
    service: VoiceService,
    audio: AudioConfig,
    playback_sample_rate: u32,
    events: mpsc::Sender<RoomEvent>,
    state: Arc<RwLock<RoomState>>,
    room: Arc<RwLock<Option<Arc<Room>>>>,
    source: RwLock<Option<NativeAudioSource>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl LiveKitRoom {
    fn set_state(&self, state: RoomState) {
        if let Ok(mut guard) = self.state.write() {
            *guard = state;
        }
    }

    async fn publish_track(&self, room: &Room) -> Result<NativeAudioSource, VoiceError> {
        let source = NativeAudioSource::new(
            AudioSourceOptions::default(),
            self.playback_sample_rate,
            1,
            SOURCE_QUEUE_MS,
        );
        let track = LocalAudioTrack::create_audio_track(
            TRACK_NAME,
            RtcAudioSource::Native(source.clone()),
        );

        room.local_participant()
            .publish_track(
                LocalTrack::Audio(track),
                TrackPublishOptions {
                    source: TrackSource::Microphone,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| VoiceError::Room(format!("failed to publish audio track: {}", e)))?;

        Ok(source)
    }

    fn spawn_event_loop(
        &self,
        room_name: String,
        mut room_events: mpsc::UnboundedReceiver<livekit::RoomEvent>,
    ) {
        let cancel = self.cancel.clone();
        let tracker = self.tracker.clone();
        let events = self.events.clone();
        let state = self.state.clone();
        let audio = self.audio.clone();
        let own_identity = self.service.config().identity.clone();

        self.tracker.spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = room_events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                match event {
                    livekit::RoomEvent::TrackSubscribed {
                        track: RemoteTrack::Audio(track),
                        participant,
                        ..
                    } => {
                        let identity = participant.identity().0;
                        let Some(capture) =
                            ParticipantCapture::new(&identity, &own_identity, &audio, events.clone())
                        else {
                            continue;
                        };
                        tracing::info!(room = %room_name, participant = %identity, "subscribed to audio track");
                        tracker.spawn(capture_track(track, capture, audio.clone(), cancel.clone()));
                    }
                    livekit::RoomEvent::ParticipantConnected(participant) => {
                        let identity = participant.identity().0;
                        tracing::info!(room = %room_name, participant = %identity, "participant joined");
                        let _ = events.send(RoomEvent::ParticipantJoined { identity }).await;
                    }
                    livekit::RoomEvent::ParticipantDisconnected(participant) => {
                        let identity = participant.identity().0;
                        tracing::info!(room = %room_name, participant = %identity, "participant left");
                        let _ = events.send(RoomEvent::ParticipantLeft { identity }).await;
                    }
                    livekit::RoomEvent::Disconnected { reason } => {
                        tracing::warn!(room = %room_name, ?reason, "room disconnected");
                        if let Ok(mut guard) = state.write() {
                            *guard = RoomState::Disconnected;
                        }
                        let _ = events.send(RoomEvent::Disconnected).await;
                        break;
                    }
                    _ => {}
                }
            }
        });
    }
}

async fn capture_track(
    track: RemoteAudioTrack,
    mut capture: ParticipantCapture,
    audio: AudioConfig,
    cancel: CancellationToken,
) {
    let mut stream = NativeAudioStream::new(
        track.rtc_track(),
        audio.sample_rate as i32,
        i32::from(audio.channels),
    );

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = stream.next() => match frame {
                Some(frame) => {
                    let pcm = samples_to_pcm(&frame.data);
                    if !capture.push(&pcm, Instant::now()).await {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    tracing::debug!(participant = %capture.identity(), "audio capture loop exited");
}

#[async_trait]
impl RoomTransport for LiveKitRoom {
    async fn connect(&self, room_name: &str) -> Result<(), VoiceError> {
        if self.is_connected() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(VoiceError::RoomClosed);
        }
        self.set_state(RoomState::Connecting);

        let token = match self.service.agent_token(room_name) {
            Ok(token) => token,
            Err(e) => {
                self.set_state(RoomState::Disconnected);
                return Err(e);
            }
        };

        let (room, room_events) =
            match Room::connect(self.service.url(), &token, RoomOptions::default()).await {
                Ok(connected) => connected,
                Err(e) => {
                    self.set_state(RoomState::Disconnected);
                    return Err(VoiceError::Room(format!(
                        "failed to join room {}: {}",
                        room_name, e
                    )));
                }
            };
        let room = Arc::new(room);

        match self.publish_track(&room).await {
            Ok(source) => {
                if let Ok(mut guard) = self.source.write() {
                    *guard = Some(source);
                }
            }
            Err(e) => {
                tracing::warn!(room = %room_name, error = %e, "continuing receive-only");
            }
        }

        if let Ok(mut guard) = self.room.write() {
            *guard = Some(room);
        }
        self.spawn_event_loop(room_name.to_string(), room_events);
        self.set_state(RoomState::Connected);

        tracing::info!(room = %room_name, url = %self.service.url(), "connected to room");
        Ok(())
    }

    async fn play_audio(&self, pcm: &[u8]) -> Result<(), VoiceError> {
        if !self.is_connected() {
            return Ok(());
        }
        let Some(source) = self.source.read().ok().and_then(|guard| guard.as_ref().cloned()) else {
            return Ok(());
        };

        let samples_per_channel = self.playback_sample_rate * PLAYBACK_FRAME_MS / 1000;
        for samples in frame_pcm(pcm, self.playback_sample_rate, 1, PLAYBACK_FRAME_MS) {
            if self.cancel.is_cancelled() {
                break;
            }
            let frame = AudioFrame {
                data: Cow::Owned(samples),
                sample_rate: self.playback_sample_rate,
                num_channels: 1,
                samples_per_channel,
            };
            source
                .capture_frame(&frame)
                .await
                .map_err(|e| VoiceError::Room(format!("failed to write audio frame: {}", e)))?;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        if let Ok(mut guard) = self.source.write() {
            guard.take();
        }
        let room = self.room.write().ok().and_then(|mut guard| guard.take());
        if let Some(room) = room {
            if let Err(e) = room.close().await {
                tracing::warn!(error = %e, "error closing room");
            }
        }
        self.set_state(RoomState::Disconnected);
    }

    fn state(&self) -> RoomState {
        self.state
            .read()
            .map(|guard| *guard)
            .unwrap_or(RoomState::Disconnected)
    }

    fn participant_count(&self) -> usize {
        self.room
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|room| room.remote_participants().len()))
            .unwrap_or(0)
    }
}
