//! The seam between voice sessions and a multi-party audio room.
//!
//! A [`RoomTransport`] is one agent connection to one room. Implementations
//! deliver [`RoomEvent`]s on the channel handed to [`RoomConnector::create`]
//! and use [`ParticipantCapture`] to turn each remote participant's decoded
//! audio into utterances.

use crate::config::AudioConfig;
use crate::error::VoiceError;
use crate::vad::VoiceActivityDetector;
use crate::wav::pcm_to_samples;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Duration of each outgoing playback frame.
pub const PLAYBACK_FRAME_MS: u32 = 20;

/// Default capacity for a room's event channel.
pub const DEFAULT_ROOM_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Disconnected,
    Connecting,
    Connected,
}

/// Notifications raised by a room connection.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// A remote participant finished speaking. `pcm` is 16-bit little-endian
    /// audio at the capture sample rate.
    Utterance { identity: String, pcm: Vec<u8> },
    ParticipantJoined { identity: String },
    ParticipantLeft { identity: String },
    /// The room dropped the connection.
    Disconnected,
}

#[async_trait]
pub trait RoomTransport: Send + Sync {
    /// Joins `room_name` and publishes the agent's audio track. Succeeds
    /// immediately if already connected.
    async fn connect(&self, room_name: &str) -> Result<(), VoiceError>;

    /// Plays 16-bit little-endian PCM at the synthesis sample rate into the
    /// room. Returns once the audio has been handed to the transport; a
    /// disconnected room ignores the call.
    async fn play_audio(&self, pcm: &[u8]) -> Result<(), VoiceError>;

    /// Stops all capture loops, waits for them, then leaves the room.
    async fn disconnect(&self);

    fn state(&self) -> RoomState;

    fn is_connected(&self) -> bool {
        self.state() == RoomState::Connected
    }

    /// Remote participants currently in the room.
    fn participant_count(&self) -> usize;
}

/// Creates one room connection per voice session.
pub trait RoomConnector: Send + Sync {
    fn create(
        &self,
        events: mpsc::Sender<RoomEvent>,
    ) -> Result<Arc<dyn RoomTransport>, VoiceError>;
}

/// Speech segmentation for one remote participant.
///
/// Owned by the participant's capture loop. Finished utterances are sent as
/// [`RoomEvent::Utterance`].
#[derive(Debug)]
pub struct ParticipantCapture {
    identity: String,
    detector: VoiceActivityDetector,
    events: mpsc::Sender<RoomEvent>,
    bytes_per_ms: usize,
}

impl ParticipantCapture {
    /// Returns `None` for the agent's own identity so its playback is never
    /// fed back into transcription.
    pub fn new(
        identity: &str,
        own_identity: &str,
        audio: &AudioConfig,
        events: mpsc::Sender<RoomEvent>,
    ) -> Option<Self> {
        if identity == own_identity {
            return None;
        }
        Some(Self {
            identity: identity.to_string(),
            detector: VoiceActivityDetector::new(audio.vad_threshold, audio.silence_duration()),
            events,
            bytes_per_ms: audio.bytes_per_ms(),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Feeds one decoded frame. Returns `false` once nobody is listening.
    pub async fn push(&mut self, frame: &[u8], now: Instant) -> bool {
        let was_speaking = self.detector.is_speaking();
        let utterance = self.detector.push(frame, now);

        if !was_speaking && self.detector.is_speaking() {
            tracing::debug!(participant = %self.identity, "speech started");
        }

        match utterance {
            Some(pcm) => {
                tracing::info!(
                    participant = %self.identity,
                    bytes = pcm.len(),
                    duration_ms = pcm.len() / self.bytes_per_ms,
                    "speech ended"
                );
                self.events
                    .send(RoomEvent::Utterance {
                        identity: self.identity.clone(),
                        pcm,
                    })
                    .await
                    .is_ok()
            }
            None => !self.events.is_closed(),
        }
    }
}

/// Splits PCM into fixed-duration frames of samples.
///
/// A trailing odd byte is dropped and the last partial frame is zero-padded,
/// so every frame holds exactly `sample_rate * channels * frame_ms / 1000`
/// samples.
pub fn frame_pcm(pcm: &[u8], sample_rate: u32, channels: u16, frame_ms: u32) -> Vec<Vec<i16>> {
    let frame_len = (sample_rate as usize * channels as usize * frame_ms as usize) / 1000;
    if frame_len == 0 {
        return Vec::new();
    }

    pcm_to_samples(pcm)
        .chunks(frame_len)
        .map(|chunk| {
            let mut frame = chunk.to_vec();
            frame.resize(frame_len, 0);
            frame
        })
        .collect()
}
