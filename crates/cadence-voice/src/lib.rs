//! Voice transduction for the Cadence agent.
//!
//! Captures speech from a multi-party audio room, transcribes it through a
//! remote ASR endpoint, and speaks backend sentences back into the room through
//! a remote TTS endpoint. A [`VoiceSession`] binds one conversation to one
//! room and paces playback against the conversation's current generation.
//!
//! Rooms are reached through the [`RoomTransport`] trait. The LiveKit
//! implementation lives behind the `livekit` cargo feature because it links
//! the native WebRTC stack.

pub mod config;
pub mod error;
#[cfg(feature = "livekit")]
pub mod livekit;
pub mod preferences;
pub mod queue;
pub mod room;
pub mod service;
pub mod session;
pub mod stt;
pub mod tts;
pub mod vad;
pub mod wav;

pub use config::{
    AudioConfig, LiveKitConfig, SttConfig, TtsConfig, DEV_LIVEKIT_API_KEY,
    DEV_LIVEKIT_API_SECRET, DEV_LIVEKIT_URL,
};
pub use error::VoiceError;
#[cfg(feature = "livekit")]
pub use livekit::{LiveKitConnector, LiveKitRoom};
pub use preferences::VoicePreferences;
pub use queue::{OfferError, PlaybackQueue, QueueItem, DEFAULT_QUEUE_CAPACITY};
pub use room::{ParticipantCapture, RoomConnector, RoomEvent, RoomState, RoomTransport};
pub use service::VoiceService;
pub use session::{SessionDeps, SessionEvent, VoiceSession};
pub use stt::{SttService, Transcriber};
pub use tts::{Synthesizer, TtsService};
pub use vad::VoiceActivityDetector;
