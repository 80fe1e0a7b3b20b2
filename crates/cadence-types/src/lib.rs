//! Wire protocol shared by the Cadence voice agent and the conversation backend.
//!
//! Every frame on the backend connection is an [`Envelope`]: a MessagePack map
//! carrying a conversation ID, a numeric [`MessageType`] tag, a dynamically
//! typed body, and optional causal-trace fields. The tag alone decides which
//! body type in [`message`] the payload decodes to.

pub mod envelope;
pub mod error;
pub mod message;

pub use envelope::{Envelope, TraceContext};
pub use error::ProtocolError;
pub use message::*;

/// Numeric message type tags understood by the backend.
///
/// Tags the voice agent neither produces nor consumes decode to
/// [`MessageType::Unknown`] so that new backend messages never break decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// A message authored by the user (produced from transcribed speech).
    UserMessage,
    /// The backend started generating a new answer.
    StartAnswer,
    /// One sentence of a streaming assistant answer.
    AssistantSentence,
    /// Subscribe to a conversation (or a global mode).
    Subscribe,
    /// Unsubscribe from a conversation.
    Unsubscribe,
    /// Backend response to `Subscribe`.
    SubscribeAck,
    /// Backend response to `Unsubscribe`.
    UnsubscribeAck,
    /// A client asks for the voice agent to join a conversation's room.
    VoiceJoinRequest,
    /// Voice agent response to `VoiceJoinRequest`.
    VoiceJoinAck,
    /// A client asks the voice agent to leave a conversation's room.
    VoiceLeaveRequest,
    /// Voice agent response to `VoiceLeaveRequest`.
    VoiceLeaveAck,
    /// Playback queue status report.
    VoiceStatus,
    /// Speaking started or stopped for one sentence.
    VoiceSpeaking,
    /// A user's preferences changed.
    PreferencesUpdate,
    /// Any tag not listed above.
    Unknown(u16),
}

impl MessageType {
    /// Returns the numeric tag for this type.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::UserMessage => 2,
            Self::StartAnswer => 13,
            Self::AssistantSentence => 16,
            Self::Subscribe => 40,
            Self::Unsubscribe => 41,
            Self::SubscribeAck => 42,
            Self::UnsubscribeAck => 43,
            Self::VoiceJoinRequest => 51,
            Self::VoiceJoinAck => 52,
            Self::VoiceLeaveRequest => 53,
            Self::VoiceLeaveAck => 54,
            Self::VoiceStatus => 55,
            Self::VoiceSpeaking => 56,
            Self::PreferencesUpdate => 60,
            Self::Unknown(tag) => tag,
        }
    }

    /// Maps a numeric tag to a `MessageType`, falling back to `Unknown`.
    pub fn from_u16(tag: u16) -> Self {
        match tag {
            2 => Self::UserMessage,
            13 => Self::StartAnswer,
            16 => Self::AssistantSentence,
            40 => Self::Subscribe,
            41 => Self::Unsubscribe,
            42 => Self::SubscribeAck,
            43 => Self::UnsubscribeAck,
            51 => Self::VoiceJoinRequest,
            52 => Self::VoiceJoinAck,
            53 => Self::VoiceLeaveRequest,
            54 => Self::VoiceLeaveAck,
            55 => Self::VoiceStatus,
            56 => Self::VoiceSpeaking,
            60 => Self::PreferencesUpdate,
            other => Self::Unknown(other),
        }
    }

    /// Returns a stable label for logging.
    pub fn label(self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::StartAnswer => "start_answer",
            Self::AssistantSentence => "assistant_sentence",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::SubscribeAck => "subscribe_ack",
            Self::UnsubscribeAck => "unsubscribe_ack",
            Self::VoiceJoinRequest => "voice_join_request",
            Self::VoiceJoinAck => "voice_join_ack",
            Self::VoiceLeaveRequest => "voice_leave_request",
            Self::VoiceLeaveAck => "voice_leave_ack",
            Self::VoiceStatus => "voice_status",
            Self::VoiceSpeaking => "voice_speaking",
            Self::PreferencesUpdate => "preferences_update",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl From<u16> for MessageType {
    fn from(tag: u16) -> Self {
        Self::from_u16(tag)
    }
}

impl From<MessageType> for u16 {
    fn from(message_type: MessageType) -> Self {
        message_type.as_u16()
    }
}

impl serde::Serialize for MessageType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.as_u16())
    }
}

impl<'de> serde::Deserialize<'de> for MessageType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u16::deserialize(deserializer).map(Self::from_u16)
    }
}
