//! Typed message bodies carried inside an [`Envelope`](crate::Envelope).
//!
//! Field names follow the backend's camelCase MessagePack keys. Every body
//! tolerates missing fields (they take their `Default` value) and ignores
//! fields it does not know.

use serde::{Deserialize, Serialize};

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

/// A user-authored message, produced from a transcribed utterance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserMessage {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub previous_id: String,
}

/// One sentence of a streaming assistant answer.
///
/// `message_id` identifies the answer (the generation); `sequence` orders the
/// sentences within it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssistantSentence {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub message_id: String,
    pub previous_id: String,
    pub conversation_id: String,
    pub sequence: i32,
    pub text: String,
    #[serde(skip_serializing_if = "is_false")]
    pub is_final: bool,
}

/// Marks the start of a new assistant answer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartAnswer {
    pub message_id: String,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub previous_id: String,
}

/// Subscription request. An empty conversation ID with a mode flag subscribes
/// to that mode globally.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscribeRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub conversation_id: String,
    #[serde(skip_serializing_if = "is_false")]
    pub agent_mode: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub voice_mode: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub monitor_mode: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub assistant_mode: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub whatsapp_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UnsubscribeRequest {
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscribeAck {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub conversation_id: String,
    #[serde(skip_serializing_if = "is_false")]
    pub agent_mode: bool,
    pub success: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceJoinRequest {
    pub conversation_id: String,
    pub user_id: String,
}

/// Acknowledges a join. `sample_rate` is the playback rate of synthesized
/// speech and is omitted on failure.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceJoinAck {
    pub conversation_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub sample_rate: i32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceLeaveRequest {
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceLeaveAck {
    pub conversation_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Speaking started (`speaking = true`) or stopped for one sentence.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceSpeaking {
    pub conversation_id: String,
    pub message_id: String,
    pub speaking: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub sentence_seq: i32,
}

/// Playback queue states reported in [`VoiceStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceQueueStatus {
    QueueFull,
    QueueOk,
    Speaking,
    #[default]
    Idle,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceStatus {
    pub conversation_id: String,
    pub status: VoiceQueueStatus,
    pub queue_length: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// The subset of a user's preferences the voice agent acts on.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreferencesUpdate {
    pub user_id: String,
    pub voice_speed: f32,
}
