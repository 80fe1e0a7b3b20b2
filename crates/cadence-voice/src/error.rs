use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("room token error: {0}")]
    Token(#[from] livekit_api::access_token::AccessTokenError),

    #[error("room error: {0}")]
    Room(String),

    /// The room client was disconnected and cannot be reused.
    #[error("room client already closed")]
    RoomClosed,

    #[error("invalid voice configuration: {0}")]
    Config(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("{service} input exceeds maximum size: {size} bytes (limit: {limit} bytes)")]
    InputTooLarge {
        service: &'static str,
        size: usize,
        limit: usize,
    },
}
