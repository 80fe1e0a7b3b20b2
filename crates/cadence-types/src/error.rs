use thiserror::Error;

/// Errors produced while encoding or decoding wire frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode envelope: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("invalid message body: {0}")]
    Body(String),
}
