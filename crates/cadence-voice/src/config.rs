use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEV_LIVEKIT_URL: &str = "ws://localhost:7880";
pub const DEV_LIVEKIT_API_KEY: &str = "devkey";
pub const DEV_LIVEKIT_API_SECRET: &str = "secret";

fn default_livekit_url() -> String {
    DEV_LIVEKIT_URL.to_string()
}

fn default_api_key() -> String {
    DEV_LIVEKIT_API_KEY.to_string()
}

fn default_api_secret() -> String {
    DEV_LIVEKIT_API_SECRET.to_string()
}

fn default_token_ttl_seconds() -> u64 {
    3600
}

fn default_identity() -> String {
    "voice-helper".to_string()
}

fn default_display_name() -> String {
    "Cadence Voice".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LiveKitConfig {
    #[serde(default = "default_livekit_url")]
    pub url: String,
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(skip_serializing, default = "default_api_secret")]
    pub api_secret: String,
    /// JWT token TTL in seconds for room join tokens. Default: 3600 (1 hour).
    #[serde(default = "default_token_ttl_seconds")]
    pub token_ttl_seconds: u64,
    /// Identity the agent joins rooms under. Audio from this identity is
    /// never segmented.
    #[serde(default = "default_identity")]
    pub identity: String,
    #[serde(default = "default_display_name")]
    pub display_name: String,
}

impl Default for LiveKitConfig {
    fn default() -> Self {
        Self {
            url: default_livekit_url(),
            api_key: default_api_key(),
            api_secret: default_api_secret(),
            token_ttl_seconds: default_token_ttl_seconds(),
            identity: default_identity(),
            display_name: default_display_name(),
        }
    }
}

impl fmt::Debug for LiveKitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveKitConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .field("token_ttl_seconds", &self.token_ttl_seconds)
            .field("identity", &self.identity)
            .field("display_name", &self.display_name)
            .finish()
    }
}

impl LiveKitConfig {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            ..Default::default()
        }
    }
}

fn default_stt_url() -> String {
    "http://localhost:9000/asr".to_string()
}

fn default_stt_model() -> String {
    "whisper-1".to_string()
}

fn default_stt_timeout_seconds() -> u64 {
    30
}

/// Remote transcription endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    #[serde(default = "default_stt_url")]
    pub url: String,
    #[serde(default = "default_stt_model")]
    pub model: String,
    /// ISO language hint. Empty lets the service detect it.
    #[serde(default)]
    pub language: String,
    /// Optional decoding prompt.
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_stt_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            url: default_stt_url(),
            model: default_stt_model(),
            language: String::new(),
            prompt: String::new(),
            timeout_seconds: default_stt_timeout_seconds(),
        }
    }
}

impl SttConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_tts_url() -> String {
    "http://localhost:8880/v1/audio/speech".to_string()
}

fn default_tts_model() -> String {
    "kokoro".to_string()
}

fn default_tts_voice() -> String {
    "af_heart".to_string()
}

fn default_tts_sample_rate() -> u32 {
    24_000
}

fn default_tts_timeout_seconds() -> u64 {
    60
}

/// Remote synthesis endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_tts_url")]
    pub url: String,
    #[serde(default = "default_tts_model")]
    pub model: String,
    #[serde(default = "default_tts_voice")]
    pub voice: String,
    /// Sample rate of the PCM the endpoint returns, and therefore of playback.
    #[serde(default = "default_tts_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_tts_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: default_tts_url(),
            model: default_tts_model(),
            voice: default_tts_voice(),
            sample_rate: default_tts_sample_rate(),
            timeout_seconds: default_tts_timeout_seconds(),
        }
    }
}

impl TtsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_capture_sample_rate() -> u32 {
    48_000
}

fn default_channels() -> u16 {
    1
}

fn default_vad_threshold() -> f32 {
    0.01
}

fn default_silence_duration_ms() -> u64 {
    800
}

/// Capture format and voice-activity detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Sample rate remote audio is decoded to.
    #[serde(default = "default_capture_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// RMS level (0.0..=1.0) above which a frame counts as speech.
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f32,
    /// Silence that must elapse after speech before an utterance is flushed.
    #[serde(default = "default_silence_duration_ms")]
    pub silence_duration_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_capture_sample_rate(),
            channels: default_channels(),
            vad_threshold: default_vad_threshold(),
            silence_duration_ms: default_silence_duration_ms(),
        }
    }
}

impl AudioConfig {
    pub fn silence_duration(&self) -> Duration {
        Duration::from_millis(self.silence_duration_ms)
    }

    /// Bytes of 16-bit PCM per millisecond of captured audio.
    pub fn bytes_per_ms(&self) -> usize {
        (self.sample_rate as usize * self.channels as usize * 2 / 1000).max(1)
    }
}
