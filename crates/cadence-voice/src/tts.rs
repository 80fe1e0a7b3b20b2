use crate::config::TtsConfig;
use crate::error::VoiceError;
use crate::wav::pcm_duration_ms;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Instant;

/// Maximum text input size for TTS (64 KiB). Prevents resource exhaustion from
/// oversized synthesis requests.
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Turns text into raw PCM.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Returns little-endian 16-bit mono PCM at [`Synthesizer::sample_rate`].
    /// Empty text yields empty audio. A non-positive `speed` means 1.0.
    async fn synthesize(&self, text: &str, speed: f32) -> Result<Vec<u8>, VoiceError>;

    fn sample_rate(&self) -> u32;
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
    speed: f32,
}

/// Client for an OpenAI-compatible speech endpoint returning raw PCM.
#[derive(Debug, Clone)]
pub struct TtsService {
    client: reqwest::Client,
    config: TtsConfig,
}

impl TtsService {
    pub fn new(config: TtsConfig) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| VoiceError::Tts(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }
}

/// Non-positive speeds fall back to normal rate.
pub fn effective_speed(speed: f32) -> f32 {
    if speed > 0.0 {
        speed
    } else {
        1.0
    }
}

#[async_trait]
impl Synthesizer for TtsService {
    async fn synthesize(&self, text: &str, speed: f32) -> Result<Vec<u8>, VoiceError> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        if text.len() > MAX_TTS_INPUT_BYTES {
            return Err(VoiceError::InputTooLarge {
                service: "TTS",
                size: text.len(),
                limit: MAX_TTS_INPUT_BYTES,
            });
        }

        let started = Instant::now();
        let request = SpeechRequest {
            model: &self.config.model,
            input: text,
            voice: &self.config.voice,
            response_format: "pcm",
            speed: effective_speed(speed),
        };

        let response = self
            .client
            .post(&self.config.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| VoiceError::Tts(format!("TTS request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!(
                "TTS error (status {}): {}",
                status.as_u16(),
                body
            )));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| VoiceError::Tts(format!("Failed to read TTS audio: {}", e)))?
            .to_vec();

        tracing::debug!(
            chars = text.len(),
            bytes = audio.len(),
            duration_ms = pcm_duration_ms(audio.len(), self.config.sample_rate, 1),
            latency_ms = started.elapsed().as_millis() as u64,
            "synthesis complete"
        );

        Ok(audio)
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }
}
