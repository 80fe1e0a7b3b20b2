use crate::config::{AudioConfig, SttConfig};
use crate::error::VoiceError;
use crate::wav::{pcm_duration_ms, pcm_to_wav};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Instant;

/// Maximum audio input size for STT (10 MiB). Prevents OOM from oversized payloads.
const MAX_STT_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Turns captured speech into text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribes little-endian 16-bit PCM. Empty input yields empty text.
    async fn transcribe(&self, pcm: &[u8]) -> Result<String, VoiceError>;
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

/// Client for a Whisper-compatible transcription endpoint.
#[derive(Debug, Clone)]
pub struct SttService {
    client: reqwest::Client,
    config: SttConfig,
    sample_rate: u32,
    channels: u16,
}

impl SttService {
    /// `audio` describes the PCM format handed to [`Transcriber::transcribe`].
    pub fn new(config: SttConfig, audio: &AudioConfig) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| VoiceError::Stt(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            sample_rate: audio.sample_rate,
            channels: audio.channels,
        })
    }

    fn form(&self, wav: Vec<u8>) -> Result<reqwest::multipart::Form, VoiceError> {
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(format!("Invalid multipart part: {}", e)))?;

        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone());
        if !self.config.language.is_empty() {
            form = form.text("language", self.config.language.clone());
        }
        if !self.config.prompt.is_empty() {
            form = form.text("prompt", self.config.prompt.clone());
        }
        Ok(form.text("response_format", "json"))
    }
}

#[async_trait]
impl Transcriber for SttService {
    async fn transcribe(&self, pcm: &[u8]) -> Result<String, VoiceError> {
        if pcm.is_empty() {
            return Ok(String::new());
        }
        if pcm.len() > MAX_STT_INPUT_BYTES {
            return Err(VoiceError::InputTooLarge {
                service: "ASR",
                size: pcm.len(),
                limit: MAX_STT_INPUT_BYTES,
            });
        }

        let started = Instant::now();
        let wav = pcm_to_wav(pcm, self.sample_rate, self.channels);
        let form = self.form(wav)?;

        let response = self
            .client
            .post(&self.config.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Stt(format!("ASR request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Stt(format!(
                "ASR error (status {}): {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Stt(format!("Invalid ASR response: {}", e)))?;

        tracing::debug!(
            bytes = pcm.len(),
            duration_ms = pcm_duration_ms(pcm.len(), self.sample_rate, self.channels),
            latency_ms = started.elapsed().as_millis() as u64,
            chars = parsed.text.len(),
            "transcription complete"
        );

        Ok(parsed.text)
    }
}
