//! Energy-based voice activity detection with a silence hangover.

use std::time::{Duration, Instant};

/// RMS level of little-endian 16-bit PCM, normalized to 0.0–1.0.
pub fn compute_rms(pcm: &[u8]) -> f32 {
    let count = pcm.len() / 2;
    if count == 0 {
        return 0.0;
    }
    let sum: f64 = pcm
        .chunks_exact(2)
        .map(|pair| {
            let v = i16::from_le_bytes([pair[0], pair[1]]) as f64 / 32768.0;
            v * v
        })
        .sum();
    (sum / count as f64).sqrt() as f32
}

/// Splits one participant's audio into utterances.
///
/// A frame above the threshold enters (or stays in) the speaking state and is
/// buffered. Quiet frames are not buffered; once the configured silence has
/// elapsed since the last loud frame, the buffer is returned as one utterance.
/// Dips shorter than the silence duration therefore never split an utterance.
#[derive(Debug)]
pub struct VoiceActivityDetector {
    threshold: f32,
    silence: Duration,
    speaking: bool,
    buffer: Vec<u8>,
    last_voice: Option<Instant>,
}

impl VoiceActivityDetector {
    pub fn new(threshold: f32, silence: Duration) -> Self {
        Self {
            threshold,
            silence,
            speaking: false,
            buffer: Vec::new(),
            last_voice: None,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Feeds one decoded frame captured at `now`. Returns a finished utterance.
    pub fn push(&mut self, frame: &[u8], now: Instant) -> Option<Vec<u8>> {
        if compute_rms(frame) > self.threshold {
            self.speaking = true;
            self.buffer.extend_from_slice(frame);
            self.last_voice = Some(now);
            return None;
        }

        if !self.speaking {
            return None;
        }

        if self.buffer.is_empty() {
            self.speaking = false;
            return None;
        }

        let quiet_for = self
            .last_voice
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX);
        if quiet_for < self.silence {
            return None;
        }

        self.speaking = false;
        Some(std::mem::take(&mut self.buffer))
    }
}
