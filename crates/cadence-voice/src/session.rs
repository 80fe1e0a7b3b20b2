//! One conversation bound to one room.
//!
//! A session paces synthesized sentences into its room and turns the room's
//! utterances into user text. Only sentences of the current generation (the
//! answer most recently started) are ever spoken: stale ones are drained when
//! the queue fills up, skipped when dequeued, and cut off mid-playback when a
//! newer generation starts.

use crate::config::AudioConfig;
use crate::error::VoiceError;
use crate::queue::{OfferError, PlaybackQueue, QueueItem};
use crate::room::{RoomConnector, RoomEvent, RoomTransport, DEFAULT_ROOM_EVENT_CAPACITY};
use crate::stt::Transcriber;
use crate::tts::{effective_speed, Synthesizer};
use cadence_types::{
    AssistantSentence, StartAnswer, TraceContext, VoiceQueueStatus, VoiceSpeaking, VoiceStatus,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Outbound notifications raised by sessions.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Speaking(VoiceSpeaking),
    Status(VoiceStatus),
    /// A transcribed user utterance, ready to be sent as a user message.
    UserText {
        conversation_id: String,
        user_id: String,
        text: String,
    },
}

/// Shared collaborators every session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub connector: Arc<dyn RoomConnector>,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub events: mpsc::Sender<SessionEvent>,
    pub queue_capacity: usize,
    /// Format of the audio rooms hand to the transcriber.
    pub capture: AudioConfig,
}

#[derive(Debug)]
struct Playback {
    voice_speed: f32,
    speaking: bool,
}

pub struct VoiceSession {
    conversation_id: String,
    user_id: String,
    room: Arc<dyn RoomTransport>,
    transcriber: Arc<dyn Transcriber>,
    synthesizer: Arc<dyn Synthesizer>,
    queue: PlaybackQueue,
    playback: RwLock<Playback>,
    generation: watch::Sender<String>,
    events: mpsc::Sender<SessionEvent>,
    bytes_per_ms: usize,
    cancel: CancellationToken,
    tracker: TaskTracker,
    stopped: AtomicBool,
}

impl VoiceSession {
    /// Creates the room connection, joins the conversation's room and starts
    /// the session's workers.
    pub async fn connect(
        deps: &SessionDeps,
        conversation_id: &str,
        user_id: &str,
        voice_speed: f32,
    ) -> Result<Arc<Self>, VoiceError> {
        let (room_tx, room_rx) = mpsc::channel(DEFAULT_ROOM_EVENT_CAPACITY);
        let room = deps.connector.create(room_tx)?;
        room.connect(conversation_id).await?;

        let (generation, _) = watch::channel(String::new());
        let session = Arc::new(Self {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            room,
            transcriber: deps.transcriber.clone(),
            synthesizer: deps.synthesizer.clone(),
            queue: PlaybackQueue::new(deps.queue_capacity),
            playback: RwLock::new(Playback {
                voice_speed: effective_speed(voice_speed),
                speaking: false,
            }),
            generation,
            events: deps.events.clone(),
            bytes_per_ms: deps.capture.bytes_per_ms(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            stopped: AtomicBool::new(false),
        });

        session.tracker.spawn(session.clone().run_playback());
        session.tracker.spawn(session.clone().run_room_events(room_rx));

        tracing::info!(
            conversation_id = %session.conversation_id,
            user_id = %session.user_id,
            "voice session started"
        );
        Ok(session)
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_connected(&self) -> bool {
        self.room.is_connected()
    }

    pub fn participant_count(&self) -> usize {
        self.room.participant_count()
    }

    pub fn is_speaking(&self) -> bool {
        self.playback.read().map(|p| p.speaking).unwrap_or(false)
    }

    pub fn voice_speed(&self) -> f32 {
        self.playback
            .read()
            .map(|p| p.voice_speed)
            .unwrap_or(crate::preferences::DEFAULT_VOICE_SPEED)
    }

    /// Applies to sentences synthesized from now on.
    pub fn set_voice_speed(&self, speed: f32) {
        if let Ok(mut playback) = self.playback.write() {
            playback.voice_speed = effective_speed(speed);
        }
    }

    pub fn current_generation(&self) -> String {
        self.generation.borrow().clone()
    }

    fn is_current(&self, generation: &str) -> bool {
        *self.generation.borrow() == generation
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Makes `start.message_id` the only generation allowed to speak.
    pub fn handle_generation_start(&self, start: &StartAnswer) {
        let previous = self.generation.send_replace(start.message_id.clone());
        tracing::debug!(
            conversation_id = %self.conversation_id,
            generation = %start.message_id,
            previous = %previous,
            "generation started"
        );
    }

    /// Queues one sentence for playback, shedding stale generations if the
    /// queue is full.
    pub async fn handle_sentence(&self, sentence: &AssistantSentence, trace: Option<TraceContext>) {
        let text = sentence.text.trim();
        if text.is_empty() {
            return;
        }

        let item = QueueItem {
            text: text.to_string(),
            generation_id: sentence.message_id.clone(),
            sequence: sentence.sequence,
            trace,
        };

        let item = match self.queue.offer(item) {
            Ok(()) => return,
            Err(OfferError::Late(item)) => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    generation = %item.generation_id,
                    sequence = item.sequence,
                    "dropping sentence that arrived after a later one started playing"
                );
                return;
            }
            Err(OfferError::Full(item)) => item,
        };

        tracing::warn!(
            conversation_id = %self.conversation_id,
            generation = %item.generation_id,
            capacity = self.queue.capacity(),
            "playback queue full, draining stale sentences"
        );
        let drained = self.queue.drain_stale(&self.current_generation());
        tracing::debug!(conversation_id = %self.conversation_id, drained, "drained stale sentences");

        let sequence = item.sequence;
        let status = match self.queue.offer(item) {
            Ok(()) => VoiceStatus {
                conversation_id: self.conversation_id.clone(),
                status: VoiceQueueStatus::QueueOk,
                queue_length: self.queue.len() as i32,
                error: String::new(),
            },
            Err(_) => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    generation = %sentence.message_id,
                    sequence,
                    "playback queue full, dropping sentence"
                );
                VoiceStatus {
                    conversation_id: self.conversation_id.clone(),
                    status: VoiceQueueStatus::QueueFull,
                    queue_length: self.queue.len() as i32,
                    error: format!("TTS queue full, dropped sentence {}", sequence),
                }
            }
        };
        self.emit(SessionEvent::Status(status)).await;
    }

    /// Stops the workers, leaves the room and waits for everything the
    /// session spawned to exit.
    pub async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
            self.room.disconnect().await;
            self.tracker.close();
            tracing::info!(conversation_id = %self.conversation_id, "voice session stopped");
        }
        self.tracker.wait().await;
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!(conversation_id = %self.conversation_id, "session event receiver closed");
        }
    }

    async fn emit_speaking(&self, item: &QueueItem, speaking: bool) {
        self.emit(SessionEvent::Speaking(VoiceSpeaking {
            conversation_id: self.conversation_id.clone(),
            message_id: item.generation_id.clone(),
            speaking,
            sentence_seq: item.sequence,
        }))
        .await;
    }

    async fn run_playback(self: Arc<Self>) {
        loop {
            let item = tokio::select! {
                () = self.cancel.cancelled() => break,
                item = self.queue.recv() => item,
            };

            if !self.is_current(&item.generation_id) {
                tracing::debug!(
                    conversation_id = %self.conversation_id,
                    generation = %item.generation_id,
                    sequence = item.sequence,
                    "skipping stale sentence"
                );
                continue;
            }

            self.emit_speaking(&item, true).await;
            self.speak(&item).await;
            self.emit_speaking(&item, false).await;
        }
    }

    async fn speak(&self, item: &QueueItem) {
        let speed = match self.playback.write() {
            Ok(mut playback) => {
                playback.speaking = true;
                playback.voice_speed
            }
            Err(_) => crate::preferences::DEFAULT_VOICE_SPEED,
        };

        if let Some(trace) = &item.trace {
            tracing::debug!(
                conversation_id = %self.conversation_id,
                traceparent = %trace.traceparent(),
                "speaking traced sentence"
            );
        }

        let generation = self.generation.subscribe();
        // Cancellation and supersession win over a playback that finishes
        // on the same poll.
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {}
            () = superseded(generation, &item.generation_id) => {
                tracing::debug!(
                    conversation_id = %self.conversation_id,
                    generation = %item.generation_id,
                    sequence = item.sequence,
                    "interrupted by a newer generation"
                );
            }
            () = self.synthesize_and_play(item, speed) => {}
        }

        if let Ok(mut playback) = self.playback.write() {
            playback.speaking = false;
        }
    }

    async fn synthesize_and_play(&self, item: &QueueItem, speed: f32) {
        let started = Instant::now();
        let audio = match self.synthesizer.synthesize(&item.text, speed).await {
            Ok(audio) => audio,
            Err(e) => {
                tracing::error!(
                    conversation_id = %self.conversation_id,
                    sequence = item.sequence,
                    chars = item.text.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "synthesis failed"
                );
                return;
            }
        };

        if audio.is_empty() {
            tracing::warn!(
                conversation_id = %self.conversation_id,
                sequence = item.sequence,
                "synthesis returned no audio"
            );
            return;
        }
        if !self.is_current(&item.generation_id) {
            return;
        }

        if let Err(e) = self.room.play_audio(&audio).await {
            tracing::error!(
                conversation_id = %self.conversation_id,
                bytes = audio.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "playback failed"
            );
        }
    }

    async fn run_room_events(self: Arc<Self>, mut room_events: mpsc::Receiver<RoomEvent>) {
        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => break,
                event = room_events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                RoomEvent::Utterance { identity, pcm } => {
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = self.handle_utterance(&identity, pcm) => {}
                    }
                }
                RoomEvent::ParticipantJoined { identity } => {
                    tracing::info!(conversation_id = %self.conversation_id, %identity, "user joined room");
                }
                RoomEvent::ParticipantLeft { identity } => {
                    tracing::info!(conversation_id = %self.conversation_id, %identity, "user left room");
                }
                RoomEvent::Disconnected => {
                    tracing::warn!(conversation_id = %self.conversation_id, "room connection lost");
                }
            }
        }
    }

    async fn handle_utterance(&self, identity: &str, pcm: Vec<u8>) {
        let started = Instant::now();
        let duration_ms = pcm.len() / self.bytes_per_ms.max(1);

        let text = match self.transcriber.transcribe(&pcm).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(
                    conversation_id = %self.conversation_id,
                    participant = %identity,
                    bytes = pcm.len(),
                    duration_ms,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "transcription failed"
                );
                return;
            }
        };

        let text = text.trim();
        if text.is_empty() {
            tracing::debug!(conversation_id = %self.conversation_id, duration_ms, "empty transcription");
            return;
        }

        tracing::debug!(
            conversation_id = %self.conversation_id,
            chars = text.len(),
            duration_ms,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "utterance transcribed"
        );
        self.emit(SessionEvent::UserText {
            conversation_id: self.conversation_id.clone(),
            user_id: self.user_id.clone(),
            text: text.to_string(),
        })
        .await;
    }
}

/// Resolves once the current generation differs from `generation`.
async fn superseded(mut current: watch::Receiver<String>, generation: &str) {
    let changed = current.wait_for(|g| g != generation).await.is_ok();
    if !changed {
        std::future::pending::<()>().await;
    }
}
