#![allow(dead_code)]

use async_trait::async_trait;
use cadence_voice::{
    AudioConfig, RoomConnector, RoomEvent, RoomState, RoomTransport, SessionDeps, SessionEvent,
    Synthesizer, Transcriber, VoiceError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

/// A room that records what it was asked to play.
///
/// Playback blocks on `gate` until permits are added, so tests can hold the
/// pacing worker in the middle of a sentence.
pub struct FakeRoom {
    pub gate: Semaphore,
    pub started: Mutex<Vec<String>>,
    pub finished: Mutex<Vec<String>>,
    pub connected: AtomicBool,
    pub participants: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub events: Mutex<Option<mpsc::Sender<RoomEvent>>>,
}

impl FakeRoom {
    pub fn new(open: bool) -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }),
            started: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            participants: AtomicUsize::new(1),
            disconnects: AtomicUsize::new(0),
            events: Mutex::new(None),
        })
    }

    pub fn open(&self) {
        self.gate.add_permits(1_000);
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }

    /// Pushes an event as if the room had raised it.
    pub async fn raise(&self, event: RoomEvent) {
        let tx = self.events.lock().unwrap().clone().expect("room created");
        tx.send(event).await.unwrap();
    }
}

#[async_trait]
impl RoomTransport for FakeRoom {
    async fn connect(&self, _room_name: &str) -> Result<(), VoiceError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn play_audio(&self, pcm: &[u8]) -> Result<(), VoiceError> {
        let text = String::from_utf8_lossy(pcm).to_string();
        self.started.lock().unwrap().push(text.clone());
        let _permit = self.gate.acquire().await.map_err(|_| VoiceError::RoomClosed)?;
        self.finished.lock().unwrap().push(text);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn state(&self) -> RoomState {
        if self.connected.load(Ordering::SeqCst) {
            RoomState::Connected
        } else {
            RoomState::Disconnected
        }
    }

    fn participant_count(&self) -> usize {
        self.participants.load(Ordering::SeqCst)
    }
}

/// Hands out one pre-built [`FakeRoom`] per `create` call.
pub struct FakeConnector {
    pub rooms: Mutex<Vec<Arc<FakeRoom>>>,
    pub created: AtomicUsize,
    pub fail: AtomicBool,
    pub open: bool,
}

impl FakeConnector {
    pub fn new(open: bool) -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            open,
        })
    }

    pub fn last_room(&self) -> Arc<FakeRoom> {
        self.rooms.lock().unwrap().last().cloned().expect("room created")
    }
}

impl RoomConnector for FakeConnector {
    fn create(
        &self,
        events: mpsc::Sender<RoomEvent>,
    ) -> Result<Arc<dyn RoomTransport>, VoiceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(VoiceError::Room("room service unreachable".to_string()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let room = FakeRoom::new(self.open);
        *room.events.lock().unwrap() = Some(events);
        self.rooms.lock().unwrap().push(room.clone());
        Ok(room)
    }
}

/// "Synthesizes" the text itself as audio. Text equal to `fail` errors.
#[derive(Default)]
pub struct EchoSynthesizer {
    pub speeds: Mutex<Vec<f32>>,
}

#[async_trait]
impl Synthesizer for EchoSynthesizer {
    async fn synthesize(&self, text: &str, speed: f32) -> Result<Vec<u8>, VoiceError> {
        self.speeds.lock().unwrap().push(speed);
        match text {
            "fail" => Err(VoiceError::Tts("synthesis backend down".to_string())),
            "silent" => Ok(Vec::new()),
            _ => Ok(text.as_bytes().to_vec()),
        }
    }

    fn sample_rate(&self) -> u32 {
        24_000
    }
}

/// Returns a fixed transcript for every utterance.
pub struct FixedTranscriber {
    pub text: String,
    pub calls: AtomicUsize,
}

impl FixedTranscriber {
    pub fn new(text: &str) -> Arc<Self> {
        Arc::new(Self {
            text: text.to_string(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, _pcm: &[u8]) -> Result<String, VoiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.text.clone())
    }
}

pub struct Harness {
    pub deps: SessionDeps,
    pub connector: Arc<FakeConnector>,
    pub synthesizer: Arc<EchoSynthesizer>,
    pub transcriber: Arc<FixedTranscriber>,
    pub events: mpsc::Receiver<SessionEvent>,
}

pub fn harness(open: bool, queue_capacity: usize, transcript: &str) -> Harness {
    let connector = FakeConnector::new(open);
    let synthesizer = Arc::new(EchoSynthesizer::default());
    let transcriber = FixedTranscriber::new(transcript);
    let (tx, rx) = mpsc::channel(256);
    let deps = SessionDeps {
        connector: connector.clone(),
        transcriber: transcriber.clone(),
        synthesizer: synthesizer.clone(),
        events: tx,
        queue_capacity,
        capture: AudioConfig::default(),
    };
    Harness {
        deps,
        connector,
        synthesizer,
        transcriber,
        events: rx,
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within 2s");
}

pub fn drain_events(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
