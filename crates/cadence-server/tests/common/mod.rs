#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use cadence_server::backend::DEFAULT_INBOUND_CAPACITY;
use cadence_server::config::BackendConfig;
use cadence_server::{BackendClient, InboundEvent};
use cadence_types::{Envelope, MessageType};
use cadence_voice::{
    AudioConfig, RoomConnector, RoomEvent, RoomState, RoomTransport, SessionDeps, SessionEvent,
    Synthesizer, Transcriber, VoiceError,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Notify};

/// What the mock backend saw on one connection.
#[derive(Debug, Clone)]
pub struct Received {
    pub connection: usize,
    pub envelope: Envelope,
}

/// In-process conversation backend speaking the envelope protocol.
#[derive(Clone)]
pub struct MockBackend {
    pub url: String,
    pub connections: Arc<AtomicUsize>,
    pub received: Arc<Mutex<Vec<Received>>>,
    pub queries: Arc<Mutex<Vec<Option<String>>>>,
    pub bearers: Arc<Mutex<Vec<Option<String>>>>,
    push: broadcast::Sender<Vec<u8>>,
    kick: Arc<Notify>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let (push, _) = broadcast::channel(64);
        let mut backend = Self {
            url: String::new(),
            connections: Arc::new(AtomicUsize::new(0)),
            received: Arc::new(Mutex::new(Vec::new())),
            queries: Arc::new(Mutex::new(Vec::new())),
            bearers: Arc::new(Mutex::new(Vec::new())),
            push,
            kick: Arc::new(Notify::new()),
        };

        let app = Router::new()
            .route("/ws", get(upgrade))
            .with_state(backend.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        backend.url = format!("ws://{}/ws", addr);
        backend
    }

    pub fn config(&self, secret: &str) -> BackendConfig {
        BackendConfig {
            url: self.url.clone(),
            agent_secret: secret.to_string(),
        }
    }

    /// Sends a typed envelope to every open connection.
    pub fn push<T: Serialize>(&self, conversation_id: &str, kind: MessageType, body: &T) {
        let envelope = Envelope::new(conversation_id, kind, body).unwrap();
        self.push_envelope(&envelope);
    }

    pub fn push_envelope(&self, envelope: &Envelope) {
        self.push_raw(envelope.encode().unwrap());
    }

    pub fn push_raw(&self, bytes: Vec<u8>) {
        let _ = self.push.send(bytes);
    }

    /// Closes the current connection from the server side.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    /// Envelopes of one type, in arrival order.
    pub fn of_type(&self, kind: MessageType) -> Vec<Received> {
        self.received()
            .into_iter()
            .filter(|r| r.envelope.message_type == kind)
            .collect()
    }

    /// Conversation IDs subscribed on one connection, excluding the
    /// voice-mode subscription.
    pub fn subscribed_on(&self, connection: usize) -> Vec<String> {
        let mut ids: Vec<String> = self
            .of_type(MessageType::Subscribe)
            .into_iter()
            .filter(|r| r.connection == connection && !r.envelope.conversation_id.is_empty())
            .map(|r| r.envelope.conversation_id)
            .collect();
        ids.sort();
        ids
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(backend): State<MockBackend>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    backend.queries.lock().unwrap().push(query);
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    backend.bearers.lock().unwrap().push(bearer);
    ws.on_upgrade(move |socket| serve(socket, backend))
}

async fn serve(mut socket: WebSocket, backend: MockBackend) {
    let mut outbound = backend.push.subscribe();
    let connection = backend.connections.fetch_add(1, Ordering::SeqCst) + 1;

    loop {
        tokio::select! {
            () = backend.kick.notified() => {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
            pushed = outbound.recv() => {
                if let Ok(bytes) = pushed {
                    if socket.send(Message::Binary(bytes.into())).await.is_err() {
                        return;
                    }
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Binary(bytes))) => {
                    let envelope = Envelope::decode(&bytes).unwrap();
                    backend
                        .received
                        .lock()
                        .unwrap()
                        .push(Received { connection, envelope });
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Connects a client to the mock and returns it with its event receiver.
pub async fn connected_client(
    backend: &MockBackend,
    secret: &str,
) -> (Arc<BackendClient>, mpsc::Receiver<InboundEvent>) {
    let (tx, rx) = mpsc::channel(DEFAULT_INBOUND_CAPACITY);
    let client = BackendClient::new(&backend.config(secret), tx);
    client.connect().await.unwrap();
    (client, rx)
}

/// A room that plays instantly and records what it played.
pub struct FakeRoom {
    pub played: Mutex<Vec<String>>,
    pub connected: AtomicBool,
    pub participants: AtomicUsize,
    pub events: Mutex<Option<mpsc::Sender<RoomEvent>>>,
}

impl FakeRoom {
    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }

    pub async fn raise(&self, event: RoomEvent) {
        let tx = self.events.lock().unwrap().clone().expect("room created");
        tx.send(event).await.unwrap();
    }
}

#[async_trait]
impl RoomTransport for FakeRoom {
    async fn connect(&self, _room_name: &str) -> Result<(), VoiceError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn play_audio(&self, pcm: &[u8]) -> Result<(), VoiceError> {
        self.played
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(pcm).to_string());
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
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

#[derive(Default)]
pub struct FakeConnector {
    pub rooms: Mutex<Vec<Arc<FakeRoom>>>,
    pub fail: AtomicBool,
}

impl FakeConnector {
    pub fn created(&self) -> usize {
        self.rooms.lock().unwrap().len()
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
        let room = Arc::new(FakeRoom {
            played: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            participants: AtomicUsize::new(1),
            events: Mutex::new(Some(events)),
        });
        self.rooms.lock().unwrap().push(room.clone());
        Ok(room)
    }
}

/// Returns the text itself as audio and records requested speeds.
#[derive(Default)]
pub struct EchoSynthesizer {
    pub speeds: Mutex<Vec<f32>>,
}

#[async_trait]
impl Synthesizer for EchoSynthesizer {
    async fn synthesize(&self, text: &str, speed: f32) -> Result<Vec<u8>, VoiceError> {
        self.speeds.lock().unwrap().push(speed);
        Ok(text.as_bytes().to_vec())
    }

    fn sample_rate(&self) -> u32 {
        22_050
    }
}

pub struct FixedTranscriber(pub String);

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, _pcm: &[u8]) -> Result<String, VoiceError> {
        Ok(self.0.clone())
    }
}

pub fn session_deps(
    connector: Arc<FakeConnector>,
    synthesizer: Arc<EchoSynthesizer>,
    transcript: &str,
) -> (SessionDeps, mpsc::Receiver<SessionEvent>) {
    let (tx, rx) = mpsc::channel(256);
    let deps = SessionDeps {
        connector,
        transcriber: Arc::new(FixedTranscriber(transcript.to_string())),
        synthesizer,
        events: tx,
        queue_capacity: 10,
        capture: AudioConfig::default(),
    };
    (deps, rx)
}

/// Polls `check` until it holds or three seconds pass.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 3s");
}
