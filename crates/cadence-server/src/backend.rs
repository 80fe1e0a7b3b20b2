//! Envelope client for the conversation backend.
//!
//! One WebSocket carries every conversation. Frames are MessagePack
//! [`Envelope`]s; inbound ones the agent cares about are decoded into
//! [`InboundEvent`]s and handed to a single consumer over an mpsc channel.
//! The client remembers which conversations it subscribed to so that a
//! reconnect can restore exactly that set.

use crate::backoff::{retry, RetryError, Strategy};
use crate::config::BackendConfig;
use cadence_types::{
    AssistantSentence, Envelope, MessageType, PreferencesUpdate, ProtocolError, StartAnswer,
    SubscribeAck, SubscribeRequest, TraceContext, UnsubscribeRequest, UserMessage,
    VoiceJoinAck, VoiceJoinRequest, VoiceLeaveAck, VoiceLeaveRequest, VoiceSpeaking,
    VoiceStatus,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, InvalidHeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_INBOUND_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("not connected to backend")]
    NotConnected,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("invalid backend url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid authorization header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: usize,
        last: Box<BackendError>,
    },

    #[error("connection attempt cancelled")]
    Cancelled,
}

impl From<RetryError<BackendError>> for BackendError {
    fn from(e: RetryError<BackendError>) -> Self {
        match e {
            RetryError::Cancelled => BackendError::Cancelled,
            RetryError::Exhausted { attempts, last } => BackendError::Exhausted {
                attempts,
                last: Box::new(last),
            },
        }
    }
}

/// Backend messages the agent acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// One sentence of an answer, routed by the envelope's conversation.
    Sentence {
        conversation_id: String,
        sentence: AssistantSentence,
        trace: Option<TraceContext>,
    },
    GenerationStart {
        conversation_id: String,
        start: StartAnswer,
    },
    VoiceJoin(VoiceJoinRequest),
    VoiceLeave(VoiceLeaveRequest),
    PreferencesUpdate(PreferencesUpdate),
}

/// Maps a decoded envelope to the event it carries.
///
/// Returns `Ok(None)` for types the agent does not act on. Subscribe acks are
/// consumed here: failures are logged.
pub fn decode_inbound(envelope: &Envelope) -> Result<Option<InboundEvent>, ProtocolError> {
    let event = match envelope.message_type {
        MessageType::AssistantSentence => Some(InboundEvent::Sentence {
            conversation_id: envelope.conversation_id.clone(),
            sentence: envelope.decode_body()?,
            trace: envelope.trace_context(),
        }),
        MessageType::StartAnswer => Some(InboundEvent::GenerationStart {
            conversation_id: envelope.conversation_id.clone(),
            start: envelope.decode_body()?,
        }),
        MessageType::SubscribeAck => {
            let ack: SubscribeAck = envelope.decode_body()?;
            if ack.success {
                tracing::debug!(conversation_id = %ack.conversation_id, "subscription acknowledged");
            } else {
                tracing::error!(
                    conversation_id = %ack.conversation_id,
                    error = %ack.error,
                    "subscription rejected by backend"
                );
            }
            None
        }
        MessageType::VoiceJoinRequest => {
            let mut request: VoiceJoinRequest = envelope.decode_body()?;
            if request.user_id.is_empty() {
                request.user_id = envelope.user_id.clone();
            }
            if request.conversation_id.is_empty() {
                request.conversation_id = envelope.conversation_id.clone();
            }
            Some(InboundEvent::VoiceJoin(request))
        }
        MessageType::VoiceLeaveRequest => {
            let mut request: VoiceLeaveRequest = envelope.decode_body()?;
            if request.conversation_id.is_empty() {
                request.conversation_id = envelope.conversation_id.clone();
            }
            Some(InboundEvent::VoiceLeave(request))
        }
        MessageType::PreferencesUpdate => {
            Some(InboundEvent::PreferencesUpdate(envelope.decode_body()?))
        }
        _ => None,
    };
    Ok(event)
}

/// The agent's single connection to the conversation backend.
pub struct BackendClient {
    url: String,
    agent_secret: String,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    connected: AtomicBool,
    /// Bumped on every successful connect so a stale reader cannot mark a
    /// newer connection down.
    epoch: AtomicU64,
    subscriptions: RwLock<HashSet<String>>,
    /// Serializes subscribe, unsubscribe and resubscribe.
    subscription_ops: tokio::sync::Mutex<()>,
    reconnecting: tokio::sync::Mutex<()>,
    inbound: mpsc::Sender<InboundEvent>,
    reader: Mutex<CancellationToken>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl BackendClient {
    pub fn new(config: &BackendConfig, inbound: mpsc::Sender<InboundEvent>) -> Arc<Self> {
        Arc::new(Self {
            url: config.url.clone(),
            agent_secret: config.agent_secret.clone(),
            writer: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            subscriptions: RwLock::new(HashSet::new()),
            subscription_ops: tokio::sync::Mutex::new(()),
            reconnecting: tokio::sync::Mutex::new(()),
            inbound,
            reader: Mutex::new(CancellationToken::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self, conversation_id: &str) -> bool {
        self.subscriptions
            .read()
            .map(|subs| subs.contains(conversation_id))
            .unwrap_or(false)
    }

    /// Snapshot of the subscribed conversations.
    pub fn subscriptions(&self) -> HashSet<String> {
        self.subscriptions
            .read()
            .map(|subs| subs.clone())
            .unwrap_or_default()
    }

    fn request(&self) -> Result<Request, BackendError> {
        let mut url = Url::parse(&self.url)?;
        if !self.agent_secret.is_empty() {
            url.query_pairs_mut()
                .append_pair("agent_secret", &self.agent_secret);
        }

        let mut request = url.as_str().into_client_request()?;
        if !self.agent_secret.is_empty() {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", self.agent_secret))?;
            request.headers_mut().insert(AUTHORIZATION, bearer);
        }
        Ok(request)
    }

    /// Opens the connection, announces voice mode and starts the reader.
    ///
    /// Succeeds immediately when already connected.
    pub async fn connect(self: &Arc<Self>) -> Result<(), BackendError> {
        if self.is_connected() {
            tracing::debug!("backend already connected");
            return Ok(());
        }

        tracing::info!(url = %self.url, authenticated = !self.agent_secret.is_empty(), "connecting to backend");
        let request = self.request()?;
        let (stream, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| BackendError::Timeout("backend handshake"))??;

        let (sink, source) = stream.split();
        *self.writer.lock().await = Some(sink);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.connected.store(true, Ordering::SeqCst);

        if let Err(e) = self.subscribe_voice_mode().await {
            self.drop_connection().await;
            return Err(e);
        }

        let reader = self.shutdown.child_token();
        if let Ok(mut current) = self.reader.lock() {
            current.cancel();
            *current = reader.clone();
        }
        self.tracker
            .spawn(self.clone().read_loop(source, epoch, reader));

        tracing::info!("connected to backend");
        Ok(())
    }

    /// Connects with retries, then restores the previous subscriptions.
    pub async fn establish(
        self: &Arc<Self>,
        strategy: Strategy,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        retry(strategy, cancel, |_| {
            let client = Arc::clone(self);
            async move { client.connect().await }
        })
        .await?;
        self.resubscribe().await;
        Ok(())
    }

    /// Tears the connection down and re-establishes it with the quick
    /// schedule, resubscribing to exactly the conversations subscribed
    /// before the drop.
    pub async fn reconnect(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), BackendError> {
        let _reconnecting = self.reconnecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        tracing::warn!(subscriptions = self.subscriptions().len(), "reconnecting to backend");
        self.drop_connection().await;
        self.establish(Strategy::Quick, cancel).await?;
        tracing::info!(subscriptions = self.subscriptions().len(), "reconnected to backend");
        Ok(())
    }

    async fn resubscribe(&self) {
        let _ops = self.subscription_ops.lock().await;
        let previous: Vec<String> = match self.subscriptions.write() {
            Ok(mut subs) => subs.drain().collect(),
            Err(_) => return,
        };

        for conversation_id in previous {
            match self.send_subscribe(&conversation_id).await {
                Ok(()) => self.remember(&conversation_id),
                Err(e) => tracing::error!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "failed to resubscribe"
                ),
            }
        }
    }

    /// Closes the socket without forgetting subscriptions.
    pub async fn disconnect(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.drop_connection().await;
        if was_connected {
            tracing::info!("disconnected from backend");
        }
    }

    /// Disconnects and waits for the reader to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.disconnect().await;
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(reader) = self.reader.lock() {
            reader.cancel();
        }
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = tokio::time::timeout(WRITE_TIMEOUT, sink.close()).await;
        }
    }

    async fn write(&self, message: Message) -> Result<(), BackendError> {
        if !self.is_connected() {
            return Err(BackendError::NotConnected);
        }

        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(BackendError::NotConnected)?;
        let result = match tokio::time::timeout(WRITE_TIMEOUT, sink.send(message)).await {
            Ok(sent) => sent.map_err(BackendError::from),
            Err(_) => Err(BackendError::Timeout("backend write")),
        };

        if result.is_err() {
            self.connected.store(false, Ordering::SeqCst);
        }
        result
    }

    pub async fn send(&self, envelope: &Envelope) -> Result<(), BackendError> {
        let bytes = envelope.encode()?;
        self.write(Message::Binary(bytes.into())).await
    }

    /// Sends a WebSocket ping. A failure marks the connection down.
    pub async fn ping(&self) -> Result<(), BackendError> {
        self.write(Message::Ping(Default::default())).await
    }

    async fn subscribe_voice_mode(&self) -> Result<(), BackendError> {
        let request = SubscribeRequest {
            voice_mode: true,
            ..Default::default()
        };
        self.send(&Envelope::new("", MessageType::Subscribe, &request)?)
            .await?;
        tracing::info!("subscribed to voice mode");
        Ok(())
    }

    async fn send_subscribe(&self, conversation_id: &str) -> Result<(), BackendError> {
        let request = SubscribeRequest {
            conversation_id: conversation_id.to_string(),
            ..Default::default()
        };
        self.send(&Envelope::new(conversation_id, MessageType::Subscribe, &request)?)
            .await
    }

    fn remember(&self, conversation_id: &str) {
        if let Ok(mut subs) = self.subscriptions.write() {
            subs.insert(conversation_id.to_string());
        }
    }

    /// Subscribes to a conversation's events. No-op when already subscribed.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::NotConnected` when the connection is down.
    pub async fn subscribe(&self, conversation_id: &str) -> Result<(), BackendError> {
        let _ops = self.subscription_ops.lock().await;
        if !self.is_connected() {
            return Err(BackendError::NotConnected);
        }
        if self.is_subscribed(conversation_id) {
            return Ok(());
        }

        self.send_subscribe(conversation_id).await?;
        self.remember(conversation_id);
        tracing::debug!(conversation_id, "subscribed to conversation");
        Ok(())
    }

    /// Unsubscribes from a conversation. No-op when disconnected or not
    /// subscribed.
    pub async fn unsubscribe(&self, conversation_id: &str) -> Result<(), BackendError> {
        let _ops = self.subscription_ops.lock().await;
        if !self.is_connected() || !self.is_subscribed(conversation_id) {
            return Ok(());
        }

        let request = UnsubscribeRequest {
            conversation_id: conversation_id.to_string(),
        };
        self.send(&Envelope::new(conversation_id, MessageType::Unsubscribe, &request)?)
            .await?;
        if let Ok(mut subs) = self.subscriptions.write() {
            subs.remove(conversation_id);
        }
        tracing::debug!(conversation_id, "unsubscribed from conversation");
        Ok(())
    }

    /// Sends transcribed speech as a user message under a fresh trace.
    pub async fn send_user_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        text: &str,
    ) -> Result<(), BackendError> {
        let message = UserMessage {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            conversation_id: conversation_id.to_string(),
            content: text.to_string(),
            ..Default::default()
        };
        let trace = TraceContext::generate();
        let envelope = Envelope::new(conversation_id, MessageType::UserMessage, &message)?
            .with_trace(&trace)
            .with_user_id(user_id);
        self.send(&envelope).await
    }

    pub async fn send_voice_join_ack(
        &self,
        conversation_id: &str,
        success: bool,
        error: &str,
        sample_rate: u32,
    ) -> Result<(), BackendError> {
        let ack = VoiceJoinAck {
            conversation_id: conversation_id.to_string(),
            success,
            error: error.to_string(),
            sample_rate: i32::try_from(sample_rate).unwrap_or(i32::MAX),
        };
        self.send(&Envelope::new(conversation_id, MessageType::VoiceJoinAck, &ack)?)
            .await
    }

    pub async fn send_voice_leave_ack(
        &self,
        conversation_id: &str,
        success: bool,
        error: &str,
    ) -> Result<(), BackendError> {
        let ack = VoiceLeaveAck {
            conversation_id: conversation_id.to_string(),
            success,
            error: error.to_string(),
        };
        self.send(&Envelope::new(conversation_id, MessageType::VoiceLeaveAck, &ack)?)
            .await
    }

    pub async fn send_voice_speaking(&self, speaking: &VoiceSpeaking) -> Result<(), BackendError> {
        self.send(&Envelope::new(
            speaking.conversation_id.as_str(),
            MessageType::VoiceSpeaking,
            speaking,
        )?)
        .await
    }

    pub async fn send_voice_status(&self, status: &VoiceStatus) -> Result<(), BackendError> {
        self.send(&Envelope::new(
            status.conversation_id.as_str(),
            MessageType::VoiceStatus,
            status,
        )?)
        .await
    }

    async fn read_loop(self: Arc<Self>, mut source: WsSource, epoch: u64, cancel: CancellationToken) {
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => return,
                frame = source.next() => frame,
            };

            match frame {
                Some(Ok(Message::Binary(bytes))) => {
                    if !self.dispatch(&bytes, &cancel).await {
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(?frame, "backend closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!(error = %e, "backend read failed");
                    break;
                }
                None => break,
            }
        }

        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.connected.store(false, Ordering::SeqCst);
            tracing::warn!("backend connection lost");
        }
    }

    /// Decodes one frame and forwards its event. Returns false once the
    /// reader should stop.
    async fn dispatch(&self, bytes: &[u8], cancel: &CancellationToken) -> bool {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(bytes = bytes.len(), error = %e, "dropping undecodable frame");
                return true;
            }
        };

        tracing::trace!(
            message_type = envelope.message_type.label(),
            conversation_id = %envelope.conversation_id,
            "received envelope"
        );

        let event = match decode_inbound(&envelope) {
            Ok(Some(event)) => event,
            Ok(None) => return true,
            Err(e) => {
                tracing::warn!(
                    message_type = envelope.message_type.label(),
                    conversation_id = %envelope.conversation_id,
                    error = %e,
                    "dropping malformed body"
                );
                return true;
            }
        };

        tokio::select! {
            () = cancel.cancelled() => false,
            sent = self.inbound.send(event) => sent.is_ok(),
        }
    }
}
