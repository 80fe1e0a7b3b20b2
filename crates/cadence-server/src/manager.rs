//! Owns every live voice session and the backend connection they share.
//!
//! The manager is the single consumer of backend events: sentences and
//! generation starts are routed to the matching session, join and leave
//! requests create and tear down sessions, and preference updates retune the
//! speaking rate of every session owned by the user. In the other direction
//! it forwards each session's [`SessionEvent`]s to the backend.

use crate::background;
use crate::backend::{BackendClient, BackendError, InboundEvent};
use crate::config::SessionConfig;
use cadence_types::{PreferencesUpdate, VoiceJoinRequest, VoiceLeaveRequest};
use cadence_voice::{SessionDeps, SessionEvent, VoiceError, VoicePreferences, VoiceSession};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// User id assumed for joins that name none.
pub const DEFAULT_VOICE_USER: &str = "voice-user";

/// Capacity of the channel sessions report their events on.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("voice error: {0}")]
    Voice(#[from] VoiceError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("startup failed: {0}")]
    Startup(String),

    #[error("conversation {0} was left before the join completed")]
    Abandoned(String),
}

type SessionSlot = Arc<OnceCell<Arc<VoiceSession>>>;

pub struct SessionManager {
    backend: Arc<BackendClient>,
    deps: SessionDeps,
    sessions: RwLock<HashMap<String, SessionSlot>>,
    preferences: VoicePreferences,
    /// Stops the dispatcher and the background tasks.
    cancel: CancellationToken,
    /// Stops the event forwarder, after sessions are gone.
    forwarding: CancellationToken,
    tracker: TaskTracker,
}

impl SessionManager {
    pub fn new(backend: Arc<BackendClient>, deps: SessionDeps) -> Arc<Self> {
        Arc::new(Self {
            backend,
            deps,
            sessions: RwLock::new(HashMap::new()),
            preferences: VoicePreferences::new(),
            cancel: CancellationToken::new(),
            forwarding: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn backend(&self) -> &Arc<BackendClient> {
        &self.backend
    }

    pub fn preferences(&self) -> &VoicePreferences {
        &self.preferences
    }

    /// Starts the dispatcher, the event forwarder, the sweep and the
    /// liveness check.
    pub fn spawn(
        self: &Arc<Self>,
        inbound: mpsc::Receiver<InboundEvent>,
        events: mpsc::Receiver<SessionEvent>,
        config: &SessionConfig,
    ) {
        self.tracker.spawn(self.clone().run_dispatcher(inbound));
        self.tracker.spawn(self.clone().run_forwarder(events));
        self.tracker.spawn(background::run_sweep(
            self.clone(),
            config.sweep_interval(),
            self.cancel.clone(),
        ));
        self.tracker.spawn(background::run_liveness(
            self.clone(),
            config.liveness_interval(),
            self.cancel.clone(),
        ));
        tracing::info!(
            sweep_interval_secs = config.sweep_interval().as_secs(),
            liveness_interval_secs = config.liveness_interval().as_secs(),
            "session manager started"
        );
    }

    /// Returns the live session for a conversation, if any.
    pub fn session(&self, conversation_id: &str) -> Option<Arc<VoiceSession>> {
        self.sessions
            .read()
            .ok()?
            .get(conversation_id)
            .and_then(|slot| slot.get().cloned())
    }

    pub fn sessions(&self) -> Vec<Arc<VoiceSession>> {
        self.sessions
            .read()
            .map(|sessions| {
                sessions
                    .values()
                    .filter_map(|slot| slot.get().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    /// Returns the conversation's session, creating it if absent.
    ///
    /// Concurrent joins for one conversation share a single creation. A
    /// failed creation is forgotten once no other join is waiting on it, so
    /// that a later join can retry. A creation that completes after its slot
    /// was removed (by a leave or a sweep) or after shutdown began is torn
    /// down again.
    pub async fn join(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Arc<VoiceSession>, ManagerError> {
        let user_id = if user_id.is_empty() {
            DEFAULT_VOICE_USER
        } else {
            user_id
        };

        let slot = match self.sessions.write() {
            Ok(mut sessions) => sessions
                .entry(conversation_id.to_string())
                .or_default()
                .clone(),
            Err(_) => return Err(ManagerError::Startup("session map poisoned".to_string())),
        };

        let session = match slot
            .get_or_try_init(|| self.create_session(conversation_id, user_id))
            .await
        {
            Ok(session) => session.clone(),
            Err(e) => {
                self.forget_failed(conversation_id, &slot);
                self.release_subscription(conversation_id).await;
                return Err(e);
            }
        };

        if self.cancel.is_cancelled() || !self.is_registered(conversation_id, &slot) {
            tracing::info!(conversation_id, "session left while joining, tearing down");
            self.forget(conversation_id, &slot);
            self.teardown(&session).await;
            return Err(ManagerError::Abandoned(conversation_id.to_string()));
        }
        Ok(session)
    }

    async fn create_session(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Arc<VoiceSession>, ManagerError> {
        let speed = self.preferences.speed(user_id);
        let session = VoiceSession::connect(&self.deps, conversation_id, user_id, speed).await?;

        if let Err(e) = self.backend.subscribe(conversation_id).await {
            session.stop().await;
            return Err(e.into());
        }

        tracing::info!(conversation_id, user_id, voice_speed = speed, "joined conversation");
        Ok(session)
    }

    fn is_registered(&self, conversation_id: &str, slot: &SessionSlot) -> bool {
        self.sessions
            .read()
            .map(|sessions| {
                sessions
                    .get(conversation_id)
                    .is_some_and(|current| Arc::ptr_eq(current, slot))
            })
            .unwrap_or(false)
    }

    /// Drops an empty slot after a failed creation, unless another caller
    /// still holds it and will retry or tear it down.
    fn forget_failed(&self, conversation_id: &str, slot: &SessionSlot) {
        if let Ok(mut sessions) = self.sessions.write() {
            let idle = match sessions.get(conversation_id) {
                // The map and this caller are the only holders.
                Some(current) => Arc::ptr_eq(current, slot) && Arc::strong_count(slot) == 2,
                None => false,
            };
            if idle && !slot.initialized() {
                sessions.remove(conversation_id);
            }
        }
    }

    /// Removes the slot only if it is still the one registered.
    fn forget(&self, conversation_id: &str, slot: &SessionSlot) -> bool {
        match self.sessions.write() {
            Ok(mut sessions) => match sessions.get(conversation_id) {
                Some(current) if Arc::ptr_eq(current, slot) => {
                    sessions.remove(conversation_id);
                    true
                }
                _ => false,
            },
            Err(_) => false,
        }
    }

    /// Tears down the conversation's session. Returns whether one existed.
    ///
    /// A join still connecting is waited for, so its session is torn down
    /// instead of outliving the leave.
    pub async fn leave(&self, conversation_id: &str) -> bool {
        let slot = match self.sessions.read() {
            Ok(sessions) => sessions.get(conversation_id).cloned(),
            Err(_) => None,
        };
        let Some(slot) = slot else {
            return false;
        };

        // Resolves with the in-flight creation's session, or fails at once
        // when there is none.
        let session = slot
            .get_or_try_init(|| async { Err::<Arc<VoiceSession>, ()>(()) })
            .await
            .ok()
            .cloned();
        self.forget(conversation_id, &slot);

        match session {
            Some(session) => {
                self.teardown(&session).await;
                tracing::info!(conversation_id, "left conversation");
                true
            }
            None => false,
        }
    }

    async fn teardown(&self, session: &VoiceSession) {
        session.stop().await;
        self.release_subscription(session.conversation_id()).await;
    }

    /// Unsubscribes unless a newer session for the conversation is
    /// registered; that one keeps the subscription.
    async fn release_subscription(&self, conversation_id: &str) {
        let claimed = self
            .sessions
            .read()
            .map(|sessions| sessions.contains_key(conversation_id))
            .unwrap_or(false);
        if claimed {
            return;
        }
        if let Err(e) = self.backend.unsubscribe(conversation_id).await {
            tracing::warn!(conversation_id, error = %e, "failed to unsubscribe");
        }
    }

    pub async fn handle_join(&self, request: VoiceJoinRequest) {
        let conversation_id = request.conversation_id.as_str();
        let ack = match self.join(conversation_id, &request.user_id).await {
            Ok(_) => {
                self.backend
                    .send_voice_join_ack(
                        conversation_id,
                        true,
                        "",
                        self.deps.synthesizer.sample_rate(),
                    )
                    .await
            }
            Err(e) => {
                tracing::error!(conversation_id, error = %e, "failed to join conversation");
                self.backend
                    .send_voice_join_ack(conversation_id, false, &e.to_string(), 0)
                    .await
            }
        };
        if let Err(e) = ack {
            tracing::error!(conversation_id, error = %e, "failed to send join ack");
        }
    }

    pub async fn handle_leave(&self, request: VoiceLeaveRequest) {
        let conversation_id = request.conversation_id.as_str();
        if !self.leave(conversation_id).await {
            tracing::debug!(conversation_id, "leave for conversation without a session");
        }
        if let Err(e) = self
            .backend
            .send_voice_leave_ack(conversation_id, true, "")
            .await
        {
            tracing::error!(conversation_id, error = %e, "failed to send leave ack");
        }
    }

    /// Stores the user's new rate and applies it to their live sessions.
    pub fn update_preferences(&self, update: &PreferencesUpdate) -> usize {
        let speed = self.preferences.update(&update.user_id, update.voice_speed);
        let mut updated = 0;
        for session in self.sessions() {
            if session.user_id() == update.user_id {
                session.set_voice_speed(speed);
                updated += 1;
            }
        }
        tracing::info!(user_id = %update.user_id, voice_speed = speed, sessions = updated, "voice preferences updated");
        updated
    }

    /// Removes sessions whose room dropped or emptied. Returns how many.
    pub async fn sweep(&self) -> usize {
        let dead: Vec<(String, SessionSlot)> = match self.sessions.read() {
            Ok(sessions) => sessions
                .iter()
                .filter(|(_, slot)| {
                    slot.get()
                        .is_some_and(|s| !s.is_connected() || s.participant_count() == 0)
                })
                .map(|(id, slot)| (id.clone(), slot.clone()))
                .collect(),
            Err(_) => return 0,
        };

        let mut removed = 0;
        for (conversation_id, slot) in dead {
            if !self.forget(&conversation_id, &slot) {
                continue;
            }
            if let Some(session) = slot.get() {
                tracing::info!(
                    conversation_id = %conversation_id,
                    connected = session.is_connected(),
                    participants = session.participant_count(),
                    "removing idle session"
                );
                self.teardown(session).await;
                removed += 1;
            }
        }
        removed
    }

    /// Repairs the backend connection if it is down or stops answering pings.
    pub async fn check_liveness(&self) -> Result<(), BackendError> {
        if self.backend.is_connected() {
            match self.backend.ping().await {
                Ok(()) => return Ok(()),
                Err(e) => tracing::warn!(error = %e, "backend ping failed"),
            }
        }
        self.backend.reconnect(&self.cancel).await
    }

    /// Routes one backend event.
    pub async fn dispatch(self: &Arc<Self>, event: InboundEvent) {
        match event {
            InboundEvent::Sentence {
                conversation_id,
                sentence,
                trace,
            } => {
                if let Some(session) = self.session(&conversation_id) {
                    session.handle_sentence(&sentence, trace).await;
                }
            }
            InboundEvent::GenerationStart {
                conversation_id,
                start,
            } => {
                if let Some(session) = self.session(&conversation_id) {
                    session.handle_generation_start(&start);
                }
            }
            InboundEvent::VoiceJoin(request) => {
                let manager = self.clone();
                self.tracker
                    .spawn(async move { manager.handle_join(request).await });
            }
            InboundEvent::VoiceLeave(request) => {
                let manager = self.clone();
                self.tracker
                    .spawn(async move { manager.handle_leave(request).await });
            }
            InboundEvent::PreferencesUpdate(update) => {
                self.update_preferences(&update);
            }
        }
    }

    async fn run_dispatcher(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundEvent>) {
        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => break,
                event = inbound.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.dispatch(event).await;
        }
        tracing::debug!("dispatcher stopped");
    }

    async fn forward(&self, event: SessionEvent) {
        let (conversation_id, result) = match &event {
            SessionEvent::Speaking(speaking) => (
                speaking.conversation_id.as_str(),
                self.backend.send_voice_speaking(speaking).await,
            ),
            SessionEvent::Status(status) => (
                status.conversation_id.as_str(),
                self.backend.send_voice_status(status).await,
            ),
            SessionEvent::UserText {
                conversation_id,
                user_id,
                text,
            } => (
                conversation_id.as_str(),
                self.backend
                    .send_user_message(conversation_id, user_id, text)
                    .await,
            ),
        };
        if let Err(e) = result {
            tracing::warn!(conversation_id, error = %e, "failed to forward session event");
        }
    }

    async fn run_forwarder(self: Arc<Self>, mut events: mpsc::Receiver<SessionEvent>) {
        loop {
            let event = tokio::select! {
                () = self.forwarding.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.forward(event).await;
        }
        tracing::debug!("event forwarder stopped");
    }

    /// Stops background work, tears down every session, closes the backend
    /// connection and waits for all manager tasks to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.teardown_all().await;

        self.forwarding.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        // Joins that were still connecting when the first pass ran.
        self.teardown_all().await;
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.clear();
        }

        self.backend.shutdown().await;
        tracing::info!("session manager stopped");
    }

    async fn teardown_all(&self) {
        // Slots still being created stay registered for the next pass.
        let sessions: Vec<Arc<VoiceSession>> = match self.sessions.write() {
            Ok(mut sessions) => {
                let mut live = Vec::new();
                sessions.retain(|_, slot| match slot.get() {
                    Some(session) => {
                        live.push(session.clone());
                        false
                    }
                    None => true,
                });
                live
            }
            Err(_) => Vec::new(),
        };
        for session in sessions {
            self.teardown(&session).await;
        }
    }
}
