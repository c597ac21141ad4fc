use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use media_integration::{MediaRoomConnector, MediaRoomEvent, MediaRoomOptions, MediaRoomSession};
use parking_lot::Mutex;
use shared::domain::{ModalityKind, ModalitySnapshot, ModalityStatus, SessionId};
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{transcript::TranscriptStore, CoordinationEvent};

#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub session_id: SessionId,
    pub room_name: String,
    pub token: String,
}

/// Control-plane seam for obtaining and releasing modality sessions.
#[async_trait]
pub trait SessionControlPlane: Send + Sync {
    async fn grant_session(&self, kind: ModalityKind) -> Result<SessionGrant>;
    async fn end_session(&self, session_id: &SessionId) -> Result<()>;
}

pub struct MissingSessionControlPlane;

#[async_trait]
impl SessionControlPlane for MissingSessionControlPlane {
    async fn grant_session(&self, kind: ModalityKind) -> Result<SessionGrant> {
        Err(anyhow!("session control plane is unavailable for {kind:?}"))
    }

    async fn end_session(&self, _session_id: &SessionId) -> Result<()> {
        Err(anyhow!("session control plane is unavailable"))
    }
}

#[async_trait]
pub trait MediaConnectorProvider: Send + Sync {
    async fn connect_room(&self, options: MediaRoomOptions) -> Result<Arc<dyn MediaRoomSession>>;
}

pub struct MissingMediaConnector;

#[async_trait]
impl MediaConnectorProvider for MissingMediaConnector {
    async fn connect_room(&self, _options: MediaRoomOptions) -> Result<Arc<dyn MediaRoomSession>> {
        Err(anyhow!("media connector is unavailable"))
    }
}

#[async_trait]
impl<T> MediaConnectorProvider for T
where
    T: MediaRoomConnector,
{
    async fn connect_room(&self, options: MediaRoomOptions) -> Result<Arc<dyn MediaRoomSession>> {
        self.connect(options).await
    }
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("failed to obtain session grant: {0}")]
    Grant(String),
    #[error("failed to connect media room: {0}")]
    Connect(String),
}

struct ModalityState {
    snapshot: ModalitySnapshot,
    room: Option<Arc<dyn MediaRoomSession>>,
    event_task: Option<JoinHandle<()>>,
    /// Set by `end_session` while an establishment is in flight; the
    /// establishment path observes it and tears down instead of installing.
    cancel_requested: bool,
}

/// Governs which communication surface is live and serializes every
/// transition, guaranteeing at most one non-idle session.
///
/// A superseding `switch_to` runs the full `Ending -> Idle` sequence for the
/// current session before the requested one starts connecting; the transient
/// is observable as `pending_switch` on the snapshot.
pub struct ModalityCoordinator {
    control_plane: Arc<dyn SessionControlPlane>,
    connector: Arc<dyn MediaConnectorProvider>,
    transcript: Arc<TranscriptStore>,
    events: broadcast::Sender<CoordinationEvent>,
    transition: tokio::sync::Mutex<()>,
    inner: Mutex<ModalityState>,
}

impl ModalityCoordinator {
    pub(crate) fn new(
        control_plane: Arc<dyn SessionControlPlane>,
        connector: Arc<dyn MediaConnectorProvider>,
        transcript: Arc<TranscriptStore>,
        events: broadcast::Sender<CoordinationEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            control_plane,
            connector,
            transcript,
            events,
            transition: tokio::sync::Mutex::new(()),
            inner: Mutex::new(ModalityState {
                snapshot: ModalitySnapshot::idle(),
                room: None,
                event_task: None,
                cancel_requested: false,
            }),
        })
    }

    pub fn snapshot(&self) -> ModalitySnapshot {
        self.inner.lock().snapshot.clone()
    }

    pub async fn switch_to(self: &Arc<Self>, kind: ModalityKind) -> Result<(), SessionError> {
        let _guard = self.transition.lock().await;

        let (status, current_kind) = {
            let state = self.inner.lock();
            (state.snapshot.status, state.snapshot.kind)
        };
        if status == ModalityStatus::Active || status == ModalityStatus::Connecting {
            if current_kind == kind {
                debug!("modality: already on {kind:?}, switch ignored");
                return Ok(());
            }
            {
                let mut state = self.inner.lock();
                state.snapshot.pending_switch = Some(kind);
            }
            self.emit_snapshot();
            self.teardown_current().await;
        }

        self.begin_connecting(kind);

        if kind == ModalityKind::Text {
            // Text needs no external session; establishment is immediate.
            {
                let mut state = self.inner.lock();
                state.snapshot.status = ModalityStatus::Active;
            }
            self.emit_snapshot();
            return Ok(());
        }

        let grant = match self.control_plane.grant_session(kind).await {
            Ok(grant) => grant,
            Err(err) => {
                self.fail_connecting();
                return Err(SessionError::Grant(err.to_string()));
            }
        };
        if self.take_cancel() {
            let _ = self.control_plane.end_session(&grant.session_id).await;
            return Ok(());
        }

        let room = match self
            .connector
            .connect_room(MediaRoomOptions {
                session_id: grant.session_id.clone(),
                room_name: grant.room_name.clone(),
                token: grant.token.clone(),
            })
            .await
        {
            Ok(room) => room,
            Err(err) => {
                let _ = self.control_plane.end_session(&grant.session_id).await;
                self.fail_connecting();
                return Err(SessionError::Connect(err.to_string()));
            }
        };
        if self.take_cancel() {
            let _ = room.leave().await;
            let _ = self.control_plane.end_session(&grant.session_id).await;
            return Ok(());
        }

        let event_task = self.spawn_room_event_task(grant.session_id.clone(), Arc::clone(&room));
        {
            let mut state = self.inner.lock();
            state.snapshot = ModalitySnapshot {
                kind,
                status: ModalityStatus::Active,
                session_id: Some(grant.session_id.clone()),
                room_name: Some(grant.room_name.clone()),
                pending_switch: None,
            };
            state.room = Some(room);
            state.event_task = Some(event_task);
        }
        self.emit_snapshot();
        info!(
            "modality: session active kind={kind:?} session={} room={}",
            grant.session_id, grant.room_name
        );
        self.transcript
            .append_system(format!("{} session started", kind_label(kind)));
        Ok(())
    }

    /// End the live session, or cancel an in-flight establishment.
    ///
    /// From `Connecting` this goes straight to `Idle` without completing the
    /// handshake; from `Active` it runs the full `Ending -> Idle` sequence.
    /// From `Idle` or `Ending` it is a no-op.
    pub async fn end_session(&self) {
        {
            let mut state = self.inner.lock();
            if state.snapshot.status == ModalityStatus::Connecting {
                state.cancel_requested = true;
                state.snapshot = ModalitySnapshot::idle();
                drop(state);
                self.emit_snapshot();
                info!("modality: cancelled in-flight session establishment");
                return;
            }
        }
        let _guard = self.transition.lock().await;
        let status = self.inner.lock().snapshot.status;
        if status != ModalityStatus::Active {
            debug!("modality: end_session ignored in status {status:?}");
            return;
        }
        self.teardown_current().await;
    }

    /// Tear down the current session, passing through `Ending` so dependent
    /// UI is deterministically hidden. Caller holds the transition lock.
    async fn teardown_current(&self) {
        let (kind, session_id, room, event_task) = {
            let mut state = self.inner.lock();
            state.snapshot.status = ModalityStatus::Ending;
            (
                state.snapshot.kind,
                state.snapshot.session_id.clone(),
                state.room.take(),
                state.event_task.take(),
            )
        };
        self.emit_snapshot();

        if let Some(event_task) = event_task {
            event_task.abort();
        }
        if let Some(room) = room {
            if let Err(err) = room.leave().await {
                warn!("modality: room leave failed: {err:#}");
            }
        }
        if let Some(session_id) = &session_id {
            if let Err(err) = self.control_plane.end_session(session_id).await {
                warn!("modality: control-plane end failed for session {session_id}: {err:#}");
            }
        }

        {
            let mut state = self.inner.lock();
            let pending_switch = state.snapshot.pending_switch;
            state.snapshot = ModalitySnapshot::idle();
            state.snapshot.pending_switch = pending_switch;
        }
        self.emit_snapshot();
        info!("modality: session ended kind={kind:?}");
        if kind != ModalityKind::Text {
            self.transcript
                .append_system(format!("{} session ended", kind_label(kind)));
        }
    }

    fn spawn_room_event_task(
        self: &Arc<Self>,
        session_id: SessionId,
        room: Arc<dyn MediaRoomSession>,
    ) -> JoinHandle<()> {
        let mut events = room.subscribe_events();
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    MediaRoomEvent::Disconnected { reason } => {
                        info!(
                            "modality: remote disconnect for session {session_id} reason={reason:?}"
                        );
                        // Drop our own handle so teardown does not abort the
                        // task that is running it.
                        coordinator.inner.lock().event_task.take();
                        coordinator.handle_remote_disconnect(&session_id).await;
                        return;
                    }
                    MediaRoomEvent::ParticipantJoined(participant) => {
                        debug!("modality: participant joined {}", participant.identity);
                    }
                    MediaRoomEvent::ParticipantLeft { participant_id } => {
                        debug!("modality: participant left {participant_id}");
                    }
                }
            }
        })
    }

    /// A naturally terminated session still passes through `Ending`.
    async fn handle_remote_disconnect(&self, session_id: &SessionId) {
        let _guard = self.transition.lock().await;
        let current = self.inner.lock().snapshot.session_id.clone();
        if current.as_ref() != Some(session_id) {
            debug!("modality: stale disconnect for session {session_id}, ignored");
            return;
        }
        self.teardown_current().await;
    }

    fn begin_connecting(&self, kind: ModalityKind) {
        {
            let mut state = self.inner.lock();
            state.snapshot = ModalitySnapshot {
                kind,
                status: ModalityStatus::Connecting,
                session_id: None,
                room_name: None,
                pending_switch: None,
            };
            state.cancel_requested = false;
        }
        self.emit_snapshot();
        info!("modality: connecting kind={kind:?}");
    }

    /// Establishment failed: straight back to `Idle`, never through
    /// `Ending`. Retry is a user-initiated new `switch_to`.
    fn fail_connecting(&self) {
        let emitted = {
            let mut state = self.inner.lock();
            if state.snapshot.status == ModalityStatus::Connecting {
                state.snapshot = ModalitySnapshot::idle();
                state.cancel_requested = false;
                true
            } else {
                false
            }
        };
        if emitted {
            self.emit_snapshot();
        }
    }

    fn take_cancel(&self) -> bool {
        let mut state = self.inner.lock();
        if state.cancel_requested {
            state.cancel_requested = false;
            true
        } else {
            false
        }
    }

    fn emit_snapshot(&self) {
        let snapshot = self.snapshot();
        let _ = self
            .events
            .send(CoordinationEvent::ModalityStateChanged(snapshot));
    }
}

fn kind_label(kind: ModalityKind) -> &'static str {
    match kind {
        ModalityKind::Text => "Text",
        ModalityKind::Voice => "Voice",
        ModalityKind::Video => "Video",
    }
}

#[cfg(test)]
#[path = "tests/modality_tests.rs"]
mod tests;
