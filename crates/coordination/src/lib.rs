use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::Client;
use shared::{
    domain::{
        ActionId, ChallengeId, FrictionAction, ModalityKind, ModalitySnapshot, PendingApproval,
        TranscriptEntry, UiCommand, UndoItem,
    },
    protocol::{ClientRequest, EventKind, HistoryResponse, PendingApprovalsResponse, ServerEvent},
};
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::warn;

pub mod approvals;
pub mod channel;
pub mod config;
pub mod modality;
pub mod reconciler;
pub mod transcript;
pub mod undo;

pub use approvals::ApprovalLedger;
pub use channel::{
    ChannelError, ChannelStatus, ChannelTransport, EventChannel, MissingChannelTransport,
    TransportLink, WebSocketTransport,
};
pub use config::{ChannelConfig, CoordinationConfig};
pub use modality::{
    MediaConnectorProvider, MissingMediaConnector, MissingSessionControlPlane, ModalityCoordinator,
    SessionControlPlane, SessionError, SessionGrant,
};
pub use reconciler::StreamReconciler;
pub use transcript::TranscriptStore;
pub use undo::{UndoError, UndoQueue};

const EVENT_FANOUT_DEPTH: usize = 1024;

/// Error taxonomy of the coordination layer. No variant is fatal: every
/// failure resolves to a well-defined component state before it is surfaced.
/// Transport loss is not represented here; it is recovered locally and
/// observable only as `ConnectionStateChanged`.
#[derive(Debug, Clone, Error)]
pub enum CoordinationError {
    #[error("failed to decode inbound event: {0}")]
    Decode(String),
    #[error("assistant stream failed: {message}")]
    Stream { message: String, recoverable: bool },
    #[error("undo of action {action_id} failed: {message}")]
    Reversal { action_id: String, message: String },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Observable union consumed by presentation code.
#[derive(Debug, Clone)]
pub enum CoordinationEvent {
    ConnectionStateChanged(ChannelStatus),
    ThinkingChanged(bool),
    TranscriptUpdated(TranscriptEntry),
    UndoQueueChanged(Vec<UndoItem>),
    ModalityStateChanged(ModalitySnapshot),
    PendingApprovalsChanged(Vec<PendingApproval>),
    UiCommands(Vec<UiCommand>),
    Error(CoordinationError),
}

/// Explicitly constructed, dependency-injected root of the coordination
/// layer. Owns the event channel, the transcript and its reconciler, the
/// undo queue, the modality coordinator, and the approval ledger; tests
/// instantiate isolated contexts instead of sharing process-wide state.
pub struct CoordinationContext {
    http: Client,
    config: CoordinationConfig,
    channel: Arc<EventChannel>,
    transcript: Arc<TranscriptStore>,
    reconciler: Arc<StreamReconciler>,
    undo: Arc<UndoQueue>,
    modality: Arc<ModalityCoordinator>,
    approvals: Arc<ApprovalLedger>,
    events: broadcast::Sender<CoordinationEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl CoordinationContext {
    pub fn new(config: CoordinationConfig) -> Arc<Self> {
        Self::new_with_dependencies(
            config,
            Arc::new(WebSocketTransport),
            Arc::new(MissingSessionControlPlane),
            Arc::new(MissingMediaConnector),
        )
    }

    pub fn new_with_dependencies(
        config: CoordinationConfig,
        transport: Arc<dyn ChannelTransport>,
        control_plane: Arc<dyn SessionControlPlane>,
        connector: Arc<dyn MediaConnectorProvider>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_FANOUT_DEPTH);
        let ws_url = derive_ws_url(&config.server_url).unwrap_or_default();
        let channel = EventChannel::new(ws_url, config.channel.clone(), transport);
        let transcript = TranscriptStore::new(events.clone());
        let reconciler = StreamReconciler::new(Arc::clone(&transcript), events.clone());
        let undo = UndoQueue::new(events.clone(), config.undo_linger);
        let modality = ModalityCoordinator::new(
            control_plane,
            connector,
            Arc::clone(&transcript),
            events.clone(),
        );
        let approvals = ApprovalLedger::new(events.clone());
        Arc::new(Self {
            http: Client::new(),
            config,
            channel,
            transcript,
            reconciler,
            undo,
            modality,
            approvals,
            events,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    /// Register component handlers on the channel and start the background
    /// work: channel run loop, undo ticker, optional approval poller.
    /// Idempotent.
    pub fn connect(self: &Arc<Self>) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(anyhow!("coordination context is disposed"));
        }
        derive_ws_url(&self.config.server_url)?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.register_channel_handlers();
        self.spawn_status_forwarder();
        self.spawn_decode_forwarder();
        self.spawn_undo_ticker();
        if self.config.approval_poll_interval.is_some() {
            self.spawn_approval_poller();
        }
        self.channel.connect();
        Ok(())
    }

    /// Rebuild the transcript from persisted history, then append the
    /// configured briefing. History is folded strictly first so the injected
    /// system message never precedes older messages.
    pub async fn hydrate(&self) -> Result<()> {
        let url = format!(
            "{}/conversations/{}/messages",
            self.config.server_url, self.config.conversation_id
        );
        let response: HistoryResponse = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("history request failed: {url}"))?
            .error_for_status()?
            .json()
            .await?;
        self.reconciler.fold_history(response.messages);
        if let Some(briefing) = &self.config.briefing {
            self.transcript.append_system(briefing.clone());
        }
        Ok(())
    }

    pub fn send_user_message(&self, text: &str) -> Result<(), CoordinationError> {
        self.transcript.append_user(text);
        self.channel.send(&ClientRequest::UserMessage {
            message: text.to_string(),
            conversation_id: self.config.conversation_id.clone(),
        })?;
        Ok(())
    }

    /// Request reversal of an auto-executed action. The item transitions to
    /// `Undoing` synchronously before the wire request goes out; a send
    /// failure rolls it back to `Active` with the original deadline.
    pub fn request_undo(&self, action_id: &ActionId) -> Result<(), CoordinationError> {
        self.undo
            .begin_reversal(action_id)
            .map_err(|err| CoordinationError::Reversal {
                action_id: action_id.0.clone(),
                message: err.to_string(),
            })?;
        if let Err(err) = self.channel.send(&ClientRequest::UserRequestUndo {
            action_id: action_id.clone(),
        }) {
            self.undo.rollback_reversal(action_id);
            let error = CoordinationError::Reversal {
                action_id: action_id.0.clone(),
                message: err.to_string(),
            };
            let _ = self.events.send(CoordinationEvent::Error(error.clone()));
            return Err(error);
        }
        Ok(())
    }

    pub fn confirm_friction(
        &self,
        challenge_id: &ChallengeId,
        action: FrictionAction,
    ) -> Result<(), CoordinationError> {
        self.channel.send(&ClientRequest::UserConfirmFriction {
            challenge_id: challenge_id.clone(),
            action,
            conversation_id: self.config.conversation_id.clone(),
        })?;
        Ok(())
    }

    pub async fn switch_modality(self: &Arc<Self>, kind: ModalityKind) -> Result<(), SessionError> {
        let result = self.modality.switch_to(kind).await;
        if let Err(err) = &result {
            let _ = self
                .events
                .send(CoordinationEvent::Error(CoordinationError::Session(
                    err.clone(),
                )));
        }
        result
    }

    pub async fn end_modality_session(&self) {
        self.modality.end_session().await;
    }

    /// Poll the full pending-approvals list and fold it into the ledger.
    pub async fn refresh_approvals(&self) -> Result<()> {
        let url = format!("{}/approvals/pending", self.config.server_url);
        let response: PendingApprovalsResponse = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("approvals request failed: {url}"))?
            .error_for_status()?
            .json()
            .await?;
        self.approvals.fold_poll(response.approvals);
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.events.subscribe()
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript.snapshot()
    }

    pub fn undo_items(&self) -> Vec<UndoItem> {
        self.undo.snapshot(Utc::now())
    }

    pub fn modality(&self) -> ModalitySnapshot {
        self.modality.snapshot()
    }

    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.approvals.snapshot()
    }

    pub fn connection_status(&self) -> ChannelStatus {
        self.channel.status()
    }

    pub fn is_thinking(&self) -> bool {
        self.reconciler.is_thinking()
    }

    /// Abort background work, end any live modality session, and mark the
    /// channel disposed. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.modality.end_session().await;
        self.channel.dispose();
    }

    fn register_channel_handlers(self: &Arc<Self>) {
        let reconciler = Arc::clone(&self.reconciler);
        self.channel.on(
            EventKind::Thinking,
            "reconciler",
            Arc::new(move |event| {
                if let ServerEvent::Thinking { is_thinking } = event {
                    reconciler.handle_thinking(*is_thinking);
                }
            }),
        );

        let reconciler = Arc::clone(&self.reconciler);
        self.channel.on(
            EventKind::Token,
            "reconciler",
            Arc::new(move |event| {
                if let ServerEvent::Token { content } = event {
                    reconciler.handle_token(content);
                }
            }),
        );

        let reconciler = Arc::clone(&self.reconciler);
        self.channel.on(
            EventKind::Metadata,
            "reconciler",
            Arc::new(move |event| {
                if let ServerEvent::Metadata {
                    message_id,
                    rich_content,
                    ui_commands,
                    suggestions,
                } = event
                {
                    reconciler.handle_metadata(message_id, rich_content, ui_commands, suggestions);
                }
            }),
        );

        let reconciler = Arc::clone(&self.reconciler);
        self.channel.on(
            EventKind::Message,
            "reconciler",
            Arc::new(move |event| {
                if let ServerEvent::Message {
                    message,
                    rich_content,
                    ui_commands,
                    suggestions,
                    conversation_id: _,
                } = event
                {
                    reconciler.handle_message(message, rich_content, ui_commands, suggestions);
                }
            }),
        );

        let reconciler = Arc::clone(&self.reconciler);
        self.channel.on(
            EventKind::StreamError,
            "reconciler",
            Arc::new(move |event| {
                if let ServerEvent::StreamError { error, recoverable } = event {
                    reconciler.handle_stream_error(error, *recoverable);
                }
            }),
        );

        let undo = Arc::clone(&self.undo);
        self.channel.on(
            EventKind::ActionExecutedWithUndo,
            "undo",
            Arc::new(move |event| {
                if let ServerEvent::ActionExecutedWithUndo {
                    action_id,
                    title,
                    undo_deadline,
                    countdown_seconds,
                } = event
                {
                    undo.register_executed(
                        action_id.clone(),
                        title.clone(),
                        *undo_deadline,
                        *countdown_seconds,
                    );
                }
            }),
        );

        let undo = Arc::clone(&self.undo);
        self.channel.on(
            EventKind::ActionUndone,
            "undo",
            Arc::new(move |event| {
                if let ServerEvent::ActionUndone { action_id } = event {
                    undo.mark_undone(action_id);
                }
            }),
        );

        let undo = Arc::clone(&self.undo);
        let events = self.events.clone();
        self.channel.on(
            EventKind::ActionUndoFailed,
            "undo",
            Arc::new(move |event| {
                if let ServerEvent::ActionUndoFailed { action_id, error } = event {
                    undo.rollback_reversal(action_id);
                    let _ = events.send(CoordinationEvent::Error(CoordinationError::Reversal {
                        action_id: action_id.0.clone(),
                        message: error.message.clone(),
                    }));
                }
            }),
        );

        let approvals = Arc::clone(&self.approvals);
        self.channel.on(
            EventKind::ApprovalRequested,
            "approvals",
            Arc::new(move |event| {
                if let ServerEvent::ApprovalRequested { approval } = event {
                    approvals.apply_push(approval.clone());
                }
            }),
        );

        let approvals = Arc::clone(&self.approvals);
        self.channel.on(
            EventKind::ApprovalResolved,
            "approvals",
            Arc::new(move |event| {
                if let ServerEvent::ApprovalResolved { approval_id } = event {
                    approvals.apply_resolved(approval_id);
                }
            }),
        );
    }

    fn spawn_status_forwarder(self: &Arc<Self>) {
        let mut statuses = self.channel.subscribe_status();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            while let Ok(status) = statuses.recv().await {
                let _ = events.send(CoordinationEvent::ConnectionStateChanged(status));
            }
        });
        self.tasks.lock().push(task);
    }

    fn spawn_decode_forwarder(self: &Arc<Self>) {
        let mut failures = self.channel.subscribe_decode_failures();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            while let Ok(message) = failures.recv().await {
                let _ = events.send(CoordinationEvent::Error(CoordinationError::Decode(message)));
            }
        });
        self.tasks.lock().push(task);
    }

    fn spawn_undo_ticker(self: &Arc<Self>) {
        let undo = Arc::clone(&self.undo);
        let tick = self.config.undo_tick;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                undo.tick(Utc::now());
            }
        });
        self.tasks.lock().push(task);
    }

    fn spawn_approval_poller(self: &Arc<Self>) {
        let Some(poll_interval) = self.config.approval_poll_interval else {
            return;
        };
        let context = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                if let Err(err) = context.refresh_approvals().await {
                    warn!("approvals: poll failed: {err:#}");
                }
            }
        });
        self.tasks.lock().push(task);
    }
}

fn derive_ws_url(server_url: &str) -> Result<String> {
    let ws_url = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    Ok(format!("{ws_url}/ws"))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
