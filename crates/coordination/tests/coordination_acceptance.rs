//! End-to-end scenarios driven through the public coordination API: a
//! scripted transport stands in for the backend socket and every observation
//! goes through `CoordinationContext` accessors and the event stream.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use coordination::{
    ChannelTransport, CoordinationConfig, CoordinationContext, CoordinationEvent,
    MissingMediaConnector, MissingSessionControlPlane, SessionControlPlane, SessionGrant,
    TransportLink,
};
use media_integration::{
    MediaRoomConnector, MediaRoomEvent, MediaRoomOptions, MediaRoomSession,
};
use shared::{
    domain::{
        ActionId, ConversationId, ModalityKind, ModalityStatus, Role, SessionId, UndoStatus,
    },
    protocol::ServerEvent,
};
use tokio::sync::{broadcast, mpsc};

struct BackendLink {
    inbound_tx: mpsc::Sender<String>,
    #[allow(dead_code)]
    outbound_rx: mpsc::Receiver<String>,
}

struct ScriptedTransport {
    link_tx: mpsc::Sender<BackendLink>,
}

#[async_trait]
impl ChannelTransport for ScriptedTransport {
    async fn open(&self, _url: &str) -> Result<TransportLink> {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        self.link_tx
            .send(BackendLink {
                inbound_tx: in_tx,
                outbound_rx: out_rx,
            })
            .await
            .map_err(|_| anyhow!("scenario dropped the link receiver"))?;
        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

fn scenario_config() -> CoordinationConfig {
    CoordinationConfig {
        server_url: "http://acceptance.test".into(),
        conversation_id: ConversationId::new("acceptance"),
        undo_tick: Duration::from_millis(25),
        undo_linger: Duration::from_millis(200),
        ..CoordinationConfig::default()
    }
}

async fn connected_backend(
    config: CoordinationConfig,
) -> (Arc<CoordinationContext>, BackendLink) {
    let (link_tx, mut link_rx) = mpsc::channel(8);
    let context = CoordinationContext::new_with_dependencies(
        config,
        Arc::new(ScriptedTransport { link_tx }),
        Arc::new(MissingSessionControlPlane),
        Arc::new(MissingMediaConnector),
    );
    context.connect().expect("connect");
    let link = tokio::time::timeout(Duration::from_secs(2), link_rx.recv())
        .await
        .expect("transport never opened")
        .expect("transport closed");
    (context, link)
}

async fn feed(link: &BackendLink, event: ServerEvent) {
    let frame = serde_json::to_string(&event).expect("encode frame");
    link.inbound_tx.send(frame).await.expect("feed frame");
}

async fn wait_for<T>(
    events: &mut broadcast::Receiver<CoordinationEvent>,
    mut pick: impl FnMut(&CoordinationEvent) -> Option<T>,
) -> T {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        if let Some(value) = pick(&event) {
            return value;
        }
    }
}

#[tokio::test]
async fn streamed_reply_lands_as_a_single_finalized_entry() {
    let (context, link) = connected_backend(scenario_config()).await;
    let mut events = context.subscribe_events();

    feed(&link, ServerEvent::Thinking { is_thinking: true }).await;
    feed(
        &link,
        ServerEvent::Token {
            content: "Your meeting is at ".into(),
        },
    )
    .await;
    feed(
        &link,
        ServerEvent::Token {
            content: "3pm.".into(),
        },
    )
    .await;
    feed(
        &link,
        ServerEvent::Message {
            message: "Your meeting is at 3pm.".into(),
            rich_content: vec![],
            ui_commands: vec![],
            suggestions: vec!["Move it".into()],
            conversation_id: ConversationId::new("acceptance"),
        },
    )
    .await;

    let entry = wait_for(&mut events, |event| match event {
        CoordinationEvent::TranscriptUpdated(entry) if !entry.is_streaming => Some(entry.clone()),
        _ => None,
    })
    .await;

    assert_eq!(entry.role, Role::Assistant);
    assert_eq!(entry.content, "Your meeting is at 3pm.");
    assert_eq!(entry.suggestions, vec!["Move it".to_string()]);
    assert_eq!(context.transcript().len(), 1);
    assert!(!context.is_thinking());
    context.dispose().await;
}

#[tokio::test]
async fn undo_window_counts_down_expires_and_is_pruned() {
    let (context, link) = connected_backend(scenario_config()).await;
    let mut events = context.subscribe_events();

    feed(
        &link,
        ServerEvent::ActionExecutedWithUndo {
            action_id: ActionId::new("archive-1"),
            title: "Archived 3 emails".into(),
            undo_deadline: Utc::now() + chrono::Duration::milliseconds(300),
            countdown_seconds: 1,
        },
    )
    .await;

    wait_for(&mut events, |event| match event {
        CoordinationEvent::UndoQueueChanged(items)
            if items.first().map(|i| i.status) == Some(UndoStatus::Active) =>
        {
            Some(())
        }
        _ => None,
    })
    .await;

    // The background ticker expires the window, keeps the terminal item
    // visible through the linger, then prunes it.
    wait_for(&mut events, |event| match event {
        CoordinationEvent::UndoQueueChanged(items)
            if items.first().map(|i| i.status) == Some(UndoStatus::Expired) =>
        {
            Some(())
        }
        _ => None,
    })
    .await;
    wait_for(&mut events, |event| match event {
        CoordinationEvent::UndoQueueChanged(items) if items.is_empty() => Some(()),
        _ => None,
    })
    .await;

    // Too late to reverse now.
    assert!(context.request_undo(&ActionId::new("archive-1")).is_err());
    context.dispose().await;
}

struct GrantingControlPlane {
    next: AtomicU32,
}

#[async_trait]
impl SessionControlPlane for GrantingControlPlane {
    async fn grant_session(&self, kind: ModalityKind) -> Result<SessionGrant> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        Ok(SessionGrant {
            session_id: SessionId::new(format!("s{n}")),
            room_name: format!("{kind:?}-room-{n}").to_lowercase(),
            token: "token".into(),
        })
    }

    async fn end_session(&self, _session_id: &SessionId) -> Result<()> {
        Ok(())
    }
}

struct InstantRoom {
    name: String,
    events: broadcast::Sender<MediaRoomEvent>,
}

#[async_trait]
impl MediaRoomSession for InstantRoom {
    async fn leave(&self) -> Result<()> {
        Ok(())
    }

    fn room_name(&self) -> &str {
        &self.name
    }

    fn subscribe_events(&self) -> broadcast::Receiver<MediaRoomEvent> {
        self.events.subscribe()
    }
}

struct InstantConnector;

#[async_trait]
impl MediaRoomConnector for InstantConnector {
    async fn connect(&self, options: MediaRoomOptions) -> Result<Arc<dyn MediaRoomSession>> {
        let (events, _) = broadcast::channel(16);
        Ok(Arc::new(InstantRoom {
            name: options.room_name,
            events,
        }))
    }
}

#[tokio::test]
async fn switching_voice_to_video_ends_the_old_session_first() {
    let (link_tx, _link_rx) = mpsc::channel(8);
    let context = CoordinationContext::new_with_dependencies(
        scenario_config(),
        Arc::new(ScriptedTransport { link_tx }),
        Arc::new(GrantingControlPlane {
            next: AtomicU32::new(0),
        }),
        Arc::new(InstantConnector),
    );
    let mut events = context.subscribe_events();

    context
        .switch_modality(ModalityKind::Voice)
        .await
        .expect("voice");
    assert_eq!(context.modality().status, ModalityStatus::Active);
    assert_eq!(context.modality().kind, ModalityKind::Voice);

    context
        .switch_modality(ModalityKind::Video)
        .await
        .expect("video");
    assert_eq!(context.modality().status, ModalityStatus::Active);
    assert_eq!(context.modality().kind, ModalityKind::Video);

    // Collapse the snapshot stream to (kind, status) and check the old
    // session fully ended before the new one started connecting.
    let mut sequence = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CoordinationEvent::ModalityStateChanged(snapshot) = event {
            sequence.push((snapshot.kind, snapshot.status));
        }
    }
    let ending_at = sequence
        .iter()
        .position(|&(kind, status)| kind == ModalityKind::Voice && status == ModalityStatus::Ending)
        .expect("voice must pass through Ending");
    let video_connecting_at = sequence
        .iter()
        .position(|&(kind, status)| {
            kind == ModalityKind::Video && status == ModalityStatus::Connecting
        })
        .expect("video must pass through Connecting");
    assert!(ending_at < video_connecting_at);

    // Both transitions leave their marks on the transcript.
    let system_lines: Vec<String> = context
        .transcript()
        .iter()
        .filter(|entry| entry.role == Role::System)
        .map(|entry| entry.content.clone())
        .collect();
    assert_eq!(
        system_lines,
        vec![
            "Voice session started".to_string(),
            "Voice session ended".to_string(),
            "Video session started".to_string(),
        ]
    );

    context.end_modality_session().await;
    assert_eq!(context.modality().status, ModalityStatus::Idle);
    context.dispose().await;
}
