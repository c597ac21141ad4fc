use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::domain::SessionId;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRoomOptions {
    pub session_id: SessionId,
    pub room_name: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParticipant {
    pub participant_id: String,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaRoomEvent {
    ParticipantJoined(RemoteParticipant),
    ParticipantLeft { participant_id: String },
    /// The room was torn down remotely (hangup, server-side eviction).
    Disconnected { reason: Option<String> },
}

#[async_trait]
pub trait MediaRoomSession: Send + Sync {
    async fn leave(&self) -> anyhow::Result<()>;
    fn room_name(&self) -> &str;
    fn subscribe_events(&self) -> broadcast::Receiver<MediaRoomEvent>;
}

#[async_trait]
pub trait MediaRoomConnector: Send + Sync {
    async fn connect(
        &self,
        options: MediaRoomOptions,
    ) -> anyhow::Result<std::sync::Arc<dyn MediaRoomSession>>;
}
