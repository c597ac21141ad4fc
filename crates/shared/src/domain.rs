use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(ActionId);
id_newtype!(ApprovalId);
id_newtype!(ChallengeId);
id_newtype!(SessionId);
id_newtype!(EntryId);

impl EntryId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Opaque typed block passed through to presentation code untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RichContentBlock {
    pub block_type: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiCommand {
    pub command: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: EntryId,
    pub role: Role,
    pub content: String,
    pub rich_content: Vec<RichContentBlock>,
    pub suggestions: Vec<String>,
    pub is_streaming: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndoStatus {
    Active,
    Undoing,
    Undone,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoItem {
    pub action_id: ActionId,
    pub title: String,
    pub undo_deadline: DateTime<Utc>,
    pub undo_duration_seconds: u32,
    pub status: UndoStatus,
}

impl UndoItem {
    /// Seconds left in the undo window, recomputed from the absolute
    /// deadline so suspension or missed ticks never skew the countdown.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> u32 {
        let millis = (self.undo_deadline - now).num_milliseconds();
        if millis <= 0 {
            return 0;
        }
        ((millis + 999) / 1000) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModalityKind {
    Text,
    Voice,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModalityStatus {
    Idle,
    Connecting,
    Active,
    Ending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModalitySnapshot {
    pub kind: ModalityKind,
    pub status: ModalityStatus,
    pub session_id: Option<SessionId>,
    pub room_name: Option<String>,
    pub pending_switch: Option<ModalityKind>,
}

impl ModalitySnapshot {
    pub fn idle() -> Self {
        Self {
            kind: ModalityKind::Text,
            status: ModalityStatus::Idle,
            session_id: None,
            room_name: None,
            pending_switch: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: ApprovalId,
    pub title: String,
    pub agent: String,
    pub risk_level: RiskLevel,
    /// Server-assigned version used to merge push-delivered and polled
    /// copies of the same approval.
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrictionAction {
    Proceed,
    Defer,
}
