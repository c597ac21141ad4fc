use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ActionId, ApprovalId, ChallengeId, ConversationId, FrictionAction, MessageId,
        PendingApproval, RichContentBlock, Role, UiCommand,
    },
    error::ApiError,
};

/// Outbound requests from the client to the backend over the event channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    UserMessage {
        message: String,
        conversation_id: ConversationId,
    },
    UserRequestUndo {
        action_id: ActionId,
    },
    UserConfirmFriction {
        challenge_id: ChallengeId,
        action: FrictionAction,
        conversation_id: ConversationId,
    },
}

impl ClientRequest {
    /// Wire name of the request, for logging only.
    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::UserMessage { .. } => "user_message",
            ClientRequest::UserRequestUndo { .. } => "user_request_undo",
            ClientRequest::UserConfirmFriction { .. } => "user_confirm_friction",
        }
    }
}

/// Inbound events from the backend. This is the closed set: an unknown
/// `type` tag fails decoding at the channel boundary and never reaches a
/// consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Thinking {
        is_thinking: bool,
    },
    Token {
        content: String,
    },
    Metadata {
        message_id: MessageId,
        #[serde(default)]
        rich_content: Vec<RichContentBlock>,
        #[serde(default)]
        ui_commands: Vec<UiCommand>,
        #[serde(default)]
        suggestions: Vec<String>,
    },
    Message {
        message: String,
        #[serde(default)]
        rich_content: Vec<RichContentBlock>,
        #[serde(default)]
        ui_commands: Vec<UiCommand>,
        #[serde(default)]
        suggestions: Vec<String>,
        conversation_id: ConversationId,
    },
    StreamError {
        error: ApiError,
        recoverable: bool,
    },
    ActionExecutedWithUndo {
        action_id: ActionId,
        title: String,
        undo_deadline: DateTime<Utc>,
        countdown_seconds: u32,
    },
    ActionUndone {
        action_id: ActionId,
    },
    ActionUndoFailed {
        action_id: ActionId,
        error: ApiError,
    },
    ApprovalRequested {
        approval: PendingApproval,
    },
    ApprovalResolved {
        approval_id: ApprovalId,
    },
}

/// Field-less enumeration of the inbound event kinds, used as the handler
/// registration key on the event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Thinking,
    Token,
    Metadata,
    Message,
    StreamError,
    ActionExecutedWithUndo,
    ActionUndone,
    ActionUndoFailed,
    ApprovalRequested,
    ApprovalResolved,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::Thinking { .. } => EventKind::Thinking,
            ServerEvent::Token { .. } => EventKind::Token,
            ServerEvent::Metadata { .. } => EventKind::Metadata,
            ServerEvent::Message { .. } => EventKind::Message,
            ServerEvent::StreamError { .. } => EventKind::StreamError,
            ServerEvent::ActionExecutedWithUndo { .. } => EventKind::ActionExecutedWithUndo,
            ServerEvent::ActionUndone { .. } => EventKind::ActionUndone,
            ServerEvent::ActionUndoFailed { .. } => EventKind::ActionUndoFailed,
            ServerEvent::ApprovalRequested { .. } => EventKind::ApprovalRequested,
            ServerEvent::ApprovalResolved { .. } => EventKind::ApprovalResolved,
        }
    }
}

/// One message from the history-hydration endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub message_id: MessageId,
    pub role: Role,
    pub message: String,
    #[serde(default)]
    pub rich_content: Vec<RichContentBlock>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub conversation_id: ConversationId,
    pub messages: Vec<HistoryMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApprovalsResponse {
    pub approvals: Vec<PendingApproval>,
}
