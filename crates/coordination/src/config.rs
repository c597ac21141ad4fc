use std::time::Duration;

use shared::domain::ConversationId;

pub const DEFAULT_OUTBOUND_QUEUE: usize = 64;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);
pub const DEFAULT_UNDO_TICK: Duration = Duration::from_millis(250);
pub const DEFAULT_UNDO_LINGER: Duration = Duration::from_secs(5);

/// Tuning for the event channel itself.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Bound on frames queued before the transport is established.
    pub outbound_queue: usize,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    /// HTTP base url of the backend; the websocket url is derived from it.
    pub server_url: String,
    pub conversation_id: ConversationId,
    /// System message appended after history hydration, never before it.
    pub briefing: Option<String>,
    pub undo_tick: Duration,
    pub undo_linger: Duration,
    /// When set, pending approvals are re-polled on this interval.
    pub approval_poll_interval: Option<Duration>,
    pub channel: ChannelConfig,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            conversation_id: ConversationId::new("default"),
            briefing: None,
            undo_tick: DEFAULT_UNDO_TICK,
            undo_linger: DEFAULT_UNDO_LINGER,
            approval_poll_interval: None,
            channel: ChannelConfig::default(),
        }
    }
}
