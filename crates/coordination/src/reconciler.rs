use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use shared::{
    domain::{EntryId, RichContentBlock, Role, TranscriptEntry, UiCommand},
    error::ApiError,
    protocol::HistoryMessage,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    transcript::{self, TranscriptStore},
    CoordinationError, CoordinationEvent,
};

/// Folds the inbound reply events (*thinking*, *token*, *metadata*,
/// terminal *message*, *stream-error*) into exactly one transcript entry
/// per reply, tolerating any interleaving of metadata relative to tokens
/// and the terminal event.
///
/// At most one streaming entry is tracked at a time; all mutation happens
/// synchronously under one lock, so arrival order is fold order.
pub struct StreamReconciler {
    transcript: Arc<TranscriptStore>,
    inner: Mutex<ReconcilerState>,
    events: broadcast::Sender<CoordinationEvent>,
}

#[derive(Default)]
struct ReconcilerState {
    streaming: Option<EntryId>,
    thinking: bool,
    /// Most recently finalized reply, the target for metadata that arrives
    /// after the terminal event.
    last_reply: Option<EntryId>,
    by_message_id: HashMap<shared::domain::MessageId, EntryId>,
}

impl StreamReconciler {
    pub(crate) fn new(
        transcript: Arc<TranscriptStore>,
        events: broadcast::Sender<CoordinationEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transcript,
            inner: Mutex::new(ReconcilerState::default()),
            events,
        })
    }

    pub fn handle_thinking(&self, is_thinking: bool) {
        let mut state = self.inner.lock();
        if is_thinking && state.streaming.is_some() {
            warn!("stream: thinking started while a reply is still streaming, ignoring");
            return;
        }
        if state.thinking == is_thinking {
            return;
        }
        state.thinking = is_thinking;
        drop(state);
        let _ = self.events.send(CoordinationEvent::ThinkingChanged(is_thinking));
    }

    pub fn handle_token(&self, content: &str) {
        let mut state = self.inner.lock();
        self.clear_thinking(&mut state);
        match state.streaming.clone() {
            Some(id) => {
                // Append, never replace.
                self.transcript
                    .mutate(&id, |entry| entry.content.push_str(content));
            }
            None => {
                let entry = transcript::streaming_assistant(content.to_string());
                state.streaming = Some(entry.id.clone());
                self.transcript.append(entry);
            }
        }
    }

    /// Merge rich content and suggestions into the tracked entry, whether it
    /// is still streaming or already finalized. A message id with no
    /// association is dropped silently: stale ids are an expected consequence
    /// of at-most-once, order-tolerant delivery.
    pub fn handle_metadata(
        &self,
        message_id: &shared::domain::MessageId,
        rich_content: &[RichContentBlock],
        ui_commands: &[UiCommand],
        suggestions: &[String],
    ) {
        let mut state = self.inner.lock();
        let target = state
            .by_message_id
            .get(message_id)
            .cloned()
            .or_else(|| state.streaming.clone())
            .or_else(|| state.last_reply.clone());
        let Some(target) = target else {
            debug!("stream: metadata for untracked message {message_id}, dropped");
            return;
        };
        state.by_message_id.insert(message_id.clone(), target.clone());
        let rich_content = rich_content.to_vec();
        let suggestions = suggestions.to_vec();
        self.transcript.mutate(&target, |entry| {
            // Replace, never extend: redelivery of the same metadata after a
            // reconnect must not duplicate blocks.
            if !rich_content.is_empty() {
                entry.rich_content = rich_content;
            }
            if !suggestions.is_empty() {
                entry.suggestions = suggestions;
            }
        });
        drop(state);
        self.forward_ui_commands(ui_commands);
    }

    /// Terminal event: authoritative content, streaming flag cleared. When no
    /// streaming entry exists (the reply arrived in one frame) a finalized
    /// entry is created directly instead of merging into a phantom one.
    pub fn handle_message(
        &self,
        message: &str,
        rich_content: &[RichContentBlock],
        ui_commands: &[UiCommand],
        suggestions: &[String],
    ) {
        let mut state = self.inner.lock();
        self.clear_thinking(&mut state);
        let rich_content = rich_content.to_vec();
        let suggestions = suggestions.to_vec();
        match state.streaming.take() {
            Some(id) => {
                let message = message.to_string();
                self.transcript.mutate(&id, |entry| {
                    entry.content = message;
                    if !rich_content.is_empty() {
                        entry.rich_content = rich_content;
                    }
                    if !suggestions.is_empty() {
                        entry.suggestions = suggestions;
                    }
                    entry.is_streaming = false;
                });
                state.last_reply = Some(id);
            }
            None => {
                let mut entry = transcript::finalized(Role::Assistant, message.to_string());
                entry.rich_content = rich_content;
                entry.suggestions = suggestions;
                state.last_reply = Some(entry.id.clone());
                self.transcript.append(entry);
            }
        }
        drop(state);
        self.forward_ui_commands(ui_commands);
    }

    /// Finalize an aborted reply as a system-role error entry. Never leaves
    /// an entry stuck with `is_streaming == true`.
    pub fn handle_stream_error(&self, error: &ApiError, recoverable: bool) {
        let mut state = self.inner.lock();
        self.clear_thinking(&mut state);
        let content = format!("The assistant reply failed: {}", error.message);
        match state.streaming.take() {
            Some(id) => {
                self.transcript.mutate(&id, |entry| {
                    entry.role = Role::System;
                    entry.content = content;
                    entry.is_streaming = false;
                });
            }
            None => {
                self.transcript
                    .append(transcript::finalized(Role::System, content));
            }
        }
        drop(state);
        let _ = self
            .events
            .send(CoordinationEvent::Error(CoordinationError::Stream {
                message: error.message.clone(),
                recoverable,
            }));
    }

    /// Rebuild the transcript from the history-hydration call. Callers
    /// append any injected briefing after this, never before.
    pub fn fold_history(&self, messages: Vec<HistoryMessage>) {
        let mut state = self.inner.lock();
        for message in messages {
            let entry = TranscriptEntry {
                id: EntryId::new(message.message_id.0.clone()),
                role: message.role,
                content: message.message,
                rich_content: message.rich_content,
                suggestions: message.suggestions,
                is_streaming: false,
                timestamp: message.sent_at,
            };
            state
                .by_message_id
                .insert(message.message_id, entry.id.clone());
            if message_is_reply(&entry) {
                state.last_reply = Some(entry.id.clone());
            }
            self.transcript.append(entry);
        }
    }

    pub fn is_thinking(&self) -> bool {
        self.inner.lock().thinking
    }

    pub fn streaming_entry(&self) -> Option<EntryId> {
        self.inner.lock().streaming.clone()
    }

    fn clear_thinking(&self, state: &mut ReconcilerState) {
        if state.thinking {
            state.thinking = false;
            let _ = self.events.send(CoordinationEvent::ThinkingChanged(false));
        }
    }

    fn forward_ui_commands(&self, ui_commands: &[UiCommand]) {
        if ui_commands.is_empty() {
            return;
        }
        let _ = self
            .events
            .send(CoordinationEvent::UiCommands(ui_commands.to_vec()));
    }
}

fn message_is_reply(entry: &TranscriptEntry) -> bool {
    entry.role == Role::Assistant
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
