use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use parking_lot::Mutex;
use shared::domain::{EntryId, Role, TranscriptEntry};
use tokio::sync::broadcast;

use crate::CoordinationEvent;

/// Ordered conversation transcript with an id index.
///
/// Ownership is partitioned by construction: user-role entries are created
/// only by user-command code, reconciler-owned entries are mutated only by
/// the stream reconciler, and the modality coordinator appends finalized
/// system entries. No two producers ever write the same entry.
pub struct TranscriptStore {
    inner: Mutex<TranscriptState>,
    events: broadcast::Sender<CoordinationEvent>,
}

struct TranscriptState {
    entries: Vec<TranscriptEntry>,
    index: HashMap<EntryId, usize>,
}

impl TranscriptStore {
    pub(crate) fn new(events: broadcast::Sender<CoordinationEvent>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TranscriptState {
                entries: Vec::new(),
                index: HashMap::new(),
            }),
            events,
        })
    }

    pub fn append(&self, entry: TranscriptEntry) {
        {
            let mut state = self.inner.lock();
            let position = state.entries.len();
            state.index.insert(entry.id.clone(), position);
            state.entries.push(entry.clone());
        }
        let _ = self
            .events
            .send(CoordinationEvent::TranscriptUpdated(entry));
    }

    /// Apply `mutate` to the entry with the given id. Returns false when the
    /// id is unknown, which callers treat as a safe no-op.
    pub fn mutate(&self, id: &EntryId, mutate: impl FnOnce(&mut TranscriptEntry)) -> bool {
        let updated = {
            let mut state = self.inner.lock();
            let Some(&position) = state.index.get(id) else {
                return false;
            };
            let entry = &mut state.entries[position];
            mutate(entry);
            entry.clone()
        };
        let _ = self
            .events
            .send(CoordinationEvent::TranscriptUpdated(updated));
        true
    }

    pub fn get(&self, id: &EntryId) -> Option<TranscriptEntry> {
        let state = self.inner.lock();
        state
            .index
            .get(id)
            .map(|&position| state.entries[position].clone())
    }

    pub fn snapshot(&self) -> Vec<TranscriptEntry> {
        self.inner.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn append_user(&self, content: impl Into<String>) -> EntryId {
        let entry = finalized(Role::User, content.into());
        let id = entry.id.clone();
        self.append(entry);
        id
    }

    pub fn append_system(&self, content: impl Into<String>) -> EntryId {
        let entry = finalized(Role::System, content.into());
        let id = entry.id.clone();
        self.append(entry);
        id
    }
}

pub(crate) fn finalized(role: Role, content: String) -> TranscriptEntry {
    TranscriptEntry {
        id: EntryId::random(),
        role,
        content,
        rich_content: Vec::new(),
        suggestions: Vec::new(),
        is_streaming: false,
        timestamp: Utc::now(),
    }
}

pub(crate) fn streaming_assistant(content: String) -> TranscriptEntry {
    TranscriptEntry {
        id: EntryId::random(),
        role: Role::Assistant,
        content,
        rich_content: Vec::new(),
        suggestions: Vec::new(),
        is_streaming: true,
        timestamp: Utc::now(),
    }
}
