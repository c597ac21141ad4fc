use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shared::domain::{ActionId, UndoItem, UndoStatus};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::CoordinationEvent;

#[derive(Debug, Clone, Error)]
pub enum UndoError {
    #[error("unknown action {0}")]
    UnknownAction(String),
    #[error("action {action_id} is not undoable (status {status:?})")]
    NotActive {
        action_id: String,
        status: UndoStatus,
    },
}

struct TrackedUndo {
    item: UndoItem,
    /// Set when the item reaches a terminal status; pruned once the linger
    /// window has elapsed.
    terminal_at: Option<DateTime<Utc>>,
}

/// Queue of externally-executed, reversible actions with absolute expiry.
///
/// Every countdown and expiry decision is recomputed from `undo_deadline`,
/// never from a decremented counter, so a suspended process observes the
/// same transitions as one that ticked continuously.
pub struct UndoQueue {
    inner: Mutex<Vec<TrackedUndo>>,
    events: broadcast::Sender<CoordinationEvent>,
    linger: chrono::Duration,
}

impl UndoQueue {
    pub(crate) fn new(events: broadcast::Sender<CoordinationEvent>, linger: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Vec::new()),
            events,
            linger: chrono::Duration::milliseconds(linger.as_millis() as i64),
        })
    }

    /// At-most-once registration: a duplicate `action_id` is a no-op and the
    /// original deadline stands, so duplicate push delivery cannot reset the
    /// countdown.
    pub fn register_executed(
        &self,
        action_id: ActionId,
        title: String,
        undo_deadline: DateTime<Utc>,
        undo_duration_seconds: u32,
    ) {
        {
            let mut items = self.inner.lock();
            if items.iter().any(|tracked| tracked.item.action_id == action_id) {
                debug!("undo: duplicate registration for action {action_id}, ignored");
                return;
            }
            info!("undo: action {action_id} registered, deadline {undo_deadline}");
            items.push(TrackedUndo {
                item: UndoItem {
                    action_id,
                    title,
                    undo_deadline,
                    undo_duration_seconds,
                    status: UndoStatus::Active,
                },
                terminal_at: None,
            });
        }
        self.emit_changed();
    }

    /// Synchronously transition `Active -> Undoing` before any reversal I/O
    /// is issued. A second call while the first is in flight is rejected, so
    /// at most one reversal request ever goes out per item.
    pub fn begin_reversal(&self, action_id: &ActionId) -> Result<(), UndoError> {
        {
            let mut items = self.inner.lock();
            let tracked = items
                .iter_mut()
                .find(|tracked| tracked.item.action_id == *action_id)
                .ok_or_else(|| UndoError::UnknownAction(action_id.0.clone()))?;
            if tracked.item.status != UndoStatus::Active
                || tracked.item.remaining_seconds(Utc::now()) == 0
            {
                return Err(UndoError::NotActive {
                    action_id: action_id.0.clone(),
                    status: tracked.item.status,
                });
            }
            tracked.item.status = UndoStatus::Undoing;
        }
        self.emit_changed();
        Ok(())
    }

    /// Reversal failed: back to `Active` with the original deadline, so a
    /// failed retry can never extend the undo window.
    pub fn rollback_reversal(&self, action_id: &ActionId) {
        let changed = {
            let mut items = self.inner.lock();
            match items
                .iter_mut()
                .find(|tracked| tracked.item.action_id == *action_id)
            {
                Some(tracked) if tracked.item.status == UndoStatus::Undoing => {
                    warn!("undo: reversal of action {action_id} failed, rolled back to active");
                    tracked.item.status = UndoStatus::Active;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.emit_changed();
        }
    }

    pub fn mark_undone(&self, action_id: &ActionId) {
        let changed = {
            let mut items = self.inner.lock();
            match items
                .iter_mut()
                .find(|tracked| tracked.item.action_id == *action_id)
            {
                Some(tracked)
                    if matches!(
                        tracked.item.status,
                        UndoStatus::Active | UndoStatus::Undoing
                    ) =>
                {
                    info!("undo: action {action_id} undone");
                    tracked.item.status = UndoStatus::Undone;
                    tracked.terminal_at = Some(Utc::now());
                    true
                }
                _ => {
                    debug!("undo: action_undone for untracked action {action_id}, ignored");
                    false
                }
            }
        };
        if changed {
            self.emit_changed();
        }
    }

    /// Ticker entry point: expire overdue items and prune terminal ones past
    /// the linger window. Both decisions come from absolute instants.
    pub fn tick(&self, now: DateTime<Utc>) {
        let changed = {
            let mut items = self.inner.lock();
            let mut changed = false;
            for tracked in items.iter_mut() {
                if tracked.item.status == UndoStatus::Active
                    && tracked.item.remaining_seconds(now) == 0
                {
                    info!("undo: action {} expired", tracked.item.action_id);
                    tracked.item.status = UndoStatus::Expired;
                    tracked.terminal_at = Some(now);
                    changed = true;
                }
            }
            let before = items.len();
            items.retain(|tracked| match tracked.terminal_at {
                Some(terminal_at) => now - terminal_at < self.linger,
                None => true,
            });
            changed || items.len() != before
        };
        if changed {
            self.emit_changed();
        }
    }

    /// Read-time view with expiry recomputed from the same deadlines the
    /// ticker uses, so displays and the authoritative check never disagree.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<UndoItem> {
        let items = self.inner.lock();
        items
            .iter()
            .map(|tracked| {
                let mut item = tracked.item.clone();
                if item.status == UndoStatus::Active && item.remaining_seconds(now) == 0 {
                    item.status = UndoStatus::Expired;
                }
                item
            })
            .collect()
    }

    fn emit_changed(&self) {
        let snapshot = self.snapshot(Utc::now());
        let _ = self
            .events
            .send(CoordinationEvent::UndoQueueChanged(snapshot));
    }
}

#[cfg(test)]
#[path = "tests/undo_tests.rs"]
mod tests;
