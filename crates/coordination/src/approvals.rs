use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use shared::domain::{ApprovalId, PendingApproval};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::CoordinationEvent;

/// Deduplicated set of pending approvals, merged from push delivery and the
/// polled full list.
///
/// Conflicts are resolved by the server-assigned revision: the higher
/// revision wins regardless of arrival path; on a tie the push-delivered
/// copy wins, since push is strictly fresher than a poll snapshot at the
/// same revision.
pub struct ApprovalLedger {
    inner: Mutex<HashMap<ApprovalId, TrackedApproval>>,
    events: broadcast::Sender<CoordinationEvent>,
}

struct TrackedApproval {
    approval: PendingApproval,
    /// Set when a full poll did not contain this id; a second consecutive
    /// miss removes it. One poll of grace covers a push that raced the
    /// in-flight poll snapshot.
    missed_poll: bool,
}

impl ApprovalLedger {
    pub(crate) fn new(events: broadcast::Sender<CoordinationEvent>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn apply_push(&self, approval: PendingApproval) {
        let changed = {
            let mut approvals = self.inner.lock();
            match approvals.get(&approval.id) {
                Some(existing) if existing.approval.revision > approval.revision => {
                    debug!(
                        "approvals: stale push for {} (revision {} < {}), ignored",
                        approval.id, approval.revision, existing.approval.revision
                    );
                    false
                }
                _ => {
                    approvals.insert(
                        approval.id.clone(),
                        TrackedApproval {
                            approval,
                            missed_poll: false,
                        },
                    );
                    true
                }
            }
        };
        if changed {
            self.emit_changed();
        }
    }

    pub fn apply_resolved(&self, approval_id: &ApprovalId) {
        let removed = self.inner.lock().remove(approval_id).is_some();
        if removed {
            info!("approvals: {approval_id} resolved");
            self.emit_changed();
        } else {
            debug!("approvals: resolution for untracked {approval_id}, ignored");
        }
    }

    /// Fold a freshly-polled full list: newer revisions replace, ids absent
    /// from two consecutive polls are removed. A single miss is forgiven so
    /// an approval pushed while the poll was in flight survives the stale
    /// snapshot.
    pub fn fold_poll(&self, polled: Vec<PendingApproval>) {
        let changed = {
            let mut approvals = self.inner.lock();
            let mut changed = false;
            for approval in &polled {
                match approvals.get_mut(&approval.id) {
                    Some(existing) => {
                        existing.missed_poll = false;
                        if existing.approval.revision < approval.revision {
                            existing.approval = approval.clone();
                            changed = true;
                        }
                    }
                    None => {
                        approvals.insert(
                            approval.id.clone(),
                            TrackedApproval {
                                approval: approval.clone(),
                                missed_poll: false,
                            },
                        );
                        changed = true;
                    }
                }
            }
            let before = approvals.len();
            approvals.retain(|id, tracked| {
                if polled.iter().any(|approval| approval.id == *id) {
                    return true;
                }
                if tracked.missed_poll {
                    debug!("approvals: {id} absent from two polls, removed");
                    false
                } else {
                    tracked.missed_poll = true;
                    true
                }
            });
            changed || approvals.len() != before
        };
        if changed {
            self.emit_changed();
        }
    }

    pub fn snapshot(&self) -> Vec<PendingApproval> {
        let mut approvals: Vec<PendingApproval> = self
            .inner
            .lock()
            .values()
            .map(|tracked| tracked.approval.clone())
            .collect();
        approvals.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        approvals
    }

    fn emit_changed(&self) {
        let _ = self
            .events
            .send(CoordinationEvent::PendingApprovalsChanged(self.snapshot()));
    }
}

#[cfg(test)]
#[path = "tests/approvals_tests.rs"]
mod tests;
