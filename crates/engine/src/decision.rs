//! Decision matrix for concurrent events
//!
//! When an event arrives for a path with an active transfer, a declarative
//! rule table decides the action. Rules are data: adding a row must never
//! require touching the dispatch loop.
//!
//! | New event       | Active transfer | Action                |
//! |-----------------|-----------------|-----------------------|
//! | LOCAL_*         | DOWNLOAD        | CANCEL_AND_REQUEUE    |
//! | LOCAL_*         | UPLOAD          | IGNORE                |
//! | REMOTE_MODIFIED | UPLOAD          | MARK_CONFLICT         |
//! | REMOTE_DELETED  | UPLOAD          | CREATE_CONFLICT_COPY  |
//! | REMOTE_*        | DOWNLOAD        | IGNORE                |

use crate::events::{EventKind, EventSource, SyncEvent};
use crate::transfer::TransferKind;

/// Action to take on a concurrent event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    /// Already handling this path
    Ignore,
    /// Cancel the active transfer, handle the new event once it settles
    CancelAndRequeue,
    /// Continue, but flag the likely commit-time conflict
    MarkConflict,
    /// Preserve local contents as a conflict copy, then continue
    CreateConflictCopy,
}

/// One row of the decision matrix
#[derive(Debug, Clone, Copy)]
pub struct DecisionRule {
    /// Source of the incoming event
    pub source: EventSource,
    /// Specific kind, or `None` to match any event from `source`
    pub kind: Option<EventKind>,
    /// Kind of the active transfer
    pub active: TransferKind,
    pub action: DecisionAction,
    pub reason: &'static str,
}

/// The declarative rule table. First match wins.
pub const DECISION_RULES: &[DecisionRule] = &[
    DecisionRule {
        source: EventSource::Local,
        kind: None,
        active: TransferKind::Download,
        action: DecisionAction::CancelAndRequeue,
        reason: "local change takes precedence over incoming remote",
    },
    DecisionRule {
        source: EventSource::Remote,
        kind: Some(EventKind::RemoteModified),
        active: TransferKind::Upload,
        action: DecisionAction::MarkConflict,
        reason: "server changed while uploading, commit will likely conflict",
    },
    DecisionRule {
        source: EventSource::Remote,
        kind: Some(EventKind::RemoteDeleted),
        active: TransferKind::Upload,
        action: DecisionAction::CreateConflictCopy,
        reason: "server deleted, local changes must be preserved",
    },
    DecisionRule {
        source: EventSource::Remote,
        kind: None,
        active: TransferKind::Download,
        action: DecisionAction::Ignore,
        reason: "already downloading the latest from the server",
    },
    DecisionRule {
        source: EventSource::Local,
        kind: None,
        active: TransferKind::Upload,
        action: DecisionAction::Ignore,
        reason: "already pushing local changes",
    },
];

/// Evaluate the rule table; unknown combinations default to IGNORE.
#[must_use]
pub fn decide(event: &SyncEvent, active: TransferKind) -> (DecisionAction, &'static str) {
    for rule in DECISION_RULES {
        let source_matches = rule.source == event.source();
        let kind_matches = rule.kind.is_none_or(|k| k == event.kind);
        if source_matches && kind_matches && rule.active == active {
            return (rule.action, rule.reason);
        }
    }
    (DecisionAction::Ignore, "no matching rule")
}
