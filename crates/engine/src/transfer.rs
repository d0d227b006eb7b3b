//! Transfer state machine
//!
//! States: PENDING -> IN_PROGRESS -> {COMPLETED, CANCELLED, FAILED};
//! PENDING may also go straight to CANCELLED. All transitions are validated.
//! The coordinator is the only entity that mutates the transfer map; workers
//! hold a borrowed cancel flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use esync_core::path::RelativePath;

use crate::events::SyncEvent;

/// Kind of transfer operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Upload,
    Download,
    Delete,
}

/// Status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

impl TransferStatus {
    /// Valid transitions of the state machine
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use TransferStatus::{Cancelled, Completed, Failed, InProgress, Pending};
        matches!(
            (self, next),
            (Pending, InProgress | Cancelled) | (InProgress, Completed | Cancelled | Failed)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid transfer transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: TransferStatus,
    pub to: TransferStatus,
}

/// Cooperative cancellation flag shared between coordinator and worker
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A tracked transfer for exactly one path
#[derive(Debug)]
pub struct Transfer {
    pub path: RelativePath,
    pub kind: TransferKind,
    status: TransferStatus,
    /// Server version this transfer is based on (uploads)
    pub base_version: Option<u64>,
    /// Latest server version detected while in flight
    pub detected_server_version: Option<u64>,
    /// Set when a concurrent remote event flagged a likely conflict
    pub has_conflict: bool,
    cancel: CancelFlag,
    /// The event that triggered this transfer
    pub event: SyncEvent,
}

impl Transfer {
    #[must_use]
    pub fn new(kind: TransferKind, event: SyncEvent) -> Self {
        Self {
            path: event.path.clone(),
            kind,
            status: TransferStatus::Pending,
            base_version: event.meta.parent_version,
            detected_server_version: None,
            has_conflict: false,
            cancel: CancelFlag::new(),
            event,
        }
    }

    #[must_use]
    pub fn status(&self) -> TransferStatus {
        self.status
    }

    /// Validated transition.
    ///
    /// # Errors
    /// Returns an error for transitions the state machine forbids.
    pub fn transition_to(&mut self, next: TransferStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Ask the worker to stop at the next safe suspension point
    pub fn request_cancel(&self) {
        self.cancel.set();
    }

    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_set()
    }

    /// Clone of the cancel flag for the worker
    #[must_use]
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Flag a potential conflict detected from a concurrent remote event
    pub fn mark_conflict(&mut self, detected_version: Option<u64>) {
        self.has_conflict = true;
        if detected_version.is_some() {
            self.detected_server_version = detected_version;
        }
    }
}

/// Transfers keyed by path; owned by the coordinator thread
#[derive(Default)]
pub struct TransferTracker {
    transfers: HashMap<RelativePath, Transfer>,
}

impl TransferTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, transfer: Transfer) {
        self.transfers.insert(transfer.path.clone(), transfer);
    }

    #[must_use]
    pub fn get(&self, path: &RelativePath) -> Option<&Transfer> {
        self.transfers.get(path)
    }

    pub fn get_mut(&mut self, path: &RelativePath) -> Option<&mut Transfer> {
        self.transfers.get_mut(path)
    }

    /// Active (non-terminal) transfer on a path, if any
    #[must_use]
    pub fn active(&self, path: &RelativePath) -> Option<&Transfer> {
        self.transfers
            .get(path)
            .filter(|t| !t.status().is_terminal())
    }

    pub fn remove(&mut self, path: &RelativePath) -> Option<Transfer> {
        self.transfers.remove(path)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.transfers
            .values()
            .filter(|t| !t.status().is_terminal())
            .count()
    }

    pub fn cancel_all(&self) {
        for transfer in self.transfers.values() {
            if !transfer.status().is_terminal() {
                transfer.request_cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn transfer(kind: TransferKind) -> Transfer {
        let event = SyncEvent::new(
            EventKind::LocalModified,
            RelativePath::new("file.txt").unwrap(),
        );
        Transfer::new(kind, event)
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut t = transfer(TransferKind::Upload);
        assert_eq!(t.status(), TransferStatus::Pending);
        t.transition_to(TransferStatus::InProgress).unwrap();
        t.transition_to(TransferStatus::Completed).unwrap();
        assert!(t.status().is_terminal());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut t = transfer(TransferKind::Download);
        // Pending cannot complete directly
        assert!(t.transition_to(TransferStatus::Completed).is_err());

        t.transition_to(TransferStatus::InProgress).unwrap();
        t.transition_to(TransferStatus::Failed).unwrap();
        // Terminal states are final
        assert!(t.transition_to(TransferStatus::InProgress).is_err());
        assert!(t.transition_to(TransferStatus::Completed).is_err());
    }

    #[test]
    fn test_pending_can_cancel() {
        let mut t = transfer(TransferKind::Delete);
        t.transition_to(TransferStatus::Cancelled).unwrap();
        assert!(t.status().is_terminal());
    }

    #[test]
    fn test_cancel_flag_shared() {
        let t = transfer(TransferKind::Download);
        let flag = t.cancel_flag();
        assert!(!flag.is_set());
        t.request_cancel();
        assert!(flag.is_set());
        assert!(t.cancel_requested());
    }

    #[test]
    fn test_tracker_active() {
        let mut tracker = TransferTracker::new();
        let mut t = transfer(TransferKind::Upload);
        t.transition_to(TransferStatus::InProgress).unwrap();
        let path = t.path.clone();
        tracker.insert(t);

        assert!(tracker.active(&path).is_some());
        assert_eq!(tracker.active_count(), 1);

        tracker
            .get_mut(&path)
            .unwrap()
            .transition_to(TransferStatus::Completed)
            .unwrap();
        assert!(tracker.active(&path).is_none());
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn test_mark_conflict() {
        let mut t = transfer(TransferKind::Upload);
        t.mark_conflict(Some(7));
        assert!(t.has_conflict);
        assert_eq!(t.detected_server_version, Some(7));
    }
}
