//! Coordinator: single consumer of the event queue
//!
//! For each event it evaluates the decision matrix against the active
//! transfer on that path, then dispatches to the worker pool. Workers
//! communicate back by message passing: their terminal outcomes arrive as
//! LOW-priority TRANSFER_* events, so only this thread ever mutates the
//! transfer map.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use esync_core::error::SyncError;
use esync_core::path::RelativePath;

use crate::conflict::{conflict_file_path, ConflictOutcome};
use crate::decision::{decide, DecisionAction};
use crate::events::{now_secs, EventKind, EventMeta, EventSource, SyncEvent};
use crate::queue::EventQueue;
use crate::scanner::CursorGate;
use crate::state::{FileStatus, LocalState};
use crate::status::{AgentStatus, StatusHub};
use crate::transfer::{Transfer, TransferKind, TransferStatus, TransferTracker};
use crate::workers::pool::{PoolTask, SettledFn, WorkerPool};
use crate::workers::WorkerOutcome;

/// Poll interval of the consumer loop (also bounds shutdown latency)
const TICK: Duration = Duration::from_millis(100);

/// Coordinator counters
#[derive(Default)]
pub struct Stats {
    pub events_processed: AtomicU64,
    pub uploads_completed: AtomicU64,
    pub downloads_completed: AtomicU64,
    pub deletes_completed: AtomicU64,
    pub transfers_cancelled: AtomicU64,
    pub conflicts_detected: AtomicU64,
    pub failures: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub events_processed: u64,
    pub uploads_completed: u64,
    pub downloads_completed: u64,
    pub deletes_completed: u64,
    pub transfers_cancelled: u64,
    pub conflicts_detected: u64,
    pub failures: u64,
}

impl Stats {
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_processed: self.events_processed.load(Ordering::SeqCst),
            uploads_completed: self.uploads_completed.load(Ordering::SeqCst),
            downloads_completed: self.downloads_completed.load(Ordering::SeqCst),
            deletes_completed: self.deletes_completed.load(Ordering::SeqCst),
            transfers_cancelled: self.transfers_cancelled.load(Ordering::SeqCst),
            conflicts_detected: self.conflicts_detected.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
        }
    }
}

/// State shared between the coordinator thread, the pool callback, and
/// whoever needs to observe progress (one-shot drain, status command)
pub struct CoordinatorShared {
    pub stats: Stats,
    /// Transfers dispatched and not yet settled
    active: AtomicUsize,
    /// Set while the loop is handling an event
    busy: AtomicBool,
    /// Events parked until their path's cancelled transfer settles
    deferred_count: AtomicUsize,
    /// Worker outcomes waiting for their TRANSFER_* event to be consumed
    settled: Mutex<HashMap<RelativePath, WorkerOutcome>>,
}

impl CoordinatorShared {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stats: Stats::default(),
            active: AtomicUsize::new(0),
            busy: AtomicBool::new(false),
            deferred_count: AtomicUsize::new(0),
            settled: Mutex::new(HashMap::new()),
        })
    }

    /// Work the coordinator still owes: dispatched transfers, parked events,
    /// and the event currently in hand
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.active.load(Ordering::SeqCst)
            + self.deferred_count.load(Ordering::SeqCst)
            + usize::from(self.busy.load(Ordering::SeqCst))
    }
}

/// Build the pool completion callback: records the outcome and enqueues the
/// LOW-priority bookkeeping event the coordinator consumes.
#[must_use]
pub fn settled_fn(queue: Arc<EventQueue>, shared: Arc<CoordinatorShared>) -> SettledFn {
    Arc::new(move |path: RelativePath, _kind: TransferKind, outcome: WorkerOutcome| {
        let kind = match &outcome {
            WorkerOutcome::Failed { .. } => EventKind::TransferFailed,
            _ => EventKind::TransferComplete,
        };
        shared.settled.lock().unwrap().insert(path.clone(), outcome);
        queue.put(SyncEvent::new(kind, path));
    })
}

/// Everything the coordinator loop needs
pub struct Coordinator {
    pub queue: Arc<EventQueue>,
    pub pool: Arc<WorkerPool>,
    pub state: Arc<LocalState>,
    pub root: PathBuf,
    pub gate: Arc<CursorGate>,
    pub status: Arc<StatusHub>,
    pub shared: Arc<CoordinatorShared>,
    pub stop: Arc<AtomicBool>,
    pub machine: String,
}

impl Coordinator {
    /// Start the consumer thread.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("esync-coordinator".to_string())
            .spawn(move || self.run())
            .expect("failed to spawn coordinator thread")
    }

    fn run(mut self) {
        debug!("coordinator loop started");
        let mut transfers = TransferTracker::new();
        let mut deferred: HashMap<RelativePath, SyncEvent> = HashMap::new();

        while !self.stop.load(Ordering::SeqCst) {
            let Some(event) = self.queue.take_timeout(TICK) else {
                self.refresh_status(&transfers);
                continue;
            };

            self.shared.busy.store(true, Ordering::SeqCst);
            self.shared
                .stats
                .events_processed
                .fetch_add(1, Ordering::SeqCst);

            match event.kind {
                EventKind::TransferComplete | EventKind::TransferFailed => {
                    self.handle_settled(&event.path, &mut transfers, &mut deferred);
                }
                _ => self.handle_change(event, &mut transfers, &mut deferred),
            }

            self.shared
                .deferred_count
                .store(deferred.len(), Ordering::SeqCst);
            self.shared.busy.store(false, Ordering::SeqCst);
            self.refresh_status(&transfers);
        }

        // Shutdown: ask every in-flight worker to stop
        transfers.cancel_all();
        debug!("coordinator loop ended");
    }

    /// A worker reached a terminal outcome for `path`
    fn handle_settled(
        &mut self,
        path: &RelativePath,
        transfers: &mut TransferTracker,
        deferred: &mut HashMap<RelativePath, SyncEvent>,
    ) {
        let outcome = self.shared.settled.lock().unwrap().remove(path);
        let transfer = transfers.remove(path);
        if transfer.is_some() {
            self.shared.active.fetch_sub(1, Ordering::SeqCst);
        }

        let Some(outcome) = outcome else {
            debug!(path = %path, "transfer event without recorded outcome");
            self.gate.complete(path);
            return;
        };
        let kind = transfer.as_ref().map(|t| t.kind);
        let stats = &self.shared.stats;

        match outcome {
            WorkerOutcome::Completed => {
                match kind {
                    Some(TransferKind::Upload) => {
                        stats.uploads_completed.fetch_add(1, Ordering::SeqCst);
                    }
                    Some(TransferKind::Download) => {
                        stats.downloads_completed.fetch_add(1, Ordering::SeqCst);
                    }
                    Some(TransferKind::Delete) => {
                        stats.deletes_completed.fetch_add(1, Ordering::SeqCst);
                    }
                    None => {}
                }
            }
            WorkerOutcome::Cancelled => {
                stats.transfers_cancelled.fetch_add(1, Ordering::SeqCst);
                info!(path = %path, "transfer cancelled");
            }
            WorkerOutcome::Conflict {
                outcome,
                conflict_path,
            } => {
                self.handle_conflict_outcome(path, outcome, conflict_path, transfer.as_ref());
            }
            WorkerOutcome::Failed { error, retryable } => {
                stats.failures.fetch_add(1, Ordering::SeqCst);
                error!(path = %path, %error, retryable, "transfer failed");
                if matches!(error, SyncError::Network(_)) {
                    self.status.set(AgentStatus::Offline);
                } else {
                    self.status.set(AgentStatus::Error);
                }
            }
        }

        self.gate.complete(path);

        // A deferred event was waiting for this path to settle
        if let Some(parked) = deferred.remove(path) {
            debug!(path = %path, kind = ?parked.kind, "dispatching deferred event");
            self.handle_change(parked, transfers, deferred);
        }
    }

    fn handle_conflict_outcome(
        &self,
        path: &RelativePath,
        outcome: ConflictOutcome,
        conflict_path: Option<RelativePath>,
        transfer: Option<&Transfer>,
    ) {
        let stats = &self.shared.stats;
        match outcome {
            ConflictOutcome::AlreadySynced => {
                // Identical bytes on both sides: not a real conflict
                info!(path = %path, "false conflict resolved, already in sync");
            }
            ConflictOutcome::Resolved => {
                stats.conflicts_detected.fetch_add(1, Ordering::SeqCst);
                self.status.set(AgentStatus::Conflict);
            }
            ConflictOutcome::RetryNeeded => {
                // A racing write interfered; run the triggering event again
                if let Some(transfer) = transfer {
                    debug!(path = %path, "conflict resolution raced, requeueing");
                    self.queue.put(SyncEvent::with_meta(
                        transfer.event.kind,
                        path.clone(),
                        transfer.event.meta.clone(),
                    ));
                }
            }
            ConflictOutcome::NoConflict => {}
            ConflictOutcome::Abort => {
                stats.failures.fetch_add(1, Ordering::SeqCst);
                warn!(path = %path, "conflict could not be resolved");
            }
        }

        // The preserved copy is a brand-new local file: sync it promptly
        if let Some(conflict_rel) = conflict_path {
            self.enqueue_local_created(&conflict_rel);
        }
    }

    /// A change event (local/remote) for `path`
    fn handle_change(
        &mut self,
        event: SyncEvent,
        transfers: &mut TransferTracker,
        deferred: &mut HashMap<RelativePath, SyncEvent>,
    ) {
        let concurrent = transfers
            .active(&event.path)
            .map(|active| (decide(&event, active.kind), active.kind));

        if let Some(((action, reason), active_kind)) = concurrent {
            debug!(
                path = %event.path,
                new = ?event.kind,
                active = ?active_kind,
                ?action,
                reason,
                "concurrent event"
            );

            match action {
                DecisionAction::Ignore => {
                    self.complete_if_remote(&event);
                }
                DecisionAction::CancelAndRequeue => {
                    if let Some(active) = transfers.get(&event.path) {
                        active.request_cancel();
                    }
                    // Wait for terminal status before dispatching a
                    // replacement on the same path
                    deferred.insert(event.path.clone(), event);
                }
                DecisionAction::MarkConflict => {
                    let version = event.meta.server_version;
                    if let Some(transfer) = transfers.get_mut(&event.path) {
                        transfer.mark_conflict(version);
                    }
                    self.shared
                        .stats
                        .conflicts_detected
                        .fetch_add(1, Ordering::SeqCst);
                    self.complete_if_remote(&event);
                }
                DecisionAction::CreateConflictCopy => {
                    self.preserve_upload_source(&event.path);
                    if let Some(transfer) = transfers.get_mut(&event.path) {
                        transfer.mark_conflict(event.meta.server_version);
                    }
                    self.complete_if_remote(&event);
                }
            }
            return;
        }

        self.dispatch(event, transfers);
    }

    /// No active transfer on the path: decide the transfer kind and submit
    fn dispatch(&mut self, event: SyncEvent, transfers: &mut TransferTracker) {
        let kind = match event.kind {
            EventKind::LocalCreated | EventKind::LocalModified => TransferKind::Upload,
            EventKind::LocalDeleted => {
                // Idempotent delete: nothing recorded, nothing to do
                if self.state.get(&event.path).is_none() {
                    debug!(path = %event.path, "local delete for untracked path, no-op");
                    self.gate.complete(&event.path);
                    return;
                }
                TransferKind::Delete
            }
            EventKind::RemoteCreated | EventKind::RemoteModified => {
                if self.is_stale_remote(&event) {
                    debug!(path = %event.path, "remote change already applied, skipping");
                    self.complete_if_remote(&event);
                    return;
                }
                TransferKind::Download
            }
            EventKind::RemoteDeleted => {
                match self.state.derive_status(&event.path, &self.root) {
                    // Tracked and unchanged: mirror the deletion
                    Some(FileStatus::Synced) => TransferKind::Delete,
                    // Local modification or new file wins over remote delete
                    Some(FileStatus::Modified | FileStatus::New) => {
                        info!(path = %event.path, "local modification wins over remote delete");
                        self.complete_if_remote(&event);
                        return;
                    }
                    // Record without a file: erase the record
                    Some(FileStatus::Deleted) => TransferKind::Delete,
                    None => {
                        debug!(path = %event.path, "remote delete for unknown path, no-op");
                        self.complete_if_remote(&event);
                        return;
                    }
                }
            }
            EventKind::TransferComplete | EventKind::TransferFailed => return,
        };

        // Uploads carry the version they are based on
        let mut event = event;
        if kind == TransferKind::Upload && event.meta.parent_version.is_none() {
            event.meta.parent_version = self.state.get(&event.path).map(|r| r.server_version);
        }

        let mut transfer = Transfer::new(kind, event.clone());
        if let Err(e) = transfer.transition_to(TransferStatus::InProgress) {
            error!(path = %event.path, %e, "refusing dispatch");
            return;
        }
        let cancel = transfer.cancel_flag();
        transfers.insert(transfer);
        self.shared.active.fetch_add(1, Ordering::SeqCst);
        self.status.set(AgentStatus::Syncing);

        info!(path = %event.path, ?kind, "dispatching transfer");
        self.pool.submit(PoolTask {
            event,
            kind,
            cancel,
        });
    }

    /// Remote events count toward the cursor gate even when no transfer runs
    fn complete_if_remote(&self, event: &SyncEvent) {
        if event.source() == EventSource::Remote {
            self.gate.complete(&event.path);
        }
    }

    /// Stale push notification: our record already covers this version
    fn is_stale_remote(&self, event: &SyncEvent) -> bool {
        match (event.meta.server_version, self.state.get(&event.path)) {
            (Some(version), Some(record)) => record.server_version >= version,
            _ => false,
        }
    }

    /// CREATE_CONFLICT_COPY: the server deleted a file we are uploading.
    /// Copy (not rename; the upload is still reading) the local contents
    /// to a conflict name so they survive whatever the commit decides.
    fn preserve_upload_source(&self, path: &RelativePath) {
        let local = path.to_fs_path(&self.root);
        let conflict_fs = conflict_file_path(&local, &self.machine);
        match std::fs::copy(&local, &conflict_fs) {
            Ok(_) => {
                warn!(path = %path, copy = %conflict_fs.display(), "preserved upload source as conflict copy");
                if let Ok(rel) = RelativePath::from_fs_path(&conflict_fs, &self.root) {
                    self.enqueue_local_created(&rel);
                }
            }
            Err(e) => warn!(path = %path, error = %e, "could not preserve upload source"),
        }
    }

    fn enqueue_local_created(&self, path: &RelativePath) {
        let fs_path = path.to_fs_path(&self.root);
        let meta = match fs_path.metadata() {
            Ok(stat) => EventMeta {
                mtime: stat
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs_f64()),
                size: Some(stat.len()),
                ..EventMeta::default()
            },
            Err(_) => EventMeta::default(),
        };
        let mut event = SyncEvent::with_meta(EventKind::LocalCreated, path.clone(), meta);
        event.timestamp = now_secs();
        self.queue.put(event);
    }

    fn refresh_status(&self, transfers: &TransferTracker) {
        if transfers.active_count() == 0 && self.queue.is_empty() {
            let current = self.status.get();
            if current == AgentStatus::Syncing || current == AgentStatus::Conflict {
                self.status.set(AgentStatus::Idle);
            }
        }
    }
}
