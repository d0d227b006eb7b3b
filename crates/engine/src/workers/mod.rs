//! Transfer workers
//!
//! Each worker executes one transfer, checks the cancel flag between chunks
//! and before commit, emits progress samples, and returns a terminal
//! outcome. Low-level failures are converted into the error taxonomy before
//! returning.

pub mod delete;
pub mod download;
pub mod pool;
pub mod upload;

use std::path::Path;
use std::sync::Arc;

use esync_core::chunker::ChunkConfig;
use esync_core::error::SyncError;
use esync_core::path::RelativePath;
use esync_remote::api::RemoteApi;

use crate::conflict::ConflictOutcome;
use crate::retry::RetryPolicy;
use crate::state::LocalState;
use crate::status::Notifier;
use crate::transfer::{CancelFlag, TransferKind};

/// Progress sample emitted between chunks
#[derive(Debug, Clone)]
pub struct Progress {
    pub path: RelativePath,
    pub bytes_transferred: u64,
    pub chunk_index: usize,
    pub total_chunks: usize,
}

/// Observer for progress samples
pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// Terminal outcome of a worker execution
#[derive(Debug)]
pub enum WorkerOutcome {
    /// Work finished (or there was legitimately nothing to do)
    Completed,
    /// Stopped at a safe suspension point after cancellation
    Cancelled,
    /// The conflict subsystem ran; `conflict_path` is set when local
    /// contents were preserved as a conflict copy
    Conflict {
        outcome: ConflictOutcome,
        conflict_path: Option<RelativePath>,
    },
    /// Classified failure
    Failed { error: SyncError, retryable: bool },
}

/// Everything a worker needs to execute one transfer
pub struct WorkerContext<'a> {
    pub remote: &'a dyn RemoteApi,
    pub state: &'a LocalState,
    pub root: &'a Path,
    pub key: &'a [u8; 32],
    pub cdc: ChunkConfig,
    pub retry: RetryPolicy,
    pub cancel: CancelFlag,
    pub machine: &'a str,
    pub notifier: &'a dyn Notifier,
    pub progress: Option<ProgressFn>,
}

impl WorkerContext<'_> {
    pub(crate) fn emit_progress(&self, sample: Progress) {
        if let Some(callback) = &self.progress {
            callback(sample);
        }
    }
}

/// Execute the worker for `kind`, converting errors into a terminal outcome
#[must_use]
pub fn run(kind: TransferKind, event: &crate::events::SyncEvent, ctx: &WorkerContext<'_>) -> WorkerOutcome {
    let result = match kind {
        TransferKind::Upload => upload::run(event, ctx),
        TransferKind::Download => download::run(event, ctx),
        TransferKind::Delete => delete::run(event, ctx),
    };

    match result {
        Ok(outcome) => outcome,
        Err(SyncError::Cancelled) => WorkerOutcome::Cancelled,
        Err(error) => {
            let retryable = error.is_retryable();
            WorkerOutcome::Failed { error, retryable }
        }
    }
}
