//! Delete worker
//!
//! Propagates deletions in either direction and erases the record. Both
//! directions are idempotent: a missing local file or an already-deleted
//! server file count as success.

use tracing::{debug, info};

use esync_core::error::SyncError;
use esync_remote::api::ApiError;

use crate::conflict;
use crate::events::{EventSource, SyncEvent};
use crate::retry::RetryError;
use crate::workers::{WorkerContext, WorkerOutcome};

/// Execute a delete transfer.
pub(crate) fn run(event: &SyncEvent, ctx: &WorkerContext<'_>) -> Result<WorkerOutcome, SyncError> {
    let path = &event.path;

    match event.source() {
        EventSource::Local => {
            // Local deletion propagates to the server (soft delete there)
            match ctx.retry.run(&ctx.cancel, ctx.remote, || {
                ctx.remote.delete_file(path.as_str())
            }) {
                Ok(()) => {}
                Err(RetryError::Cancelled) => return Err(SyncError::Cancelled),
                // Already absent server-side
                Err(RetryError::Api(ApiError::NotFound | ApiError::Gone)) => {
                    debug!(path = %path, "already deleted on server");
                }
                Err(RetryError::Api(e)) => return Err(conflict::api_to_sync(e)),
            }
            info!(path = %path, "deletion propagated to server");
        }
        EventSource::Remote => {
            // Remote deletion removes the local file
            let local = path.to_fs_path(ctx.root);
            if ctx.cancel.is_set() {
                return Err(SyncError::Cancelled);
            }
            match std::fs::remove_file(&local) {
                Ok(()) => info!(path = %path, "deleted locally after remote deletion"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path, "already absent locally");
                }
                Err(e) => return Err(SyncError::LocalIo(e.to_string())),
            }
        }
        EventSource::Internal => {
            debug!(path = %path, "internal event reached delete worker, ignoring");
            return Ok(WorkerOutcome::Completed);
        }
    }

    ctx.state
        .delete(path)
        .map_err(|e| SyncError::StateCorruption(e.to_string()))?;
    let _ = ctx.state.delete_progress(path);
    Ok(WorkerOutcome::Completed)
}
