//! Conflict detection and resolution: Server-Wins + Local-Preserved
//!
//! The server version always ends up at the canonical path; the losing
//! local contents survive as a `.conflict-*` sibling that the next sync
//! uploads under its new name. Hash comparison first filters out false
//! conflicts where both sides wrote identical bytes.

use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{debug, info, warn};

use esync_core::config::sanitize_machine_name;
use esync_core::error::SyncError;
use esync_core::hash::ContentHash;
use esync_core::path::RelativePath;
use esync_remote::api::ApiError;

use crate::events::now_secs;
use crate::state::SyncedFileRecord;
use crate::workers::{download, WorkerContext};

/// When a conflict was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPoint {
    /// Version check before the transfer started (cheapest)
    PreTransfer,
    /// Detected while the transfer was in flight
    MidTransfer,
    /// Commit rejected (all bandwidth spent)
    PostTransfer,
    /// Concurrent event observed by the coordinator
    ConcurrentEvent,
}

/// Result of conflict detection/resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// Safe to proceed
    NoConflict,
    /// Same content on both sides; not a real conflict
    AlreadySynced,
    /// Local preserved as a conflict copy, server version in place
    Resolved,
    /// A racing write interfered; the operation should be retried
    RetryNeeded,
    /// Cannot resolve
    Abort,
}

/// Outcome plus the conflict copy location, when one was created
#[derive(Debug)]
pub struct ConflictResolution {
    pub outcome: ConflictOutcome,
    pub conflict_path: Option<RelativePath>,
    pub server_version: Option<u64>,
}

impl ConflictResolution {
    fn plain(outcome: ConflictOutcome) -> Self {
        Self {
            outcome,
            conflict_path: None,
            server_version: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SafeRenameError {
    #[error("file modified during rename")]
    Raced,
    #[error("rename failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Conflict copy name: `{stem}.conflict-YYYYMMDD-HHMMSSmmm-{machine}{ext}`.
/// Millisecond precision prevents same-second collisions.
#[must_use]
pub fn conflict_file_path(original: &Path, machine: &str) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d-%H%M%S%3f");
    let machine = sanitize_machine_name(machine);

    let stem = original
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let ext = original
        .extension()
        .and_then(|s| s.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();

    let name = format!("{stem}.conflict-{stamp}-{machine}{ext}");
    original.with_file_name(name)
}

/// Rename with a race guard: capture mtime before, verify after; on change
/// rename back and report the race.
///
/// # Errors
/// `SafeRenameError::Raced` when the file changed mid-rename, `Io` otherwise.
pub fn safe_rename(src: &Path, dst: &Path) -> Result<(), SafeRenameError> {
    let mtime_before = src.metadata()?.modified()?;
    std::fs::rename(src, dst)?;
    let mtime_after = dst.metadata()?.modified()?;

    if mtime_after != mtime_before {
        warn!(src = %src.display(), "file modified during conflict rename, rolling back");
        std::fs::rename(dst, src)?;
        return Err(SafeRenameError::Raced);
    }
    Ok(())
}

/// Preserve local contents as a conflict copy. Returns the copy's relative
/// path, or `None` when the rename raced a concurrent write.
fn preserve_local(
    ctx: &WorkerContext<'_>,
    path: &RelativePath,
) -> Result<Option<RelativePath>, SyncError> {
    let local = path.to_fs_path(ctx.root);
    let conflict_fs = conflict_file_path(&local, ctx.machine);

    match safe_rename(&local, &conflict_fs) {
        Ok(()) => {}
        Err(SafeRenameError::Raced) => return Ok(None),
        Err(SafeRenameError::Io(e)) => return Err(SyncError::LocalIo(e.to_string())),
    }

    let conflict_rel = RelativePath::from_fs_path(&conflict_fs, ctx.root)
        .map_err(|e| SyncError::LocalIo(e.to_string()))?;

    ctx.notifier.conflict(path.file_name(), ctx.machine);
    info!(path = %path, conflict = %conflict_rel, "local contents preserved as conflict copy");
    Ok(Some(conflict_rel))
}

/// Resolve an upload-side conflict (commit rejected or version drift
/// detected before/during the transfer).
///
/// 1. Fetch the server's current content hash.
/// 2. Equal to local -> `AlreadySynced`: adopt the server version, skip.
/// 3. Else rename local to `.conflict-*`, download the server version into
///    the original path, and leave the copy for the next sync to upload.
///
/// # Errors
/// Propagates classified transfer errors.
pub fn resolve_upload_conflict(
    ctx: &WorkerContext<'_>,
    path: &RelativePath,
    point: ConflictPoint,
) -> Result<ConflictResolution, SyncError> {
    debug!(path = %path, ?point, "resolving upload conflict");

    let meta = match ctx.retry.run(&ctx.cancel, ctx.remote, || {
        ctx.remote.get_file(path.as_str())
    }) {
        Ok(meta) => meta,
        Err(crate::retry::RetryError::Cancelled) => return Err(SyncError::Cancelled),
        Err(crate::retry::RetryError::Api(ApiError::NotFound | ApiError::Gone)) => {
            // Server side vanished while we were resolving; the upload path
            // re-creates the file from scratch.
            return Ok(ConflictResolution::plain(ConflictOutcome::RetryNeeded));
        }
        Err(crate::retry::RetryError::Api(e)) => return Err(api_to_sync(e)),
    };

    let local = path.to_fs_path(ctx.root);
    let local_hash =
        ContentHash::from_file(&local).map_err(|e| SyncError::LocalIo(e.to_string()))?;

    if local_hash == meta.content_hash {
        // False conflict: both sides wrote identical bytes. Adopt the
        // server's version without transferring anything.
        let stat = local
            .metadata()
            .map_err(|e| SyncError::LocalIo(e.to_string()))?;
        let record = SyncedFileRecord {
            path: path.as_str().to_string(),
            local_mtime: stat
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map_or(0.0, |d| d.as_secs_f64()),
            local_size: stat.len(),
            server_version: meta.version,
            chunk_hashes: SyncedFileRecord::raw_hashes(&meta.chunk_hashes),
            synced_at: now_secs(),
        };
        ctx.state
            .put(&record)
            .map_err(|e| SyncError::StateCorruption(e.to_string()))?;
        let _ = ctx.state.delete_progress(path);
        info!(path = %path, version = meta.version, "false conflict, already in sync");
        return Ok(ConflictResolution {
            outcome: ConflictOutcome::AlreadySynced,
            conflict_path: None,
            server_version: Some(meta.version),
        });
    }

    let Some(conflict_rel) = preserve_local(ctx, path)? else {
        return Ok(ConflictResolution::plain(ConflictOutcome::RetryNeeded));
    };

    // Server wins the canonical path
    download::fetch_to_path(ctx, &meta, &local)?;
    download::write_record_for(ctx, path, &meta)?;
    let _ = ctx.state.delete_progress(path);

    Ok(ConflictResolution {
        outcome: ConflictOutcome::Resolved,
        conflict_path: Some(conflict_rel),
        server_version: Some(meta.version),
    })
}

/// Check (and if needed resolve) a download-side conflict before the
/// destination is overwritten: an untracked file at the destination, or a
/// tracked file modified since its record, is preserved as a conflict copy.
///
/// # Errors
/// Propagates classified transfer errors.
pub fn check_download_conflict(
    ctx: &WorkerContext<'_>,
    path: &RelativePath,
) -> Result<ConflictResolution, SyncError> {
    let local = path.to_fs_path(ctx.root);
    if !local.exists() {
        return Ok(ConflictResolution::plain(ConflictOutcome::NoConflict));
    }

    let needs_preserve = match ctx.state.get(path) {
        // Untracked file appeared at the destination
        None => true,
        Some(record) => {
            let stat = match local.metadata() {
                Ok(stat) => stat,
                // Vanished between exists() and stat: nothing to preserve
                Err(_) => return Ok(ConflictResolution::plain(ConflictOutcome::NoConflict)),
            };
            let mtime = stat
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map_or(0.0, |d| d.as_secs_f64());
            mtime > record.local_mtime || stat.len() != record.local_size
        }
    };

    if !needs_preserve {
        return Ok(ConflictResolution::plain(ConflictOutcome::NoConflict));
    }

    warn!(path = %path, "local changes at download destination, preserving");
    match preserve_local(ctx, path)? {
        Some(conflict_rel) => Ok(ConflictResolution {
            outcome: ConflictOutcome::Resolved,
            conflict_path: Some(conflict_rel),
            server_version: None,
        }),
        None => Ok(ConflictResolution::plain(ConflictOutcome::RetryNeeded)),
    }
}

pub(crate) fn api_to_sync(err: ApiError) -> SyncError {
    match err {
        ApiError::Auth => SyncError::Auth("server rejected credentials".into()),
        ApiError::Network(m) => SyncError::Network(m),
        ApiError::Server(code) => SyncError::Network(format!("server error {code}")),
        ApiError::Conflict {
            current_version, ..
        } => SyncError::VersionConflict {
            path: String::new(),
            server_version: current_version,
        },
        ApiError::NotFound | ApiError::Gone => SyncError::Network("resource vanished".into()),
        ApiError::Protocol(m) => SyncError::Network(format!("protocol: {m}")),
    }
}
