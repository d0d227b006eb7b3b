//! Download worker
//!
//! Fetches encrypted chunks, decrypts and re-verifies each against its
//! plaintext hash, assembles into a temporary sibling file, and atomically
//! renames over the destination. A local edit racing the download is caught
//! both before (conflict check) and after (re-stat) the transfer.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use esync_core::crypto::decrypt_chunk;
use esync_core::error::SyncError;
use esync_core::hash::ContentHash;
use esync_core::path::RelativePath;
use esync_remote::api::{ApiError, FileMeta};

use crate::conflict::{self, ConflictOutcome};
use crate::events::{now_secs, SyncEvent};
use crate::retry::RetryError;
use crate::state::SyncedFileRecord;
use crate::workers::{Progress, WorkerContext, WorkerOutcome};

/// Temporary sibling used for atomic writes; matched by the default ignore
/// rules so the change detector never sees it.
fn temp_path_for(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download");
    dest.with_file_name(format!("{name}.esync-tmp"))
}

fn observe(dest: &Path) -> Option<(SystemTime, u64)> {
    let stat = dest.metadata().ok()?;
    Some((stat.modified().ok()?, stat.len()))
}

/// Execute a download transfer.
pub(crate) fn run(event: &SyncEvent, ctx: &WorkerContext<'_>) -> Result<WorkerOutcome, SyncError> {
    let path = &event.path;
    let dest = path.to_fs_path(ctx.root);

    // 1. Server metadata
    let meta = match ctx.retry.run(&ctx.cancel, ctx.remote, || {
        ctx.remote.get_file(path.as_str())
    }) {
        Ok(meta) => meta,
        Err(RetryError::Cancelled) => return Err(SyncError::Cancelled),
        Err(RetryError::Api(ApiError::NotFound | ApiError::Gone)) => {
            // Deleted remotely since the event was emitted
            debug!(path = %path, "download target gone on server, nothing to do");
            return Ok(WorkerOutcome::Completed);
        }
        Err(RetryError::Api(e)) => return Err(conflict::api_to_sync(e)),
    };

    // 2. Pre-transfer conflict check: untracked or locally-modified
    // destination is preserved before we overwrite it
    let resolution = conflict::check_download_conflict(ctx, path)?;
    match resolution.outcome {
        ConflictOutcome::RetryNeeded => {
            return Ok(WorkerOutcome::Conflict {
                outcome: ConflictOutcome::RetryNeeded,
                conflict_path: None,
            });
        }
        ConflictOutcome::Resolved => {
            info!(path = %path, "destination preserved as conflict copy before download");
        }
        _ => {}
    }
    let conflict_path = resolution.conflict_path;
    let observed = observe(&dest);

    // 3. Transfer into the temp sibling
    let temp = temp_path_for(&dest);
    if let Err(e) = download_to_temp(ctx, path, &meta, &temp) {
        let _ = std::fs::remove_file(&temp);
        return Err(e);
    }

    // 4. Post-download re-check: a local edit raced the download
    if observe(&dest) != observed {
        let _ = std::fs::remove_file(&temp);
        debug!(path = %path, "destination changed mid-download, retry needed");
        return Ok(WorkerOutcome::Conflict {
            outcome: ConflictOutcome::RetryNeeded,
            conflict_path,
        });
    }

    // 5. Cancel check before the final commit step
    if ctx.cancel.is_set() {
        let _ = std::fs::remove_file(&temp);
        return Err(SyncError::Cancelled);
    }

    // 6. Atomic rename and record write
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SyncError::LocalIo(e.to_string()))?;
    }
    std::fs::rename(&temp, &dest).map_err(|e| SyncError::LocalIo(e.to_string()))?;
    write_record_for(ctx, path, &meta)?;

    info!(path = %path, version = meta.version, chunks = meta.chunk_hashes.len(), "download complete");
    match conflict_path {
        Some(conflict_path) => Ok(WorkerOutcome::Conflict {
            outcome: ConflictOutcome::Resolved,
            conflict_path: Some(conflict_path),
        }),
        None => Ok(WorkerOutcome::Completed),
    }
}

/// Download every chunk of `meta` into `temp`, verifying plaintext hashes
/// and the final content hash.
fn download_to_temp(
    ctx: &WorkerContext<'_>,
    path: &RelativePath,
    meta: &FileMeta,
    temp: &Path,
) -> Result<(), SyncError> {
    if let Some(parent) = temp.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SyncError::LocalIo(e.to_string()))?;
    }
    let mut out =
        std::fs::File::create(temp).map_err(|e| SyncError::LocalIo(e.to_string()))?;

    let total = meta.chunk_hashes.len();
    let mut file_hasher = Sha256::new();
    let mut bytes_transferred = 0u64;

    for (index, chunk_hash) in meta.chunk_hashes.iter().enumerate() {
        // Safe suspension point between chunks
        if ctx.cancel.is_set() {
            return Err(SyncError::Cancelled);
        }

        let sealed = match ctx.retry.run(&ctx.cancel, ctx.remote, || {
            ctx.remote.download_chunk(chunk_hash)
        }) {
            Ok(sealed) => sealed,
            Err(RetryError::Cancelled) => return Err(SyncError::Cancelled),
            Err(RetryError::Api(ApiError::NotFound)) => {
                return Err(SyncError::Integrity(format!(
                    "chunk {chunk_hash} purged from server"
                )));
            }
            Err(RetryError::Api(e)) => return Err(conflict::api_to_sync(e)),
        };

        let plaintext = decrypt_chunk(&sealed, ctx.key)?;
        let actual = ContentHash::from_bytes(&plaintext);
        if actual != *chunk_hash {
            return Err(SyncError::Integrity(format!(
                "chunk hash mismatch after decrypt: expected {chunk_hash}, got {actual}"
            )));
        }

        file_hasher.update(&plaintext);
        out.write_all(&plaintext)
            .map_err(|e| SyncError::LocalIo(e.to_string()))?;
        bytes_transferred += plaintext.len() as u64;

        ctx.emit_progress(Progress {
            path: path.clone(),
            bytes_transferred,
            chunk_index: index + 1,
            total_chunks: total,
        });
    }

    out.flush().map_err(|e| SyncError::LocalIo(e.to_string()))?;

    let mut raw = [0u8; 32];
    raw.copy_from_slice(&file_hasher.finalize());
    let assembled = ContentHash::from_raw(raw);
    if assembled != meta.content_hash {
        return Err(SyncError::Integrity(format!(
            "content hash mismatch: expected {}, got {assembled}",
            meta.content_hash
        )));
    }

    Ok(())
}

/// Fetch a server file straight into `dest` (temp + rename). Used by the
/// conflict resolver, which has already moved the old contents aside.
pub(crate) fn fetch_to_path(
    ctx: &WorkerContext<'_>,
    meta: &FileMeta,
    dest: &Path,
) -> Result<(), SyncError> {
    let path = RelativePath::new(&meta.path).map_err(|e| SyncError::LocalIo(e.to_string()))?;
    let temp = temp_path_for(dest);
    if let Err(e) = download_to_temp(ctx, &path, meta, &temp) {
        let _ = std::fs::remove_file(&temp);
        return Err(e);
    }
    std::fs::rename(&temp, dest).map_err(|e| SyncError::LocalIo(e.to_string()))?;
    Ok(())
}

/// Write the post-download record from the on-disk stat and server values
pub(crate) fn write_record_for(
    ctx: &WorkerContext<'_>,
    path: &RelativePath,
    meta: &FileMeta,
) -> Result<(), SyncError> {
    let dest = path.to_fs_path(ctx.root);
    let stat = dest
        .metadata()
        .map_err(|e| SyncError::LocalIo(e.to_string()))?;
    let mtime = stat
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0.0, |d| d.as_secs_f64());

    let record = SyncedFileRecord {
        path: path.as_str().to_string(),
        local_mtime: mtime,
        local_size: stat.len(),
        server_version: meta.version,
        chunk_hashes: SyncedFileRecord::raw_hashes(&meta.chunk_hashes),
        synced_at: now_secs(),
    };
    ctx.state
        .put(&record)
        .map_err(|e| SyncError::StateCorruption(e.to_string()))
}
