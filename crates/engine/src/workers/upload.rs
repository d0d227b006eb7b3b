//! Upload worker
//!
//! Chunks the file with CDC, resumes from persisted progress when the chunk
//! list still matches, skips chunks the server already has, encrypts each
//! chunk under a fresh nonce, and commits the metadata with optimistic
//! concurrency. Conflicts hand over to the conflict subsystem.

use tracing::{debug, info};

use esync_core::chunker;
use esync_core::crypto::encrypt_chunk;
use esync_core::error::SyncError;
use esync_core::hash::ContentHash;
use esync_core::path::RelativePath;
use esync_remote::api::{ApiError, CommitRequest, FileMeta};

use crate::conflict::{self, ConflictPoint};
use crate::events::{now_secs, SyncEvent};
use crate::retry::RetryError;
use crate::state::{SyncedFileRecord, UploadProgress};
use crate::workers::{Progress, WorkerContext, WorkerOutcome};

/// Execute an upload transfer.
pub(crate) fn run(event: &SyncEvent, ctx: &WorkerContext<'_>) -> Result<WorkerOutcome, SyncError> {
    let path = &event.path;
    let local = path.to_fs_path(ctx.root);

    if !local.exists() {
        // The file vanished between the event and the transfer; the change
        // detector will emit the deletion separately.
        debug!(path = %path, "upload source missing, skipping");
        return Ok(WorkerOutcome::Completed);
    }

    // 1. Chunk list and whole-file hash, one streaming pass
    let (chunks, content_hash) = chunker::chunk_file(&local, &ctx.cdc)?;
    let hash_list: Vec<ContentHash> = chunks.iter().map(|c| c.hash).collect();
    let stat = local.metadata()?;
    let mtime = stat
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0.0, |d| d.as_secs_f64());

    // 2. Resume check: persisted progress survives only if the bytes on
    // disk still produce the same chunk digests
    let mut progress = match ctx.state.get_progress(path) {
        Some(existing) if existing.matches(&hash_list) => {
            info!(
                path = %path,
                done = existing.uploaded.len(),
                total = hash_list.len(),
                "resuming interrupted upload"
            );
            existing
        }
        Some(_) => {
            debug!(path = %path, "file changed since last attempt, restarting upload");
            ctx.state
                .delete_progress(path)
                .map_err(|e| SyncError::StateCorruption(e.to_string()))?;
            UploadProgress::new(path, &hash_list)
        }
        None => UploadProgress::new(path, &hash_list),
    };

    // 3. Pre-transfer conflict check against the expected parent version
    let mut parent_version = event
        .meta
        .parent_version
        .or_else(|| ctx.state.get(path).map(|r| r.server_version));

    if parent_version.is_none() {
        // Untracked locally but possibly present on the server (e.g. a local
        // create raced a remote publish and won): adopt the server's current
        // version so the commit is an update, not a doomed create.
        match ctx.retry.run(&ctx.cancel, ctx.remote, || {
            ctx.remote.get_file(path.as_str())
        }) {
            Ok(meta) => {
                debug!(path = %path, version = meta.version, "adopting server version for untracked upload");
                parent_version = Some(meta.version);
            }
            Err(RetryError::Cancelled) => return Err(SyncError::Cancelled),
            Err(RetryError::Api(ApiError::NotFound | ApiError::Gone)) => {}
            Err(RetryError::Api(e)) => return Err(conflict::api_to_sync(e)),
        }
    } else if let Some(expected) = parent_version {
        match ctx.retry.run(&ctx.cancel, ctx.remote, || {
            ctx.remote.get_file(path.as_str())
        }) {
            Ok(meta) if meta.version != expected => {
                debug!(path = %path, expected, server = meta.version, "early conflict");
                let resolution = conflict::resolve_upload_conflict(ctx, path, ConflictPoint::PreTransfer)?;
                return Ok(WorkerOutcome::Conflict {
                    outcome: resolution.outcome,
                    conflict_path: resolution.conflict_path,
                });
            }
            Ok(_) => {}
            Err(RetryError::Cancelled) => return Err(SyncError::Cancelled),
            Err(RetryError::Api(ApiError::NotFound | ApiError::Gone)) => {
                // Soft-deleted (or never seen) on the server while we hold a
                // modification: modification wins, re-create as new.
                debug!(path = %path, "server side gone, re-creating as fresh file");
                parent_version = None;
            }
            Err(RetryError::Api(e)) => return Err(conflict::api_to_sync(e)),
        }
    }

    // 4. Upload missing chunks, one in memory at a time
    let total = hash_list.len();
    let mut index = 0usize;
    let mut bytes_transferred = 0u64;

    chunker::for_each_chunk::<SyncError, _>(&local, &ctx.cdc, |chunk, data| {
        // Safe suspension point between chunks
        if ctx.cancel.is_set() {
            return Err(SyncError::Cancelled);
        }
        if index >= total || chunk.hash != hash_list[index] {
            // Local bytes changed between the hashing and upload passes;
            // retryable, the next attempt re-chunks from scratch
            return Err(SyncError::LocalIo(format!(
                "file changed during upload: {path}"
            )));
        }

        if !progress.is_uploaded(&chunk.hash) {
            let exists = run_api(ctx, || ctx.remote.chunk_exists(&chunk.hash))?;
            if !exists {
                let sealed = encrypt_chunk(data, ctx.key)?;
                run_api(ctx, || ctx.remote.upload_chunk(&chunk.hash, &sealed))?;
            }
            progress.mark_uploaded(&chunk.hash);
            ctx.state
                .put_progress(&progress)
                .map_err(|e| SyncError::StateCorruption(e.to_string()))?;
        }

        index += 1;
        bytes_transferred += data.len() as u64;
        ctx.emit_progress(Progress {
            path: path.clone(),
            bytes_transferred,
            chunk_index: index,
            total_chunks: total,
        });
        Ok(())
    })?;

    if index != total {
        return Err(SyncError::LocalIo(format!(
            "file truncated during upload: {path}"
        )));
    }

    // 5. Cancel check immediately before the commit step
    if ctx.cancel.is_set() {
        return Err(SyncError::Cancelled);
    }

    let request = CommitRequest {
        path: path.as_str().to_string(),
        size: stat.len(),
        mtime,
        content_hash,
        chunk_hashes: hash_list,
        parent_version,
    };
    commit(ctx, path, &request)
}

/// Commit the metadata; 409 hands over to the conflict subsystem, 404/410 on
/// update means the file was soft-deleted under us and is re-created fresh.
fn commit(
    ctx: &WorkerContext<'_>,
    path: &RelativePath,
    request: &CommitRequest,
) -> Result<WorkerOutcome, SyncError> {
    let attempt = |req: &CommitRequest| {
        ctx.retry.run(&ctx.cancel, ctx.remote, || {
            if req.parent_version.is_none() {
                ctx.remote.create_file(req)
            } else {
                ctx.remote.update_file(req)
            }
        })
    };

    match attempt(request) {
        Ok(meta) => finish_commit(ctx, path, request, &meta),
        Err(RetryError::Cancelled) => Err(SyncError::Cancelled),
        Err(RetryError::Api(ApiError::Conflict { .. })) => {
            let resolution = conflict::resolve_upload_conflict(ctx, path, ConflictPoint::PostTransfer)?;
            Ok(WorkerOutcome::Conflict {
                outcome: resolution.outcome,
                conflict_path: resolution.conflict_path,
            })
        }
        Err(RetryError::Api(ApiError::NotFound | ApiError::Gone)) => {
            debug!(path = %path, "update hit a tombstone, re-creating as fresh file");
            let fresh = CommitRequest {
                parent_version: None,
                ..request.clone()
            };
            match attempt(&fresh) {
                Ok(meta) => finish_commit(ctx, path, &fresh, &meta),
                Err(RetryError::Cancelled) => Err(SyncError::Cancelled),
                Err(RetryError::Api(ApiError::Conflict { .. })) => {
                    let resolution =
                        conflict::resolve_upload_conflict(ctx, path, ConflictPoint::PostTransfer)?;
                    Ok(WorkerOutcome::Conflict {
                        outcome: resolution.outcome,
                        conflict_path: resolution.conflict_path,
                    })
                }
                Err(RetryError::Api(e)) => Err(conflict::api_to_sync(e)),
            }
        }
        Err(RetryError::Api(e)) => Err(conflict::api_to_sync(e)),
    }
}

/// Atomically publish the new record and drop the resume state
fn finish_commit(
    ctx: &WorkerContext<'_>,
    path: &RelativePath,
    request: &CommitRequest,
    meta: &FileMeta,
) -> Result<WorkerOutcome, SyncError> {
    let record = SyncedFileRecord {
        path: path.as_str().to_string(),
        local_mtime: request.mtime,
        local_size: request.size,
        server_version: meta.version,
        chunk_hashes: SyncedFileRecord::raw_hashes(&request.chunk_hashes),
        synced_at: now_secs(),
    };
    ctx.state
        .put(&record)
        .map_err(|e| SyncError::StateCorruption(e.to_string()))?;
    ctx.state
        .delete_progress(path)
        .map_err(|e| SyncError::StateCorruption(e.to_string()))?;

    info!(
        path = %path,
        version = meta.version,
        chunks = request.chunk_hashes.len(),
        "upload committed"
    );
    Ok(WorkerOutcome::Completed)
}

fn run_api<T>(
    ctx: &WorkerContext<'_>,
    operation: impl FnMut() -> Result<T, ApiError>,
) -> Result<T, SyncError> {
    match ctx.retry.run(&ctx.cancel, ctx.remote, operation) {
        Ok(value) => Ok(value),
        Err(RetryError::Cancelled) => Err(SyncError::Cancelled),
        Err(RetryError::Api(e)) => Err(conflict::api_to_sync(e)),
    }
}
