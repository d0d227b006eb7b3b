//! In-process remote for testing
//!
//! Simulates the metadata/blob server in memory: monotone per-file versions,
//! optimistic-concurrency commits, soft deletes, a change log with cursors,
//! and a content-addressed chunk store. Lets the whole sync pipeline run in
//! a test without a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use esync_core::hash::ContentHash;

use crate::api::{
    ApiError, ChangeEntry, ChangeKind, ChangesPage, CommitRequest, FileMeta, RemoteApi,
};

#[derive(Clone)]
struct StoredFile {
    meta: FileMeta,
}

struct LogEntry {
    seq: u64,
    kind: ChangeKind,
    path: String,
    version: Option<u64>,
}

#[derive(Default)]
struct Inner {
    files: HashMap<String, StoredFile>,
    chunks: HashMap<ContentHash, Vec<u8>>,
    log: Vec<LogEntry>,
    next_seq: u64,
}

type DownloadHook = Box<dyn FnMut(&ContentHash) + Send>;

/// In-memory remote server
#[derive(Default)]
pub struct LocalRemote {
    inner: Mutex<Inner>,
    chunk_uploads: AtomicUsize,
    chunk_downloads: AtomicUsize,
    /// Invoked on every chunk download; tests use this to race local edits
    /// against an in-flight transfer.
    download_hook: Mutex<Option<DownloadHook>>,
    /// When true every call fails with a network error (offline simulation)
    offline: std::sync::atomic::AtomicBool,
}

impl LocalRemote {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunk payloads accepted so far
    #[must_use]
    pub fn chunk_upload_count(&self) -> usize {
        self.chunk_uploads.load(Ordering::SeqCst)
    }

    /// Number of chunk payloads served so far
    #[must_use]
    pub fn chunk_download_count(&self) -> usize {
        self.chunk_downloads.load(Ordering::SeqCst)
    }

    /// Install a hook called before each chunk download
    pub fn set_download_hook(&self, hook: impl FnMut(&ContentHash) + Send + 'static) {
        *self.download_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Simulate the server becoming unreachable
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Current version of a live file, if present
    #[must_use]
    pub fn version_of(&self, path: &str) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner
            .files
            .get(path)
            .filter(|f| f.meta.deleted_at.is_none())
            .map(|f| f.meta.version)
    }

    /// Assemble the plaintext-addressable payloads for a live file, in order.
    /// Payloads are still encrypted; tests decrypt with the client key.
    #[must_use]
    pub fn encrypted_chunks_of(&self, path: &str) -> Option<Vec<Vec<u8>>> {
        let inner = self.inner.lock().unwrap();
        let file = inner.files.get(path)?;
        if file.meta.deleted_at.is_some() {
            return None;
        }
        file.meta
            .chunk_hashes
            .iter()
            .map(|h| inner.chunks.get(h).cloned())
            .collect()
    }

    fn ensure_online(&self) -> Result<(), ApiError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ApiError::Network("connection refused".into()));
        }
        Ok(())
    }

    fn append_log(inner: &mut Inner, kind: ChangeKind, path: &str, version: Option<u64>) {
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.log.push(LogEntry {
            seq,
            kind,
            path: path.to_string(),
            version,
        });
    }

    fn meta_from_commit(req: &CommitRequest, version: u64) -> FileMeta {
        FileMeta {
            path: req.path.clone(),
            version,
            size: req.size,
            mtime: req.mtime,
            content_hash: req.content_hash,
            chunk_hashes: req.chunk_hashes.clone(),
            deleted_at: None,
        }
    }
}

impl RemoteApi for LocalRemote {
    fn health_check(&self) -> bool {
        self.ensure_online().is_ok()
    }

    fn get_file(&self, path: &str) -> Result<FileMeta, ApiError> {
        self.ensure_online()?;
        let inner = self.inner.lock().unwrap();
        let file = inner.files.get(path).ok_or(ApiError::NotFound)?;
        if file.meta.deleted_at.is_some() {
            return Err(ApiError::Gone);
        }
        Ok(file.meta.clone())
    }

    fn list_files(&self) -> Result<Vec<FileMeta>, ApiError> {
        self.ensure_online()?;
        let inner = self.inner.lock().unwrap();
        let mut files: Vec<FileMeta> = inner
            .files
            .values()
            .filter(|f| f.meta.deleted_at.is_none())
            .map(|f| f.meta.clone())
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    fn create_file(&self, req: &CommitRequest) -> Result<FileMeta, ApiError> {
        self.ensure_online()?;
        let mut inner = self.inner.lock().unwrap();

        // Creating over a live file is a version conflict; creating over a
        // tombstone revives the path with a fresh version.
        let version = match inner.files.get(&req.path) {
            Some(existing) if existing.meta.deleted_at.is_none() => {
                return Err(ApiError::Conflict {
                    current_version: existing.meta.version,
                    content_hash: existing.meta.content_hash,
                });
            }
            Some(tombstone) => tombstone.meta.version + 1,
            None => 1,
        };

        let meta = Self::meta_from_commit(req, version);
        inner.files.insert(
            req.path.clone(),
            StoredFile { meta: meta.clone() },
        );
        Self::append_log(&mut inner, ChangeKind::Created, &req.path, Some(version));
        Ok(meta)
    }

    fn update_file(&self, req: &CommitRequest) -> Result<FileMeta, ApiError> {
        self.ensure_online()?;
        let mut inner = self.inner.lock().unwrap();

        let current = match inner.files.get(&req.path) {
            None => return Err(ApiError::NotFound),
            Some(f) if f.meta.deleted_at.is_some() => return Err(ApiError::Gone),
            Some(f) => f.meta.clone(),
        };

        if req.parent_version != Some(current.version) {
            return Err(ApiError::Conflict {
                current_version: current.version,
                content_hash: current.content_hash,
            });
        }

        let meta = Self::meta_from_commit(req, current.version + 1);
        inner.files.insert(
            req.path.clone(),
            StoredFile { meta: meta.clone() },
        );
        Self::append_log(&mut inner, ChangeKind::Updated, &req.path, Some(meta.version));
        Ok(meta)
    }

    fn delete_file(&self, path: &str) -> Result<(), ApiError> {
        self.ensure_online()?;
        let mut inner = self.inner.lock().unwrap();
        let file = inner.files.get_mut(path).ok_or(ApiError::NotFound)?;
        if file.meta.deleted_at.is_some() {
            // Idempotent
            return Ok(());
        }
        file.meta.version += 1;
        file.meta.deleted_at = Some("deleted".to_string());
        let version = file.meta.version;
        Self::append_log(&mut inner, ChangeKind::Deleted, path, Some(version));
        Ok(())
    }

    fn changes_since(&self, cursor: Option<&str>) -> Result<ChangesPage, ApiError> {
        self.ensure_online()?;
        let since: u64 = match cursor {
            Some(s) => s
                .parse()
                .map_err(|_| ApiError::Protocol(format!("bad cursor: {s}")))?,
            None => 0,
        };

        let inner = self.inner.lock().unwrap();
        let changes: Vec<ChangeEntry> = inner
            .log
            .iter()
            .filter(|e| e.seq > since)
            .map(|e| ChangeEntry {
                kind: e.kind,
                path: e.path.clone(),
                version: e.version,
            })
            .collect();
        Ok(ChangesPage {
            changes,
            cursor: inner.next_seq.to_string(),
        })
    }

    fn chunk_exists(&self, hash: &ContentHash) -> Result<bool, ApiError> {
        self.ensure_online()?;
        Ok(self.inner.lock().unwrap().chunks.contains_key(hash))
    }

    fn upload_chunk(&self, hash: &ContentHash, payload: &[u8]) -> Result<(), ApiError> {
        self.ensure_online()?;
        self.chunk_uploads.fetch_add(1, Ordering::SeqCst);
        self.inner
            .lock()
            .unwrap()
            .chunks
            .insert(*hash, payload.to_vec());
        Ok(())
    }

    fn download_chunk(&self, hash: &ContentHash) -> Result<Vec<u8>, ApiError> {
        self.ensure_online()?;
        if let Some(hook) = self.download_hook.lock().unwrap().as_mut() {
            hook(hash);
        }
        self.chunk_downloads.fetch_add(1, Ordering::SeqCst);
        self.inner
            .lock()
            .unwrap()
            .chunks
            .get(hash)
            .cloned()
            .ok_or(ApiError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(path: &str, data: &[u8], parent: Option<u64>) -> CommitRequest {
        CommitRequest {
            path: path.to_string(),
            size: data.len() as u64,
            mtime: 1000.0,
            content_hash: ContentHash::from_bytes(data),
            chunk_hashes: vec![ContentHash::from_bytes(data)],
            parent_version: parent,
        }
    }

    #[test]
    fn test_create_update_versions() {
        let remote = LocalRemote::new();
        let v1 = remote.create_file(&commit("a.txt", b"one", None)).unwrap();
        assert_eq!(v1.version, 1);

        let v2 = remote
            .update_file(&commit("a.txt", b"two", Some(1)))
            .unwrap();
        assert_eq!(v2.version, 2);
    }

    #[test]
    fn test_update_with_stale_parent_conflicts() {
        let remote = LocalRemote::new();
        remote.create_file(&commit("a.txt", b"one", None)).unwrap();
        remote
            .update_file(&commit("a.txt", b"two", Some(1)))
            .unwrap();

        match remote.update_file(&commit("a.txt", b"three", Some(1))) {
            Err(ApiError::Conflict {
                current_version, ..
            }) => assert_eq!(current_version, 2),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_soft_delete_then_update_is_gone() {
        let remote = LocalRemote::new();
        remote.create_file(&commit("a.txt", b"one", None)).unwrap();
        remote.delete_file("a.txt").unwrap();

        assert!(matches!(remote.get_file("a.txt"), Err(ApiError::Gone)));
        assert!(matches!(
            remote.update_file(&commit("a.txt", b"x", Some(1))),
            Err(ApiError::Gone)
        ));

        // Create revives the path with a later version
        let revived = remote.create_file(&commit("a.txt", b"new", None)).unwrap();
        assert!(revived.version > 2);
    }

    #[test]
    fn test_changes_cursor() {
        let remote = LocalRemote::new();
        remote.create_file(&commit("a.txt", b"one", None)).unwrap();
        remote.create_file(&commit("b.txt", b"two", None)).unwrap();

        let page = remote.changes_since(None).unwrap();
        assert_eq!(page.changes.len(), 2);

        // Nothing new after the cursor
        let next = remote.changes_since(Some(&page.cursor)).unwrap();
        assert!(next.changes.is_empty());

        remote.delete_file("a.txt").unwrap();
        let after_delete = remote.changes_since(Some(&page.cursor)).unwrap();
        assert_eq!(after_delete.changes.len(), 1);
        assert_eq!(after_delete.changes[0].kind, ChangeKind::Deleted);
    }

    #[test]
    fn test_chunk_store() {
        let remote = LocalRemote::new();
        let hash = ContentHash::from_bytes(b"plaintext");
        assert!(!remote.chunk_exists(&hash).unwrap());

        remote.upload_chunk(&hash, b"sealed-bytes").unwrap();
        assert!(remote.chunk_exists(&hash).unwrap());
        assert_eq!(remote.download_chunk(&hash).unwrap(), b"sealed-bytes");
        assert_eq!(remote.chunk_upload_count(), 1);
    }

    #[test]
    fn test_offline_simulation() {
        let remote = LocalRemote::new();
        remote.set_offline(true);
        assert!(!remote.health_check());
        assert!(matches!(
            remote.list_files(),
            Err(ApiError::Network(_))
        ));
        remote.set_offline(false);
        assert!(remote.health_check());
    }
}
