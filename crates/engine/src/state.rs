//! Local state store using heed (LMDB) + rkyv
//!
//! The authoritative record of "the last known-good sync" per path, plus
//! resumable upload progress and the remote change cursor. Writes are atomic
//! per path (one LMDB write transaction each). An unreadable store is
//! rebuilt empty, which triggers a full re-sync from the server, which
//! is the source of truth.

use std::path::Path;

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use rkyv::rancor::Error as RkyvError;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::warn;

use esync_core::hash::ContentHash;
use esync_core::path::RelativePath;

use crate::events::now_secs;

/// Key for the change cursor in the meta database
const CHANGE_CURSOR_KEY: &str = "change_cursor";

/// The last successfully committed sync for a path
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct SyncedFileRecord {
    pub path: String,
    /// Local mtime (seconds) at commit
    pub local_mtime: f64,
    /// Local size at commit
    pub local_size: u64,
    /// Server version returned by the commit
    pub server_version: u64,
    /// Ordered plaintext chunk digests
    pub chunk_hashes: Vec<[u8; 32]>,
    /// When the record was written (seconds since epoch)
    pub synced_at: f64,
}

impl SyncedFileRecord {
    /// Chunk digests as `ContentHash`es
    #[must_use]
    pub fn chunk_hash_list(&self) -> Vec<ContentHash> {
        self.chunk_hashes
            .iter()
            .map(|raw| ContentHash::from_raw(*raw))
            .collect()
    }

    /// Convert a hash list into the stored representation
    #[must_use]
    pub fn raw_hashes(hashes: &[ContentHash]) -> Vec<[u8; 32]> {
        hashes.iter().map(|h| *h.as_bytes()).collect()
    }
}

/// Resumable upload progress for one path
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct UploadProgress {
    pub path: String,
    /// Plaintext digests of the exact local bytes at upload start
    pub expected: Vec<[u8; 32]>,
    /// Digests already accepted by the server
    pub uploaded: Vec<[u8; 32]>,
    pub started_at: f64,
}

impl UploadProgress {
    #[must_use]
    pub fn new(path: &RelativePath, expected: &[ContentHash]) -> Self {
        Self {
            path: path.as_str().to_string(),
            expected: SyncedFileRecord::raw_hashes(expected),
            uploaded: Vec::new(),
            started_at: now_secs(),
        }
    }

    /// Whether the freshly computed chunk list still matches this record
    #[must_use]
    pub fn matches(&self, current: &[ContentHash]) -> bool {
        self.expected.len() == current.len()
            && self
                .expected
                .iter()
                .zip(current)
                .all(|(raw, hash)| raw == hash.as_bytes())
    }

    /// Record a chunk the server has accepted
    pub fn mark_uploaded(&mut self, hash: &ContentHash) {
        if !self.uploaded.contains(hash.as_bytes()) {
            self.uploaded.push(*hash.as_bytes());
        }
    }

    #[must_use]
    pub fn is_uploaded(&self, hash: &ContentHash) -> bool {
        self.uploaded.contains(hash.as_bytes())
    }
}

/// Derived status of a path; never stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// On disk, no record
    New,
    /// Record exists; current mtime or size differs
    Modified,
    /// Record exists; not on disk
    Deleted,
    /// Record matches disk
    Synced,
}

/// Persistent per-path state
pub struct LocalState {
    env: Env,
    records: Database<Str, Bytes>,
    progress: Database<Str, Bytes>,
    meta: Database<Str, Bytes>,
}

impl LocalState {
    /// Open or create the store under `dir`. An unreadable store is wiped
    /// and recreated empty.
    ///
    /// # Errors
    /// Returns an error only if the store cannot be (re)created at all.
    pub fn open(dir: &Path) -> color_eyre::Result<Self> {
        match Self::open_inner(dir) {
            Ok(state) => Ok(state),
            Err(first_err) => {
                warn!(
                    dir = %dir.display(),
                    error = %first_err,
                    "local state unreadable, rebuilding empty (full re-sync will follow)"
                );
                let _ = std::fs::remove_dir_all(dir);
                Self::open_inner(dir)
            }
        }
    }

    #[allow(unsafe_code)]
    fn open_inner(dir: &Path) -> color_eyre::Result<Self> {
        std::fs::create_dir_all(dir)?;

        // SAFETY: standard LMDB memory-mapped I/O; the database directory is
        // protected from concurrent agents by the instance lock.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(512 * 1024 * 1024)
                .max_dbs(3)
                .open(dir)?
        };

        let mut wtxn = env.write_txn()?;
        let records = env
            .database_options()
            .types::<Str, Bytes>()
            .name("records")
            .create(&mut wtxn)?;
        let progress = env
            .database_options()
            .types::<Str, Bytes>()
            .name("upload_progress")
            .create(&mut wtxn)?;
        let meta = env
            .database_options()
            .types::<Str, Bytes>()
            .name("meta")
            .create(&mut wtxn)?;
        wtxn.commit()?;

        Ok(Self {
            env,
            records,
            progress,
            meta,
        })
    }

    /// Get the record for a path
    #[must_use]
    pub fn get(&self, path: &RelativePath) -> Option<SyncedFileRecord> {
        let rtxn = self.env.read_txn().ok()?;
        let bytes = self.records.get(&rtxn, path.as_str()).ok()??;
        decode_record(bytes, path.as_str())
    }

    /// Atomically replace the record for a path
    ///
    /// # Errors
    /// Returns an error if the write transaction fails.
    pub fn put(&self, record: &SyncedFileRecord) -> color_eyre::Result<()> {
        let bytes = rkyv::to_bytes::<RkyvError>(record)
            .map_err(|e| color_eyre::eyre::eyre!("record serialization failed: {e}"))?;
        let mut wtxn = self.env.write_txn()?;
        self.records.put(&mut wtxn, &record.path, &bytes)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Remove the record for a path
    ///
    /// # Errors
    /// Returns an error if the write transaction fails.
    pub fn delete(&self, path: &RelativePath) -> color_eyre::Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.records.delete(&mut wtxn, path.as_str())?;
        wtxn.commit()?;
        Ok(())
    }

    /// All records, sorted by path
    ///
    /// # Errors
    /// Returns an error if the read transaction fails.
    pub fn iter_all(&self) -> color_eyre::Result<Vec<SyncedFileRecord>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.records.iter(&rtxn)? {
            let (key, bytes) = entry?;
            if let Some(record) = decode_record(bytes, key) {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Derive the status of a path from its record and the on-disk stat
    #[must_use]
    pub fn derive_status(&self, path: &RelativePath, root: &Path) -> Option<FileStatus> {
        let on_disk = path.to_fs_path(root);
        let record = self.get(path);

        match (record, on_disk.metadata()) {
            (None, Ok(_)) => Some(FileStatus::New),
            (None, Err(_)) => None,
            (Some(_), Err(_)) => Some(FileStatus::Deleted),
            (Some(record), Ok(stat)) => {
                let mtime = stat
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map_or(0.0, |d| d.as_secs_f64());
                if mtime > record.local_mtime || stat.len() != record.local_size {
                    Some(FileStatus::Modified)
                } else {
                    Some(FileStatus::Synced)
                }
            }
        }
    }

    // === Upload progress ===

    #[must_use]
    pub fn get_progress(&self, path: &RelativePath) -> Option<UploadProgress> {
        let rtxn = self.env.read_txn().ok()?;
        let bytes = self.progress.get(&rtxn, path.as_str()).ok()??;
        decode_progress(bytes, path.as_str())
    }

    /// # Errors
    /// Returns an error if the write transaction fails.
    pub fn put_progress(&self, progress: &UploadProgress) -> color_eyre::Result<()> {
        let bytes = rkyv::to_bytes::<RkyvError>(progress)
            .map_err(|e| color_eyre::eyre::eyre!("progress serialization failed: {e}"))?;
        let mut wtxn = self.env.write_txn()?;
        self.progress.put(&mut wtxn, &progress.path, &bytes)?;
        wtxn.commit()?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the write transaction fails.
    pub fn delete_progress(&self, path: &RelativePath) -> color_eyre::Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.progress.delete(&mut wtxn, path.as_str())?;
        wtxn.commit()?;
        Ok(())
    }

    // === Change cursor ===

    #[must_use]
    pub fn change_cursor(&self) -> Option<String> {
        let rtxn = self.env.read_txn().ok()?;
        let bytes = self.meta.get(&rtxn, CHANGE_CURSOR_KEY).ok()??;
        String::from_utf8(bytes.to_vec()).ok()
    }

    /// # Errors
    /// Returns an error if the write transaction fails.
    pub fn set_change_cursor(&self, cursor: &str) -> color_eyre::Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.meta
            .put(&mut wtxn, CHANGE_CURSOR_KEY, cursor.as_bytes())?;
        wtxn.commit()?;
        Ok(())
    }
}

/// Decode a stored record, treating corruption as absence
fn decode_record(bytes: &[u8], key: &str) -> Option<SyncedFileRecord> {
    let archived = match rkyv::access::<ArchivedSyncedFileRecord, RkyvError>(bytes) {
        Ok(archived) => archived,
        Err(e) => {
            warn!(key, error = %e, "dropping unreadable state record");
            return None;
        }
    };
    match rkyv::deserialize::<SyncedFileRecord, RkyvError>(archived) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, error = %e, "dropping undecodable state record");
            None
        }
    }
}

/// Decode stored upload progress, treating corruption as absence
fn decode_progress(bytes: &[u8], key: &str) -> Option<UploadProgress> {
    let archived = match rkyv::access::<ArchivedUploadProgress, RkyvError>(bytes) {
        Ok(archived) => archived,
        Err(e) => {
            warn!(key, error = %e, "dropping unreadable upload progress");
            return None;
        }
    };
    match rkyv::deserialize::<UploadProgress, RkyvError>(archived) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, error = %e, "dropping undecodable upload progress");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    fn record(p: &str, mtime: f64, size: u64, version: u64) -> SyncedFileRecord {
        SyncedFileRecord {
            path: p.to_string(),
            local_mtime: mtime,
            local_size: size,
            server_version: version,
            chunk_hashes: vec![[1u8; 32], [2u8; 32]],
            synced_at: now_secs(),
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let state = LocalState::open(dir.path()).unwrap();

        assert!(state.get(&path("a.txt")).is_none());

        state.put(&record("a.txt", 100.0, 5, 3)).unwrap();
        let loaded = state.get(&path("a.txt")).unwrap();
        assert_eq!(loaded.server_version, 3);
        assert_eq!(loaded.local_size, 5);
        assert_eq!(loaded.chunk_hashes.len(), 2);

        // Atomic replace
        state.put(&record("a.txt", 200.0, 9, 4)).unwrap();
        let replaced = state.get(&path("a.txt")).unwrap();
        assert_eq!(replaced.server_version, 4);

        state.delete(&path("a.txt")).unwrap();
        assert!(state.get(&path("a.txt")).is_none());
    }

    #[test]
    fn test_iter_all_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let state = LocalState::open(dir.path()).unwrap();
        state.put(&record("b.txt", 1.0, 1, 1)).unwrap();
        state.put(&record("a.txt", 1.0, 1, 1)).unwrap();

        let all = state.iter_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].path, "a.txt");
        assert_eq!(all[1].path, "b.txt");
    }

    #[test]
    fn test_upload_progress_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let state = LocalState::open(dir.path()).unwrap();

        let hashes = vec![
            ContentHash::from_bytes(b"c0"),
            ContentHash::from_bytes(b"c1"),
        ];
        let mut progress = UploadProgress::new(&path("big.bin"), &hashes);
        progress.mark_uploaded(&hashes[0]);
        state.put_progress(&progress).unwrap();

        let loaded = state.get_progress(&path("big.bin")).unwrap();
        assert!(loaded.matches(&hashes));
        assert!(loaded.is_uploaded(&hashes[0]));
        assert!(!loaded.is_uploaded(&hashes[1]));

        // Changed chunk list no longer matches
        let other = vec![ContentHash::from_bytes(b"different")];
        assert!(!loaded.matches(&other));

        state.delete_progress(&path("big.bin")).unwrap();
        assert!(state.get_progress(&path("big.bin")).is_none());
    }

    #[test]
    fn test_change_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let state = LocalState::open(dir.path()).unwrap();
        assert!(state.change_cursor().is_none());
        state.set_change_cursor("42").unwrap();
        assert_eq!(state.change_cursor().as_deref(), Some("42"));
    }

    #[test]
    fn test_derive_status() {
        let dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let state = LocalState::open(dir.path()).unwrap();
        let p = path("f.txt");

        // No record, not on disk
        assert_eq!(state.derive_status(&p, root.path()), None);

        // On disk, no record
        std::fs::write(root.path().join("f.txt"), b"hello").unwrap();
        assert_eq!(state.derive_status(&p, root.path()), Some(FileStatus::New));

        // Record matching disk
        let stat = std::fs::metadata(root.path().join("f.txt")).unwrap();
        let mtime = stat
            .modified()
            .unwrap()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();
        state.put(&record("f.txt", mtime, stat.len(), 1)).unwrap();
        assert_eq!(
            state.derive_status(&p, root.path()),
            Some(FileStatus::Synced)
        );

        // Size change is a modification
        std::fs::write(root.path().join("f.txt"), b"hello more").unwrap();
        assert_eq!(
            state.derive_status(&p, root.path()),
            Some(FileStatus::Modified)
        );

        // Gone from disk
        std::fs::remove_file(root.path().join("f.txt")).unwrap();
        assert_eq!(
            state.derive_status(&p, root.path()),
            Some(FileStatus::Deleted)
        );
    }

    #[test]
    fn test_corrupt_store_rebuilds_empty() {
        let dir = tempfile::tempdir().unwrap();
        {
            let state = LocalState::open(dir.path()).unwrap();
            state.put(&record("keep.txt", 1.0, 1, 1)).unwrap();
        }
        // Trash the LMDB data file
        std::fs::write(dir.path().join("data.mdb"), b"not an lmdb file").unwrap();

        let state = LocalState::open(dir.path()).unwrap();
        assert!(state.get(&path("keep.txt")).is_none());
    }
}
