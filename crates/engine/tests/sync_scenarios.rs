//! End-to-end sync scenarios against the in-process remote
//!
//! Two (or more) clients share one `LocalRemote` and drive explicit sync
//! passes. Each client runs the full pipeline: queue, coordinator, worker
//! pool, conflict handling, and the heed-backed state store.

use std::sync::Arc;
use std::time::Duration;

use esync_core::chunker::{self, ChunkConfig};
use esync_core::config::AgentConfig;
use esync_core::crypto::{decrypt_chunk, encrypt_chunk};
use esync_core::path::RelativePath;
use esync_engine::agent::{AgentOptions, SyncAgent, SyncSummary};
use esync_engine::events::{EventKind, EventMeta, SyncEvent};
use esync_engine::state::UploadProgress;
use esync_engine::status::LogNotifier;
use esync_remote::api::RemoteApi;
use esync_remote::local::LocalRemote;

const KEY: [u8; 32] = [7u8; 32];

struct Client {
    agent: Option<SyncAgent>,
    root: tempfile::TempDir,
    _home: tempfile::TempDir,
}

impl Client {
    fn new(remote: &Arc<LocalRemote>, machine: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();

        let mut config = AgentConfig::default();
        config.sync_folder = root.path().to_path_buf();
        config.server_url = "http://in-process".to_string();
        config.auth_token = "test-token".to_string();
        config.machine_name = machine.to_string();
        config.cdc = ChunkConfig::small();
        config.worker_count = 2;
        config.max_retries = 2;
        config.retry_max_delay_secs = 1;

        let remote_dyn: Arc<dyn RemoteApi> = Arc::clone(remote) as Arc<dyn RemoteApi>;
        let agent = SyncAgent::start(
            home.path(),
            &config,
            KEY,
            remote_dyn,
            Arc::new(LogNotifier),
            AgentOptions::one_shot(),
        )
        .unwrap();

        Self {
            agent: Some(agent),
            root,
            _home: home,
        }
    }

    fn agent(&self) -> &SyncAgent {
        self.agent.as_ref().unwrap()
    }

    fn sync(&self) -> SyncSummary {
        self.agent()
            .sync_once(Duration::from_secs(30))
            .expect("sync pass failed")
    }

    fn write(&self, rel: &str, contents: &[u8]) {
        let path = self.root.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    fn read(&self, rel: &str) -> Vec<u8> {
        std::fs::read(self.root.path().join(rel)).unwrap()
    }

    fn delete(&self, rel: &str) {
        std::fs::remove_file(self.root.path().join(rel)).unwrap();
    }

    fn exists(&self, rel: &str) -> bool {
        self.root.path().join(rel).exists()
    }

    /// All file names under the root (recursive, relative, sorted)
    fn listing(&self) -> Vec<String> {
        fn visit(dir: &std::path::Path, base: &std::path::Path, out: &mut Vec<String>) {
            for entry in std::fs::read_dir(dir).unwrap() {
                let entry = entry.unwrap();
                let path = entry.path();
                if path.is_dir() {
                    visit(&path, base, out);
                } else {
                    out.push(
                        path.strip_prefix(base)
                            .unwrap()
                            .to_string_lossy()
                            .replace('\\', "/"),
                    );
                }
            }
        }
        let mut out = Vec::new();
        visit(self.root.path(), self.root.path(), &mut out);
        out.sort();
        out
    }

    fn conflict_files(&self) -> Vec<String> {
        self.listing()
            .into_iter()
            .filter(|name| name.contains(".conflict-"))
            .collect()
    }

    fn stop(mut self) {
        self.agent.take().unwrap().stop();
    }
}

fn rel(s: &str) -> RelativePath {
    RelativePath::new(s).unwrap()
}

/// S1: same modification on both sides is a false conflict: no
/// `.conflict-*` file may appear anywhere.
#[test]
fn s1_identical_edits_are_already_synced() {
    let remote = Arc::new(LocalRemote::new());
    let a = Client::new(&remote, "machine-a");
    let b = Client::new(&remote, "machine-b");

    a.write("notes.txt", b"hello\nfoo");
    a.sync();
    b.sync();
    assert_eq!(b.read("notes.txt"), b"hello\nfoo");

    // Both append the same line concurrently
    a.write("notes.txt", b"hello\nfoo\nbar");
    b.write("notes.txt", b"hello\nfoo\nbar");

    a.sync();
    let summary = b.sync();

    assert_eq!(summary.failures, 0);
    assert_eq!(a.read("notes.txt"), b"hello\nfoo\nbar");
    assert_eq!(b.read("notes.txt"), b"hello\nfoo\nbar");
    assert!(a.conflict_files().is_empty(), "{:?}", a.conflict_files());
    assert!(b.conflict_files().is_empty(), "{:?}", b.conflict_files());

    // B adopted the server version instead of re-uploading
    assert_eq!(remote.version_of("notes.txt"), Some(2));
    let record = b.agent().state().get(&rel("notes.txt")).unwrap();
    assert_eq!(record.server_version, 2);

    a.stop();
    b.stop();
}

/// S2: true conflict: server wins the canonical path, the loser's bytes
/// survive as a conflict copy that the next cycle uploads.
#[test]
fn s2_true_conflict_server_wins_local_preserved() {
    let remote = Arc::new(LocalRemote::new());
    let a = Client::new(&remote, "machine-a");
    let b = Client::new(&remote, "machine-b");

    a.write("doc.md", b"base");
    a.sync();
    b.sync();

    a.write("doc.md", b"A-version");
    a.sync();

    b.write("doc.md", b"B-version");
    let summary = b.sync();
    assert_eq!(summary.failures, 0);

    // B: canonical path holds the server's (A's) content
    assert_eq!(b.read("doc.md"), b"A-version");
    let b_conflicts = b.conflict_files();
    assert_eq!(b_conflicts.len(), 1, "{b_conflicts:?}");
    let conflict_name = &b_conflicts[0];
    assert!(conflict_name.starts_with("doc.conflict-"), "{conflict_name}");
    assert!(conflict_name.ends_with("-machine-b.md"), "{conflict_name}");
    assert_eq!(b.read(conflict_name), b"B-version");

    // The conflict copy was uploaded in the same drain; A pulls it down
    a.sync();
    assert_eq!(a.read("doc.md"), b"A-version");
    let a_conflicts = a.conflict_files();
    assert_eq!(a_conflicts, b_conflicts);
    assert_eq!(a.read(conflict_name), b"B-version");

    a.stop();
    b.stop();
}

/// S3: a local edit cancels an in-flight download; the local file wins and
/// is uploaded, and no partial temp file survives.
#[test]
fn s3_local_edit_cancels_download() {
    let remote = Arc::new(LocalRemote::new());
    let a = Client::new(&remote, "machine-a");

    // A publishes a multi-chunk file
    let published: Vec<u8> = (0..64_000u32).flat_map(|i| i.to_le_bytes()).collect();
    a.write("shared.txt", &published);
    a.sync();
    assert_eq!(remote.version_of("shared.txt"), Some(1));

    let b = Client::new(&remote, "machine-b");
    let b_root = b.root.path().to_path_buf();
    let b_queue = Arc::clone(b.agent().queue());

    // Mid-download, the user creates the file locally
    let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let fired_hook = Arc::clone(&fired);
    remote.set_download_hook(move |_hash| {
        if !fired_hook.swap(true, std::sync::atomic::Ordering::SeqCst) {
            std::fs::write(b_root.join("shared.txt"), b"local").unwrap();
            let stat = std::fs::metadata(b_root.join("shared.txt")).unwrap();
            let mtime = stat
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64());
            b_queue.put(SyncEvent::with_meta(
                EventKind::LocalCreated,
                RelativePath::new("shared.txt").unwrap(),
                EventMeta {
                    mtime,
                    size: Some(stat.len()),
                    ..EventMeta::default()
                },
            ));
        }
        // Give the coordinator time to apply the decision matrix
        std::thread::sleep(Duration::from_millis(30));
    });

    let summary = b.sync();
    assert!(summary.cancelled >= 1, "download should have been cancelled");

    // No partial temp file remains; local content won and was committed
    assert!(
        !b.listing().iter().any(|name| name.ends_with(".esync-tmp")),
        "{:?}",
        b.listing()
    );
    assert_eq!(b.read("shared.txt"), b"local");
    assert_eq!(remote.version_of("shared.txt"), Some(2));

    // The other client converges on the local edit
    a.sync();
    assert_eq!(a.read("shared.txt"), b"local");

    a.stop();
    b.stop();
}

/// S4: resuming an interrupted upload transfers only the missing chunks:
/// exactly 12 chunk posts for a 20-chunk file with 8 already uploaded.
#[test]
fn s4_resume_uploads_only_missing_chunks() {
    let remote = Arc::new(LocalRemote::new());
    let a = Client::new(&remote, "machine-a");

    // Build a file, then fabricate the state an interrupted upload leaves
    // behind: the first 8 chunks on the server and in UploadProgress.
    let contents: Vec<u8> = (0..80_000u32).flat_map(|i| i.to_le_bytes()).collect();
    a.write("big.bin", &contents);

    let local_path = a.root.path().join("big.bin");
    let (chunks, _hash) = chunker::chunk_file(&local_path, &ChunkConfig::small()).unwrap();
    assert!(chunks.len() >= 10, "need a multi-chunk file, got {}", chunks.len());
    let uploaded_before = 8.min(chunks.len() - 2);

    let mut progress = UploadProgress::new(
        &rel("big.bin"),
        &chunks.iter().map(|c| c.hash).collect::<Vec<_>>(),
    );
    for chunk in chunks.iter().take(uploaded_before) {
        let start = chunk.offset as usize;
        let end = start + chunk.length as usize;
        let sealed = encrypt_chunk(&contents[start..end], &KEY).unwrap();
        remote.upload_chunk(&chunk.hash, &sealed).unwrap();
        progress.mark_uploaded(&chunk.hash);
    }
    a.agent().state().put_progress(&progress).unwrap();

    let posts_before = remote.chunk_upload_count();
    let summary = a.sync();
    assert_eq!(summary.failures, 0);
    assert_eq!(summary.uploaded, 1);

    // Only the chunks missing from the progress record were posted
    let posted = remote.chunk_upload_count() - posts_before;
    assert_eq!(posted, chunks.len() - uploaded_before);

    // Progress is gone after the commit
    assert!(a.agent().state().get_progress(&rel("big.bin")).is_none());

    // Server content round-trips
    let sealed_chunks = remote.encrypted_chunks_of("big.bin").unwrap();
    let mut assembled = Vec::new();
    for sealed in sealed_chunks {
        assembled.extend_from_slice(&decrypt_chunk(&sealed, &KEY).unwrap());
    }
    assert_eq!(assembled, contents);

    a.stop();
}

/// Stale upload progress (changed bytes) is discarded and the whole file
/// uploads from scratch.
#[test]
fn s4b_changed_file_restarts_upload() {
    let remote = Arc::new(LocalRemote::new());
    let a = Client::new(&remote, "machine-a");

    let contents: Vec<u8> = (0..40_000u32).flat_map(|i| i.to_le_bytes()).collect();
    a.write("big.bin", &contents);

    // Progress recorded for different bytes
    let stale = UploadProgress::new(
        &rel("big.bin"),
        &[esync_core::hash::ContentHash::from_bytes(b"other content")],
    );
    a.agent().state().put_progress(&stale).unwrap();

    let local_path = a.root.path().join("big.bin");
    let (chunks, _) = chunker::chunk_file(&local_path, &ChunkConfig::small()).unwrap();

    let posts_before = remote.chunk_upload_count();
    a.sync();
    assert_eq!(remote.chunk_upload_count() - posts_before, chunks.len());

    a.stop();
}

/// S5: the watcher-scanner race: the event carrying the older mtime is
/// discarded by the queue no matter the arrival order.
#[test]
fn s5_stale_scanner_event_loses_to_watcher_event() {
    let queue = esync_engine::queue::EventQueue::new();
    let path = rel("x.txt");

    let watcher_event = SyncEvent::with_meta(
        EventKind::LocalModified,
        path.clone(),
        EventMeta {
            mtime: Some(2000.0),
            size: Some(10),
            ..EventMeta::default()
        },
    );
    let scanner_event = SyncEvent::with_meta(
        EventKind::LocalModified,
        path.clone(),
        EventMeta {
            mtime: Some(1000.0),
            size: Some(8),
            ..EventMeta::default()
        },
    );

    // Watcher (newer mtime) arrives first, scanner (stale) second
    queue.put(watcher_event);
    queue.put(scanner_event);

    assert_eq!(queue.len(), 1);
    let retained = queue.take().unwrap();
    assert_eq!(retained.path, path);
    assert_eq!(retained.meta.mtime, Some(2000.0));
}

/// S6: delete vs modify: the modification wins on both clients.
#[test]
fn s6_modification_wins_over_deletion() {
    let remote = Arc::new(LocalRemote::new());
    let a = Client::new(&remote, "machine-a");
    let b = Client::new(&remote, "machine-b");

    a.write("r.txt", b"old");
    a.sync();
    b.sync();
    assert_eq!(b.read("r.txt"), b"old");

    // A deletes, B modifies, A syncs first
    a.delete("r.txt");
    b.write("r.txt", b"new");

    a.sync();
    assert_eq!(remote.version_of("r.txt"), None, "soft-deleted on server");

    // B's update hits the tombstone and re-creates the file
    let summary = b.sync();
    assert_eq!(summary.failures, 0);
    assert_eq!(b.read("r.txt"), b"new");
    assert!(remote.version_of("r.txt").is_some());

    // A pulls the re-created file back down
    a.sync();
    assert!(a.exists("r.txt"), "{:?}", a.listing());
    assert_eq!(a.read("r.txt"), b"new");

    a.stop();
    b.stop();
}

/// Deletions propagate and records are erased; deleting an untracked path
/// is a no-op.
#[test]
fn deletion_propagates_between_clients() {
    let remote = Arc::new(LocalRemote::new());
    let a = Client::new(&remote, "machine-a");
    let b = Client::new(&remote, "machine-b");

    a.write("temp/scratch.txt", b"scratch");
    a.sync();
    b.sync();
    assert!(b.exists("temp/scratch.txt"));

    a.delete("temp/scratch.txt");
    a.sync();
    b.sync();

    assert!(!b.exists("temp/scratch.txt"));
    assert!(a.agent().state().get(&rel("temp/scratch.txt")).is_none());
    assert!(b.agent().state().get(&rel("temp/scratch.txt")).is_none());

    a.stop();
    b.stop();
}

/// A client with empty local state (fresh install, or a store rebuilt after
/// corruption) converges on the full server inventory.
#[test]
fn empty_state_full_resync() {
    let remote = Arc::new(LocalRemote::new());
    let a = Client::new(&remote, "machine-a");
    a.write("keep.txt", b"important");
    a.sync();

    // Fresh client with empty state sees the full server inventory
    let b = Client::new(&remote, "machine-b");
    b.sync();
    assert_eq!(b.read("keep.txt"), b"important");

    a.stop();
    b.stop();
}

/// The change cursor only advances once a fetched batch has fully settled,
/// and later syncs see nothing new.
#[test]
fn cursor_advances_after_batch_settles() {
    let remote = Arc::new(LocalRemote::new());
    let a = Client::new(&remote, "machine-a");
    let b = Client::new(&remote, "machine-b");

    a.write("one.txt", b"1");
    a.write("two.txt", b"2");
    a.sync();

    b.sync();
    let cursor_after: u64 = b
        .agent()
        .state()
        .change_cursor()
        .expect("cursor set")
        .parse()
        .unwrap();

    // A settled batch means a repeat scan downloads nothing
    let summary = b.sync();
    assert_eq!(summary.downloaded, 0);
    let cursor_later: u64 = b
        .agent()
        .state()
        .change_cursor()
        .unwrap()
        .parse()
        .unwrap();
    assert!(cursor_later >= cursor_after);

    a.stop();
    b.stop();
}

/// `.syncignore` is honored (and itself synchronized).
#[test]
fn syncignore_patterns_are_applied() {
    let remote = Arc::new(LocalRemote::new());
    let a = Client::new(&remote, "machine-a");

    a.write(".syncignore", b"*.log\n");
    a.write("app.log", b"noise");
    a.write("data.txt", b"signal");
    a.sync();

    let b = Client::new(&remote, "machine-b");
    b.sync();

    assert!(b.exists(".syncignore"));
    assert!(b.exists("data.txt"));
    assert!(!b.exists("app.log"));

    a.stop();
    b.stop();
}

/// Offline behavior: a sync pass against an unreachable server fails
/// cleanly, and the next pass after recovery converges.
#[test]
fn offline_then_recovery() {
    let remote = Arc::new(LocalRemote::new());
    let a = Client::new(&remote, "machine-a");
    a.write("file.txt", b"payload");

    remote.set_offline(true);
    assert!(a.agent().sync_once(Duration::from_secs(5)).is_err());

    remote.set_offline(false);
    let summary = a.sync();
    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.failures, 0);

    a.stop();
}
