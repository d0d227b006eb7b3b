//! Filesystem watcher
//!
//! OS-native notifications, debounced per path, then held for a settle
//! delay before emission so editors that write as (create-tmp, rename,
//! flush) produce one event. The stat attached to each event is taken at
//! emission read time, which is what makes queue deduplication safe.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use tracing::{debug, warn};

use esync_core::path::RelativePath;

use crate::events::{EventKind, EventMeta, SyncEvent};
use crate::ignore_rules::IgnoreRules;
use crate::queue::EventQueue;
use crate::state::LocalState;

/// Timing knobs for the watcher
#[derive(Debug, Clone, Copy)]
pub struct WatcherConfig {
    /// Per-path coalescing window
    pub debounce: Duration,
    /// Quiet period after the last event before emission
    pub settle: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(250),
            settle: Duration::from_millis(3000),
        }
    }
}

/// Watches the sync root and feeds the event queue
pub struct FileWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FileWatcher {
    /// Start watching. Must be called before the initial scan so writes
    /// during the scan are captured; the queue's dedup settles the race.
    ///
    /// # Errors
    /// Returns an error if the OS watch cannot be established.
    pub fn spawn(
        root: PathBuf,
        queue: Arc<EventQueue>,
        state: Arc<LocalState>,
        ignore: Arc<IgnoreRules>,
        config: WatcherConfig,
    ) -> color_eyre::Result<Self> {
        let (tx, rx) = mpsc::channel();

        let mut debouncer = new_debouncer(config.debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let _ = tx.send(events);
                }
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "watcher backend error");
                    }
                }
            }
        })?;
        debouncer.watch(&root, RecursiveMode::Recursive)?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("esync-watcher".to_string())
            .spawn(move || {
                // The debouncer must live on this thread for the watch to stay active
                let _debouncer = debouncer;
                let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

                while !stop_flag.load(Ordering::SeqCst) {
                    match rx.recv_timeout(Duration::from_millis(100)) {
                        Ok(events) => {
                            let now = Instant::now();
                            for event in events {
                                for path in &event.paths {
                                    pending.insert(path.clone(), now);
                                }
                            }
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }

                    // Emit paths that stayed quiet for the settle delay
                    let now = Instant::now();
                    let ready: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, last)| now.duration_since(**last) >= config.settle)
                        .map(|(path, _)| path.clone())
                        .collect();
                    for path in ready {
                        pending.remove(&path);
                        emit(&root, &path, &queue, &state, &ignore);
                    }
                }
            })
            .expect("failed to spawn watcher thread");

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the watcher thread
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Classify a settled path and inject the event
fn emit(
    root: &Path,
    fs_path: &Path,
    queue: &EventQueue,
    state: &LocalState,
    ignore: &IgnoreRules,
) {
    let Ok(relative) = fs_path.strip_prefix(root) else {
        return;
    };
    if relative.as_os_str().is_empty() {
        return;
    }

    let Ok(path) = RelativePath::from_fs_path(fs_path, root) else {
        debug!(path = %fs_path.display(), "watcher skipping unrepresentable path");
        return;
    };

    match fs_path.symlink_metadata() {
        Ok(stat) if stat.file_type().is_file() => {
            if ignore.is_ignored(relative, false) {
                return;
            }
            let mtime = stat
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64());
            let meta = EventMeta {
                mtime,
                size: Some(stat.len()),
                ..EventMeta::default()
            };
            let kind = if state.get(&path).is_some() {
                EventKind::LocalModified
            } else {
                EventKind::LocalCreated
            };
            debug!(path = %path, ?kind, "watcher event");
            queue.put(SyncEvent::with_meta(kind, path, meta));
        }
        // Directories and symlinks are not synchronized
        Ok(_) => {}
        Err(_) => {
            // Gone from disk: only meaningful if we were tracking it
            if ignore.is_ignored(relative, false) {
                return;
            }
            if state.get(&path).is_some() {
                debug!(path = %path, "watcher delete event");
                queue.put(SyncEvent::new(EventKind::LocalDeleted, path));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn harness() -> (
        tempfile::TempDir,
        tempfile::TempDir,
        Arc<EventQueue>,
        Arc<LocalState>,
        Arc<IgnoreRules>,
    ) {
        let root = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let queue = Arc::new(EventQueue::new());
        let state = Arc::new(LocalState::open(home.path()).unwrap());
        let ignore = Arc::new(IgnoreRules::load(root.path(), &[]));
        (root, home, queue, state, ignore)
    }

    #[test]
    fn test_emit_created_for_untracked_file() {
        let (root, _home, queue, state, ignore) = harness();
        let file = root.path().join("new.txt");
        std::fs::write(&file, b"hello").unwrap();

        emit(root.path(), &file, &queue, &state, &ignore);
        let event = queue.take_timeout(Duration::from_millis(50)).unwrap();
        assert_eq!(event.kind, EventKind::LocalCreated);
        assert_eq!(event.meta.size, Some(5));
        assert!(event.meta.mtime.is_some());
    }

    #[test]
    fn test_emit_modified_for_tracked_file() {
        let (root, _home, queue, state, ignore) = harness();
        let file = root.path().join("doc.txt");
        std::fs::write(&file, b"v2").unwrap();

        state
            .put(&crate::state::SyncedFileRecord {
                path: "doc.txt".to_string(),
                local_mtime: 0.0,
                local_size: 1,
                server_version: 1,
                chunk_hashes: vec![],
                synced_at: 0.0,
            })
            .unwrap();

        emit(root.path(), &file, &queue, &state, &ignore);
        let event = queue.take_timeout(Duration::from_millis(50)).unwrap();
        assert_eq!(event.kind, EventKind::LocalModified);
    }

    #[test]
    fn test_emit_deleted_only_for_tracked() {
        let (root, _home, queue, state, ignore) = harness();
        let gone = root.path().join("gone.txt");

        // Untracked missing path: nothing
        emit(root.path(), &gone, &queue, &state, &ignore);
        assert!(queue.is_empty());

        state
            .put(&crate::state::SyncedFileRecord {
                path: "gone.txt".to_string(),
                local_mtime: 0.0,
                local_size: 1,
                server_version: 1,
                chunk_hashes: vec![],
                synced_at: 0.0,
            })
            .unwrap();
        emit(root.path(), &gone, &queue, &state, &ignore);
        let event = queue.take_timeout(Duration::from_millis(50)).unwrap();
        assert_eq!(event.kind, EventKind::LocalDeleted);
    }

    #[test]
    fn test_ignored_paths_not_emitted() {
        let (root, _home, queue, state, ignore) = harness();
        let temp = root.path().join("x.esync-tmp");
        std::fs::write(&temp, b"partial").unwrap();
        emit(root.path(), &temp, &queue, &state, &ignore);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_watcher_end_to_end() {
        let (root, _home, queue, state, ignore) = harness();
        let watcher = FileWatcher::spawn(
            root.path().to_path_buf(),
            Arc::clone(&queue),
            Arc::clone(&state),
            Arc::clone(&ignore),
            WatcherConfig {
                debounce: Duration::from_millis(20),
                settle: Duration::from_millis(50),
            },
        )
        .unwrap();

        std::fs::write(root.path().join("watched.txt"), b"contents").unwrap();

        let event = queue.take_timeout(Duration::from_secs(5));
        watcher.stop();

        let event = event.expect("watcher should emit within the timeout");
        assert_eq!(event.kind, EventKind::LocalCreated);
        assert_eq!(event.path.as_str(), "watched.txt");
    }
}
