//! Periodic change scanner and the change-cursor gate
//!
//! The scanner walks the sync root against the record store to find local
//! drift, asks the server's `changes-since` endpoint for remote drift, and
//! emits typed events. The cursor gate guarantees cursor safety: the stored
//! cursor only advances after every event of a fetched batch has reached a
//! terminal outcome, so a crash can never silently skip a remote change.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use ignore::WalkBuilder;
use tracing::{debug, info, warn};

use esync_core::path::RelativePath;
use esync_remote::api::{ApiError, ChangeKind, RemoteApi};

use crate::events::{EventKind, EventMeta, SyncEvent};
use crate::ignore_rules::IgnoreRules;
use crate::queue::EventQueue;
use crate::state::{FileStatus, LocalState};
use crate::status::{AgentStatus, StatusHub};

/// A fetched remote batch whose cursor is still held back
struct Batch {
    cursor: String,
    pending: HashSet<RelativePath>,
}

/// Holds `change_cursor` advancement until a batch fully settles
pub struct CursorGate {
    state: Arc<LocalState>,
    batches: Mutex<VecDeque<Batch>>,
}

impl CursorGate {
    #[must_use]
    pub fn new(state: Arc<LocalState>) -> Arc<Self> {
        Arc::new(Self {
            state,
            batches: Mutex::new(VecDeque::new()),
        })
    }

    /// Register a fetched batch. An empty batch commits its cursor as soon
    /// as every earlier batch has drained.
    pub fn open_batch(&self, cursor: String, pending: HashSet<RelativePath>) {
        let mut batches = self.batches.lock().unwrap();
        batches.push_back(Batch { cursor, pending });
        self.advance(&mut batches);
    }

    /// Mark a path's event as terminally settled
    pub fn complete(&self, path: &RelativePath) {
        let mut batches = self.batches.lock().unwrap();
        for batch in batches.iter_mut() {
            batch.pending.remove(path);
        }
        self.advance(&mut batches);
    }

    fn advance(&self, batches: &mut VecDeque<Batch>) {
        while let Some(front) = batches.front() {
            if !front.pending.is_empty() {
                break;
            }
            let batch = batches.pop_front().unwrap();
            if let Err(e) = self.state.set_change_cursor(&batch.cursor) {
                warn!(error = %e, "failed to persist change cursor");
            } else {
                debug!(cursor = %batch.cursor, "change cursor advanced");
            }
        }
    }

    /// Batches still waiting for settlement
    #[must_use]
    pub fn open_batches(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

/// A local file observed by the scan, with the stat taken at read time
#[derive(Debug, Clone)]
pub struct LocalFileInfo {
    pub path: RelativePath,
    pub mtime: f64,
    pub size: u64,
}

/// Result of the local filesystem walk
#[derive(Debug, Default)]
pub struct LocalChanges {
    pub created: Vec<LocalFileInfo>,
    pub modified: Vec<LocalFileInfo>,
    pub deleted: Vec<RelativePath>,
}

/// Result of the remote `changes-since` query
#[derive(Debug, Default)]
pub struct RemoteChangeSet {
    pub created: Vec<(RelativePath, Option<u64>)>,
    pub modified: Vec<(RelativePath, Option<u64>)>,
    pub deleted: Vec<RelativePath>,
    pub cursor: Option<String>,
}

/// Detects local and remote drift and feeds the queue
pub struct ChangeScanner {
    pub remote: Arc<dyn RemoteApi>,
    pub state: Arc<LocalState>,
    pub root: PathBuf,
    /// Extra patterns from configuration; `.syncignore` is reloaded from the
    /// sync root on every pass since it is itself synchronized
    pub extra_patterns: Vec<String>,
    pub queue: Arc<EventQueue>,
    pub gate: Arc<CursorGate>,
}

impl ChangeScanner {
    fn ignore_rules(&self) -> Arc<IgnoreRules> {
        Arc::new(IgnoreRules::load(&self.root, &self.extra_patterns))
    }

    /// Walk the sync root and compare against the record store.
    /// Per-path I/O errors are logged and skipped; the next scan retries.
    #[must_use]
    pub fn scan_local(&self) -> LocalChanges {
        let mut changes = LocalChanges::default();
        let mut found: HashSet<RelativePath> = HashSet::new();

        let rules = self.ignore_rules();
        let root = self.root.clone();
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .follow_links(false)
            .filter_entry(move |entry| {
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    return true;
                };
                if relative.as_os_str().is_empty() {
                    return true;
                }
                let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
                !rules.is_ignored(relative, is_dir)
            });

        for result in builder.build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "scan error, skipping entry");
                    continue;
                }
            };
            let file_type = entry.file_type();
            // Symlinks are never synchronized
            if !file_type.is_some_and(|t| t.is_file()) {
                continue;
            }

            let Ok(path) = RelativePath::from_fs_path(entry.path(), &self.root) else {
                debug!(path = %entry.path().display(), "skipping unrepresentable path");
                continue;
            };

            let stat = match entry.path().metadata() {
                Ok(stat) => stat,
                Err(e) => {
                    warn!(path = %path, error = %e, "stat failed, skipping until next scan");
                    continue;
                }
            };
            let mtime = stat
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map_or(0.0, |d| d.as_secs_f64());
            let info = LocalFileInfo {
                path: path.clone(),
                mtime,
                size: stat.len(),
            };

            found.insert(path.clone());
            match self.state.get(&path) {
                None => changes.created.push(info),
                Some(record) => {
                    if mtime > record.local_mtime || stat.len() != record.local_size {
                        changes.modified.push(info);
                    }
                }
            }
        }

        // Records with no on-disk counterpart are local deletions
        match self.state.iter_all() {
            Ok(records) => {
                for record in records {
                    let Ok(path) = RelativePath::new(&record.path) else {
                        continue;
                    };
                    if !found.contains(&path) {
                        changes.deleted.push(path);
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not enumerate records for deletion scan"),
        }

        changes
    }

    /// Fetch remote changes since the stored cursor.
    ///
    /// # Errors
    /// Network errors propagate so the caller can go OFFLINE and retry.
    pub fn fetch_remote(&self) -> Result<RemoteChangeSet, ApiError> {
        let rules = self.ignore_rules();
        let cursor = self.state.change_cursor();
        let page = self.remote.changes_since(cursor.as_deref())?;

        // Coalesce to the last entry per path
        let mut latest: HashMap<RelativePath, (ChangeKind, Option<u64>)> = HashMap::new();
        let mut order: Vec<RelativePath> = Vec::new();
        for change in page.changes {
            let Ok(path) = RelativePath::new(&change.path) else {
                debug!(path = %change.path, "skipping unrepresentable remote path");
                continue;
            };
            if rules.is_ignored(std::path::Path::new(path.as_str()), false) {
                continue;
            }
            if !latest.contains_key(&path) {
                order.push(path.clone());
            }
            latest.insert(path, (change.kind, change.version));
        }

        let mut set = RemoteChangeSet {
            cursor: Some(page.cursor),
            ..RemoteChangeSet::default()
        };

        for path in order {
            let (kind, version) = latest[&path];
            let record = self.state.get(&path);

            // A pending local change takes precedence; the upload path will
            // detect and resolve the version drift itself.
            if matches!(
                self.state.derive_status(&path, &self.root),
                Some(FileStatus::New | FileStatus::Modified)
            ) && kind != ChangeKind::Deleted
            {
                debug!(path = %path, "remote change deferred to pending local change");
                continue;
            }

            match kind {
                ChangeKind::Created | ChangeKind::Updated => match record {
                    None => set.created.push((path, version)),
                    Some(record) if version != Some(record.server_version) => {
                        set.modified.push((path, version));
                    }
                    Some(_) => {}
                },
                ChangeKind::Deleted => {
                    if record.is_some() || path.to_fs_path(&self.root).exists() {
                        set.deleted.push(path);
                    }
                }
            }
        }

        Ok(set)
    }

    /// Emit events for detected changes; returns how many were queued.
    ///
    /// Both-sides content changes are not emitted as remote events: the
    /// local upload runs first and the conflict subsystem settles the rest.
    /// Deletions lose to modifications in either direction.
    pub fn emit(&self, local: &LocalChanges, remote: &RemoteChangeSet) -> usize {
        let local_content: HashSet<&RelativePath> = local
            .created
            .iter()
            .chain(local.modified.iter())
            .map(|info| &info.path)
            .collect();
        let local_deleted: HashSet<&RelativePath> = local.deleted.iter().collect();
        let remote_content: HashSet<&RelativePath> = remote
            .created
            .iter()
            .chain(remote.modified.iter())
            .map(|(path, _)| path)
            .collect();
        let remote_deleted: HashSet<&RelativePath> = remote.deleted.iter().collect();

        let mut emitted = 0usize;
        let mut remote_pending: HashSet<RelativePath> = HashSet::new();

        for info in &local.created {
            self.queue.put(self.local_event(EventKind::LocalCreated, info));
            emitted += 1;
        }
        for info in &local.modified {
            self.queue.put(self.local_event(EventKind::LocalModified, info));
            emitted += 1;
        }
        for path in &local.deleted {
            // Remote modification wins over local deletion
            if remote_content.contains(path) {
                info!(path = %path, "remote modification wins over local deletion");
                continue;
            }
            self.queue
                .put(SyncEvent::new(EventKind::LocalDeleted, path.clone()));
            emitted += 1;
        }

        for (kind, entries) in [
            (EventKind::RemoteCreated, &remote.created),
            (EventKind::RemoteModified, &remote.modified),
        ] {
            for (path, version) in entries {
                if local_content.contains(path) || local_deleted.contains(path) {
                    // Local side moves first; conflict handling decides later
                    debug!(path = %path, "remote change deferred to local event");
                    continue;
                }
                let meta = EventMeta {
                    server_version: *version,
                    ..EventMeta::default()
                };
                self.queue
                    .put(SyncEvent::with_meta(kind, path.clone(), meta));
                remote_pending.insert(path.clone());
                emitted += 1;
            }
        }

        for path in &remote.deleted {
            if local_content.contains(path) {
                info!(path = %path, "local modification wins over remote deletion");
                continue;
            }
            self.queue
                .put(SyncEvent::new(EventKind::RemoteDeleted, path.clone()));
            remote_pending.insert(path.clone());
            emitted += 1;
        }

        if let Some(cursor) = &remote.cursor {
            self.gate.open_batch(cursor.clone(), remote_pending);
        }

        emitted
    }

    /// One full detection pass: remote fetch, local walk, emission.
    ///
    /// # Errors
    /// Network errors propagate so the caller can go OFFLINE and retry.
    pub fn run_once(&self) -> Result<usize, ApiError> {
        let remote = self.fetch_remote()?;
        let local = self.scan_local();
        let emitted = self.emit(&local, &remote);
        debug!(
            emitted,
            local_created = local.created.len(),
            local_modified = local.modified.len(),
            local_deleted = local.deleted.len(),
            remote_created = remote.created.len(),
            remote_modified = remote.modified.len(),
            remote_deleted = remote.deleted.len(),
            "scan pass complete"
        );
        Ok(emitted)
    }

    fn local_event(&self, kind: EventKind, info: &LocalFileInfo) -> SyncEvent {
        let parent_version = self.state.get(&info.path).map(|r| r.server_version);
        SyncEvent::with_meta(
            kind,
            info.path.clone(),
            EventMeta {
                mtime: Some(info.mtime),
                size: Some(info.size),
                parent_version,
                ..EventMeta::default()
            },
        )
    }
}

/// Periodic scan loop; waits out network outages by polling the health
/// endpoint instead of burning the scan interval.
pub fn spawn_scan_loop(
    scanner: Arc<ChangeScanner>,
    interval: Duration,
    status: Arc<StatusHub>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("esync-scanner".to_string())
        .spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                if !sleep_with_stop(interval, &stop) {
                    break;
                }
                match scanner.run_once() {
                    Ok(_) => {}
                    Err(e) if e.is_unreachable() => {
                        warn!(error = %e, "server unreachable during scan");
                        status.set(AgentStatus::Offline);
                        // Heartbeat until reachability returns
                        loop {
                            if !sleep_with_stop(Duration::from_secs(5), &stop) {
                                return;
                            }
                            if scanner.remote.health_check() {
                                info!("server reachable again, rescanning");
                                status.set(AgentStatus::Syncing);
                                let _ = scanner.run_once();
                                break;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "scan pass failed"),
                }
            }
        })
        .expect("failed to spawn scanner thread")
}

fn sleep_with_stop(total: Duration, stop: &AtomicBool) -> bool {
    let slice = Duration::from_millis(100);
    let mut remaining = total;
    while !remaining.is_zero() {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        std::thread::sleep(remaining.min(slice));
        remaining = remaining.saturating_sub(slice);
    }
    !stop.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    fn gate_with_state() -> (Arc<CursorGate>, Arc<LocalState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(LocalState::open(dir.path()).unwrap());
        (CursorGate::new(Arc::clone(&state)), state, dir)
    }

    #[test]
    fn test_empty_batch_commits_immediately() {
        let (gate, state, _dir) = gate_with_state();
        gate.open_batch("5".to_string(), HashSet::new());
        assert_eq!(state.change_cursor().as_deref(), Some("5"));
        assert_eq!(gate.open_batches(), 0);
    }

    #[test]
    fn test_cursor_held_until_batch_settles() {
        let (gate, state, _dir) = gate_with_state();
        let pending: HashSet<_> = [path("a.txt"), path("b.txt")].into_iter().collect();
        gate.open_batch("9".to_string(), pending);

        assert!(state.change_cursor().is_none());
        gate.complete(&path("a.txt"));
        assert!(state.change_cursor().is_none());
        gate.complete(&path("b.txt"));
        assert_eq!(state.change_cursor().as_deref(), Some("9"));
    }

    #[test]
    fn test_batches_commit_in_order() {
        let (gate, state, _dir) = gate_with_state();
        gate.open_batch("1".to_string(), [path("a.txt")].into_iter().collect());
        gate.open_batch("2".to_string(), [path("b.txt")].into_iter().collect());

        // Later batch settles first: cursor must not jump past batch 1
        gate.complete(&path("b.txt"));
        assert!(state.change_cursor().is_none());

        gate.complete(&path("a.txt"));
        assert_eq!(state.change_cursor().as_deref(), Some("2"));
    }

    #[test]
    fn test_unknown_path_completion_harmless() {
        let (gate, state, _dir) = gate_with_state();
        gate.complete(&path("never-seen.txt"));
        assert!(state.change_cursor().is_none());
    }
}
