//! Thread-safe priority queue with per-path deduplication
//!
//! Filesystem and remote events are keyed by path: at most one such event
//! per path exists at any instant, chosen by the mtime-aware comparator.
//! Internal TRANSFER_* bookkeeping events are transient and flow through a
//! side lane in arrival order so they never displace a pending change.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::debug;

use esync_core::path::RelativePath;

use crate::events::{EventSource, SyncEvent};

#[derive(Default)]
struct Inner {
    /// Path-keyed events from the change detector and remote listener
    events: HashMap<RelativePath, SyncEvent>,
    /// Internal transfer bookkeeping, FIFO
    internal: VecDeque<SyncEvent>,
    closed: bool,
}

/// Priority-ordered, deduplicating event queue
#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

/// The mtime-aware comparator: should `new` replace `old`?
///
/// 1. If both carry `mtime`: newer mtime wins; equal mtime falls back to the
///    newer event timestamp.
/// 2. Otherwise the newer event timestamp wins.
///
/// This is the rule that makes the watcher+scanner race safe: a scanner
/// event carrying a stale mtime loses to the watcher event that observed the
/// later write, regardless of emission order.
fn should_replace(old: &SyncEvent, new: &SyncEvent) -> bool {
    if let (Some(old_mtime), Some(new_mtime)) = (old.meta.mtime, new.meta.mtime) {
        if new_mtime < old_mtime {
            return false;
        }
        if new_mtime == old_mtime {
            return new.timestamp > old.timestamp;
        }
        return true;
    }
    new.timestamp >= old.timestamp
}

impl EventQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or merge an event. When the incoming event is not newer than the
    /// one already pending for its path it is silently discarded; the call
    /// still succeeds.
    pub fn put(&self, event: SyncEvent) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }

        if event.source() == EventSource::Internal {
            inner.internal.push_back(event);
            self.not_empty.notify_one();
            return;
        }

        if let Some(existing) = inner.events.get(&event.path) {
            if !should_replace(existing, &event) {
                debug!(path = %event.path, "dropping stale event (older mtime)");
                return;
            }
            debug!(
                path = %event.path,
                old = ?existing.kind,
                new = ?event.kind,
                "replacing queued event"
            );
        }

        inner.events.insert(event.path.clone(), event);
        self.not_empty.notify_one();
    }

    /// Block until an event is available; `None` once closed and drained.
    pub fn take(&self) -> Option<SyncEvent> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(event) = Self::pop_best(&mut inner) {
                return Some(event);
            }
            if inner.closed {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Like [`take`](Self::take) but gives up after `timeout`.
    pub fn take_timeout(&self, timeout: Duration) -> Option<SyncEvent> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(event) = Self::pop_best(&mut inner) {
            return Some(event);
        }
        if inner.closed {
            return None;
        }
        let (mut inner, _) = self.not_empty.wait_timeout(inner, timeout).unwrap();
        Self::pop_best(&mut inner)
    }

    /// Remove the pending event for a path, if any
    pub fn remove(&self, path: &RelativePath) -> Option<SyncEvent> {
        self.inner.lock().unwrap().events.remove(path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.events.len() + inner.internal.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending events in service order (does not consume them)
    #[must_use]
    pub fn snapshot(&self) -> Vec<SyncEvent> {
        let inner = self.inner.lock().unwrap();
        let mut all: Vec<SyncEvent> = inner
            .events
            .values()
            .chain(inner.internal.iter())
            .cloned()
            .collect();
        all.sort_by_key(|e| (e.priority(), e.id));
        all
    }

    /// Close the queue; blocked consumers wake up and drain
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.not_empty.notify_all();
    }

    /// Highest-priority event: lowest priority value, then oldest arrival.
    fn pop_best(inner: &mut Inner) -> Option<SyncEvent> {
        let best_path = inner
            .events
            .values()
            .min_by_key(|e| (e.priority(), e.id))
            .map(|e| (e.path.clone(), e.priority(), e.id));

        let internal_front = inner.internal.front().map(|e| (e.priority(), e.id));

        match (best_path, internal_front) {
            (Some((path, prio, id)), Some((iprio, iid))) => {
                if (iprio, iid) < (prio, id) {
                    inner.internal.pop_front()
                } else {
                    inner.events.remove(&path)
                }
            }
            (Some((path, _, _)), None) => inner.events.remove(&path),
            (None, Some(_)) => inner.internal.pop_front(),
            (None, None) => None,
        }
    }
}
