//! Sync events
//!
//! Events are immutable; the numeric priority is encoded per kind so the
//! queue never needs business logic to order them. Lower value = served
//! first: deletes (10, 11) beat local changes (20, 21) beat remote changes
//! (30, 31); internal transfer bookkeeping (90, 91) runs last.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use esync_core::hash::ContentHash;
use esync_core::path::RelativePath;

/// Kind of sync event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    LocalCreated,
    LocalModified,
    LocalDeleted,
    RemoteCreated,
    RemoteModified,
    RemoteDeleted,
    TransferComplete,
    TransferFailed,
}

impl EventKind {
    /// Queue priority; lower is served first
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            Self::LocalDeleted => 10,
            Self::RemoteDeleted => 11,
            Self::LocalCreated => 20,
            Self::LocalModified => 21,
            Self::RemoteCreated => 30,
            Self::RemoteModified => 31,
            Self::TransferComplete => 90,
            Self::TransferFailed => 91,
        }
    }

    /// Where events of this kind originate
    #[must_use]
    pub fn source(self) -> EventSource {
        match self {
            Self::LocalCreated | Self::LocalModified | Self::LocalDeleted => EventSource::Local,
            Self::RemoteCreated | Self::RemoteModified | Self::RemoteDeleted => EventSource::Remote,
            Self::TransferComplete | Self::TransferFailed => EventSource::Internal,
        }
    }
}

/// Origin of a sync event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    Local,
    Remote,
    Internal,
}

/// Optional metadata attached to an event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventMeta {
    /// mtime (seconds) observed when the emitter read the file, not at
    /// emission time; this drives queue deduplication
    pub mtime: Option<f64>,
    /// Size observed alongside `mtime`
    pub size: Option<u64>,
    /// Server version the client believes current (uploads)
    pub parent_version: Option<u64>,
    /// Server version carried by remote events
    pub server_version: Option<u64>,
    /// Whole-file plaintext hash, when known
    pub content_hash: Option<ContentHash>,
}

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// An immutable sync event
#[derive(Debug, Clone)]
pub struct SyncEvent {
    /// Monotone creation id; doubles as the FIFO tie-break within a priority
    pub id: u64,
    pub kind: EventKind,
    pub path: RelativePath,
    /// Unix timestamp (seconds) at event creation
    pub timestamp: f64,
    pub meta: EventMeta,
}

impl SyncEvent {
    /// Create an event with empty metadata
    #[must_use]
    pub fn new(kind: EventKind, path: RelativePath) -> Self {
        Self::with_meta(kind, path, EventMeta::default())
    }

    /// Create an event carrying metadata
    #[must_use]
    pub fn with_meta(kind: EventKind, path: RelativePath, meta: EventMeta) -> Self {
        Self {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            path,
            timestamp: now_secs(),
            meta,
        }
    }

    #[must_use]
    pub fn priority(&self) -> u8 {
        self.kind.priority()
    }

    #[must_use]
    pub fn source(&self) -> EventSource {
        self.kind.source()
    }
}

/// Current unix time in fractional seconds
#[must_use]
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
