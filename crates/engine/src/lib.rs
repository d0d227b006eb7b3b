//! esync-engine: Event-driven sync engine
//!
//! The pipeline: change detector (watcher + scanner) emits typed events into
//! a priority queue with mtime-aware deduplication; a coordinator applies a
//! declarative decision matrix against active transfers and dispatches to an
//! interruptible worker pool; workers chunk, encrypt, transfer, and commit;
//! conflicts resolve by Server-Wins-plus-Local-Preserved.

pub mod agent;
pub mod conflict;
pub mod coordinator;
pub mod decision;
pub mod events;
pub mod ignore_rules;
pub mod listener;
pub mod lock;
pub mod queue;
pub mod retry;
pub mod scanner;
pub mod state;
pub mod status;
pub mod transfer;
pub mod watcher;
pub mod workers;

pub use agent::{AgentOptions, SyncAgent, SyncSummary};
pub use events::{EventKind, EventMeta, EventSource, SyncEvent};
pub use queue::EventQueue;
pub use state::{LocalState, SyncedFileRecord, UploadProgress};
pub use status::{AgentStatus, LogNotifier, Notifier, StatusHub};
