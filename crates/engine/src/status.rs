//! Ambient agent status and user-facing notifications
//!
//! OS-integration surfaces (tray icon, toasts) live outside the core and
//! subscribe through these narrow interfaces. The engine only ever reports
//! through a single hub.

use std::sync::Mutex;

use tracing::{error, info, warn};

/// Ambient state shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Idle,
    Syncing,
    Offline,
    Error,
    Conflict,
}

type StatusCallback = Box<dyn Fn(AgentStatus) + Send + Sync>;

/// Single reporter for ambient status changes
#[derive(Default)]
pub struct StatusHub {
    current: Mutex<Option<AgentStatus>>,
    on_change: Mutex<Option<StatusCallback>>,
}

impl StatusHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Some(AgentStatus::Idle)),
            on_change: Mutex::new(None),
        }
    }

    /// Register the (single) subscriber, e.g. a tray adapter
    pub fn subscribe(&self, callback: impl Fn(AgentStatus) + Send + Sync + 'static) {
        *self.on_change.lock().unwrap() = Some(Box::new(callback));
    }

    /// Report a status; subscribers only hear actual changes
    pub fn set(&self, status: AgentStatus) {
        let mut current = self.current.lock().unwrap();
        if *current == Some(status) {
            return;
        }
        *current = Some(status);
        drop(current);

        info!(?status, "agent status");
        if let Some(callback) = self.on_change.lock().unwrap().as_ref() {
            callback(status);
        }
    }

    #[must_use]
    pub fn get(&self) -> AgentStatus {
        self.current.lock().unwrap().unwrap_or(AgentStatus::Idle)
    }
}

/// Best-effort user notifications (OS toasts are out of scope; adapters
/// implement this trait)
pub trait Notifier: Send + Sync {
    /// A conflict copy was created for `file_name`
    fn conflict(&self, file_name: &str, machine: &str);
    /// A user-visible failure
    fn failure(&self, message: &str);
}

/// Notifier that writes to the log
#[derive(Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn conflict(&self, file_name: &str, machine: &str) {
        warn!(file_name, machine, "conflict copy created");
    }

    fn failure(&self, message: &str) {
        error!(message, "sync failure");
    }
}
