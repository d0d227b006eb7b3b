//! Agent supervision: lifecycle, wiring, graceful shutdown
//!
//! Startup order matters: the worker pool and coordinator come up first,
//! then the watcher, and only then the initial scan, so modifications landing
//! during the scan are captured by the watcher and reconciled by the
//! queue's mtime-aware deduplication.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use esync_core::config::AgentConfig;
use esync_remote::api::RemoteApi;

use crate::coordinator::{settled_fn, Coordinator, CoordinatorShared, StatsSnapshot};
use crate::ignore_rules::IgnoreRules;
use crate::listener::{ws_url, RemoteListener};
use crate::lock::InstanceLock;
use crate::queue::EventQueue;
use crate::retry::RetryPolicy;
use crate::scanner::{spawn_scan_loop, ChangeScanner, CursorGate};
use crate::state::LocalState;
use crate::status::{AgentStatus, Notifier, StatusHub};
use crate::watcher::{FileWatcher, WatcherConfig};
use crate::workers::pool::{PoolContext, WorkerPool};

/// Subdirectory of the agent home holding the state store
const STATE_DIR: &str = "state";

/// Which background producers to run
#[derive(Debug, Clone, Copy)]
pub struct AgentOptions {
    pub watcher: bool,
    pub initial_scan: bool,
    pub scan_loop: bool,
    pub listener: bool,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            watcher: true,
            initial_scan: true,
            scan_loop: true,
            listener: true,
        }
    }
}

impl AgentOptions {
    /// One-shot mode: no background producers, sync is driven explicitly
    #[must_use]
    pub fn one_shot() -> Self {
        Self {
            watcher: false,
            initial_scan: false,
            scan_loop: false,
            listener: false,
        }
    }
}

/// Outcome counts of a drained sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub uploaded: u64,
    pub downloaded: u64,
    pub deleted: u64,
    pub conflicts: u64,
    pub cancelled: u64,
    pub failures: u64,
}

/// The running sync agent
pub struct SyncAgent {
    queue: Arc<EventQueue>,
    state: Arc<LocalState>,
    status: Arc<StatusHub>,
    shared: Arc<CoordinatorShared>,
    scanner: Arc<ChangeScanner>,
    pool: Arc<WorkerPool>,
    stop: Arc<AtomicBool>,
    coordinator: Option<JoinHandle<()>>,
    scan_loop: Option<JoinHandle<()>>,
    watcher: Option<FileWatcher>,
    listener: Option<RemoteListener>,
    _lock: InstanceLock,
}

impl SyncAgent {
    /// Acquire the instance lock, open state, and bring the pipeline up.
    ///
    /// # Errors
    /// Fails when another agent holds the lock, the state store cannot be
    /// created, or the filesystem watch cannot be established.
    pub fn start(
        home: &Path,
        config: &AgentConfig,
        key: [u8; 32],
        remote: Arc<dyn RemoteApi>,
        notifier: Arc<dyn Notifier>,
        options: AgentOptions,
    ) -> color_eyre::Result<Self> {
        let lock = InstanceLock::acquire(home)?;
        std::fs::create_dir_all(&config.sync_folder)?;

        let state = Arc::new(LocalState::open(&home.join(STATE_DIR))?);
        let queue = Arc::new(EventQueue::new());
        let status = Arc::new(StatusHub::new());
        let ignore = Arc::new(IgnoreRules::load(
            &config.sync_folder,
            &config.ignore_patterns,
        ));
        let gate = CursorGate::new(Arc::clone(&state));
        let shared = CoordinatorShared::new();
        let stop = Arc::new(AtomicBool::new(false));

        let retry = RetryPolicy {
            max_attempts: config.max_retries,
            max_delay: Duration::from_secs(config.retry_max_delay_secs),
        };

        let pool = Arc::new(WorkerPool::start(
            PoolContext {
                remote: Arc::clone(&remote),
                state: Arc::clone(&state),
                root: config.sync_folder.clone(),
                key,
                cdc: config.cdc,
                retry,
                machine: config.machine_name.clone(),
                notifier,
                progress: None,
            },
            config.worker_count,
            settled_fn(Arc::clone(&queue), Arc::clone(&shared)),
        ));

        let coordinator = Coordinator {
            queue: Arc::clone(&queue),
            pool: Arc::clone(&pool),
            state: Arc::clone(&state),
            root: config.sync_folder.clone(),
            gate: Arc::clone(&gate),
            status: Arc::clone(&status),
            shared: Arc::clone(&shared),
            stop: Arc::clone(&stop),
            machine: config.machine_name.clone(),
        }
        .spawn();

        // The watcher must be running before the initial scan
        let watcher = if options.watcher {
            Some(FileWatcher::spawn(
                config.sync_folder.clone(),
                Arc::clone(&queue),
                Arc::clone(&state),
                Arc::clone(&ignore),
                WatcherConfig {
                    debounce: Duration::from_millis(config.debounce_ms),
                    settle: Duration::from_millis(config.settle_ms),
                },
            )?)
        } else {
            None
        };

        let scanner = Arc::new(ChangeScanner {
            remote: Arc::clone(&remote),
            state: Arc::clone(&state),
            root: config.sync_folder.clone(),
            extra_patterns: config.ignore_patterns.clone(),
            queue: Arc::clone(&queue),
            gate,
        });

        if options.initial_scan {
            match scanner.run_once() {
                Ok(emitted) => info!(emitted, "initial scan complete"),
                Err(e) => {
                    warn!(error = %e, "initial scan failed, starting offline");
                    status.set(AgentStatus::Offline);
                }
            }
        }

        let scan_loop = options.scan_loop.then(|| {
            spawn_scan_loop(
                Arc::clone(&scanner),
                Duration::from_secs(config.scan_interval_secs),
                Arc::clone(&status),
                Arc::clone(&stop),
            )
        });

        let listener = options.listener.then(|| {
            RemoteListener::spawn(
                ws_url(&config.server_url, &config.auth_token),
                Arc::clone(&queue),
                Arc::clone(&state),
                Arc::clone(&scanner),
            )
        });

        info!(
            root = %config.sync_folder.display(),
            workers = config.worker_count,
            "sync agent started"
        );

        Ok(Self {
            queue,
            state,
            status,
            shared,
            scanner,
            pool,
            stop,
            coordinator: Some(coordinator),
            scan_loop,
            watcher,
            listener,
            _lock: lock,
        })
    }

    /// Default agent home resolution (see [`AgentConfig::home_dir`])
    #[must_use]
    pub fn default_home() -> PathBuf {
        AgentConfig::home_dir()
    }

    #[must_use]
    pub fn status(&self) -> AgentStatus {
        self.status.get()
    }

    #[must_use]
    pub fn status_hub(&self) -> &Arc<StatusHub> {
        &self.status
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    #[must_use]
    pub fn state(&self) -> &Arc<LocalState> {
        &self.state
    }

    #[must_use]
    pub fn scanner(&self) -> &Arc<ChangeScanner> {
        &self.scanner
    }

    /// Block until the queue is drained and no transfer is in flight.
    /// Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stable = 0u32;
        while Instant::now() < deadline {
            if self.queue.is_empty() && self.shared.in_flight() == 0 {
                stable += 1;
                // Two consecutive observations bridge the gap between a
                // worker settling and the coordinator consuming the event
                if stable >= 2 {
                    return true;
                }
            } else {
                stable = 0;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    /// One explicit detection-and-drain pass; the summary holds the deltas.
    ///
    /// # Errors
    /// Returns an error when the server is unreachable for the scan.
    pub fn sync_once(&self, timeout: Duration) -> color_eyre::Result<SyncSummary> {
        let before = self.stats();
        self.scanner
            .run_once()
            .map_err(|e| color_eyre::eyre::eyre!("scan failed: {e}"))?;
        if !self.wait_idle(timeout) {
            warn!("sync pass did not drain before the timeout");
        }
        let after = self.stats();

        Ok(SyncSummary {
            uploaded: after.uploads_completed - before.uploads_completed,
            downloaded: after.downloads_completed - before.downloads_completed,
            deleted: after.deletes_completed - before.deletes_completed,
            conflicts: after.conflicts_detected - before.conflicts_detected,
            cancelled: after.transfers_cancelled - before.transfers_cancelled,
            failures: after.failures - before.failures,
        })
    }

    /// Graceful shutdown: producers first, then the coordinator (which
    /// cancels in-flight transfers), then the pool.
    pub fn stop(mut self) {
        info!("sync agent stopping");
        self.stop.store(true, Ordering::SeqCst);

        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(listener) = self.listener.take() {
            listener.stop();
        }
        if let Some(handle) = self.scan_loop.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.coordinator.take() {
            let _ = handle.join();
        }
        self.pool.stop();
        self.queue.close();
        info!("sync agent stopped");
    }
}
