//! Worker pool
//!
//! A fixed number of worker threads drain a task channel; each slot runs one
//! transfer at a time. Local-I/O failures (file locked, transient
//! permission) get a small bounded number of whole-task retries; everything
//! else settles immediately through the completion callback.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use esync_core::chunker::ChunkConfig;
use esync_core::error::SyncError;
use esync_core::path::RelativePath;
use esync_remote::api::RemoteApi;

use crate::events::SyncEvent;
use crate::retry::{sleep_cancellable, RetryPolicy};
use crate::state::LocalState;
use crate::status::Notifier;
use crate::transfer::{CancelFlag, TransferKind};
use crate::workers::{self, ProgressFn, WorkerContext, WorkerOutcome};

/// Whole-task retries for local-I/O failures before parking
const LOCAL_IO_ATTEMPTS: u32 = 3;
const LOCAL_IO_DELAY: Duration = Duration::from_millis(500);

/// Shared resources handed to every worker
pub struct PoolContext {
    pub remote: Arc<dyn RemoteApi>,
    pub state: Arc<LocalState>,
    pub root: PathBuf,
    pub key: [u8; 32],
    pub cdc: ChunkConfig,
    pub retry: RetryPolicy,
    pub machine: String,
    pub notifier: Arc<dyn Notifier>,
    pub progress: Option<ProgressFn>,
}

/// One unit of work for a worker slot
pub struct PoolTask {
    pub event: SyncEvent,
    pub kind: TransferKind,
    pub cancel: CancelFlag,
}

/// Called on the worker thread when a task reaches a terminal outcome
pub type SettledFn = Arc<dyn Fn(RelativePath, TransferKind, WorkerOutcome) + Send + Sync>;

enum Msg {
    Task(PoolTask),
    Shutdown,
}

/// Fixed-size pool of transfer workers
pub struct WorkerPool {
    tx: Sender<Msg>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Start `worker_count` threads.
    #[must_use]
    pub fn start(context: PoolContext, worker_count: usize, on_settled: SettledFn) -> Self {
        let (tx, rx) = mpsc::channel::<Msg>();
        let rx = Arc::new(Mutex::new(rx));
        let context = Arc::new(context);
        let active = Arc::new(AtomicUsize::new(0));

        let handles = (0..worker_count.max(1))
            .map(|i| {
                let rx = Arc::clone(&rx);
                let context = Arc::clone(&context);
                let on_settled = Arc::clone(&on_settled);
                let active = Arc::clone(&active);
                std::thread::Builder::new()
                    .name(format!("esync-worker-{i}"))
                    .spawn(move || worker_loop(&rx, &context, &on_settled, &active))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            tx,
            handles: Mutex::new(handles),
            active,
        }
    }

    /// Hand a task to the pool
    pub fn submit(&self, task: PoolTask) {
        if self.tx.send(Msg::Task(task)).is_err() {
            warn!("worker pool is shut down, dropping task");
        }
    }

    /// Tasks currently executing
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop all workers after they finish their current task
    pub fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for _ in &handles {
            let _ = self.tx.send(Msg::Shutdown);
        }
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    rx: &Mutex<Receiver<Msg>>,
    context: &PoolContext,
    on_settled: &SettledFn,
    active: &AtomicUsize,
) {
    loop {
        let msg = {
            let guard = rx.lock().unwrap();
            guard.recv()
        };
        match msg {
            Ok(Msg::Task(task)) => {
                active.fetch_add(1, Ordering::SeqCst);
                let path = task.event.path.clone();
                let kind = task.kind;
                let outcome = execute(context, &task);
                active.fetch_sub(1, Ordering::SeqCst);
                on_settled(path, kind, outcome);
            }
            Ok(Msg::Shutdown) | Err(_) => break,
        }
    }
}

/// Run the worker, retrying local-I/O failures a bounded number of times
fn execute(context: &PoolContext, task: &PoolTask) -> WorkerOutcome {
    let ctx = WorkerContext {
        remote: context.remote.as_ref(),
        state: &context.state,
        root: &context.root,
        key: &context.key,
        cdc: context.cdc,
        retry: context.retry,
        cancel: task.cancel.clone(),
        machine: &context.machine,
        notifier: context.notifier.as_ref(),
        progress: context.progress.clone(),
    };

    let mut attempt = 0u32;
    loop {
        let outcome = workers::run(task.kind, &task.event, &ctx);

        match &outcome {
            WorkerOutcome::Failed {
                error: SyncError::LocalIo(message),
                retryable: true,
            } if attempt + 1 < LOCAL_IO_ATTEMPTS && !task.cancel.is_set() => {
                attempt += 1;
                debug!(path = %task.event.path, attempt, message = %message, "local i/o failure, retrying task");
                if !sleep_cancellable(LOCAL_IO_DELAY, &task.cancel) {
                    return WorkerOutcome::Cancelled;
                }
            }
            _ => return outcome,
        }
    }
}
