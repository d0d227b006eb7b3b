//! Remote change listener (WebSocket push channel)
//!
//! Optional low-latency path: the server pushes `file_changed` frames which
//! become REMOTE_* events immediately instead of waiting for the next scan.
//! On every (re)connect a `changes-since` fetch recovers whatever was missed
//! while disconnected. Reconnects back off exponentially, 1..60 s.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info, warn};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use esync_core::path::RelativePath;

use crate::events::{EventKind, EventMeta, SyncEvent};
use crate::queue::EventQueue;
use crate::scanner::ChangeScanner;
use crate::state::LocalState;

/// Interval between client pings
const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Cap on the reconnect backoff
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Server -> client push frame
#[derive(Debug, Deserialize)]
struct PushFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    version: Option<u64>,
}

/// Derive the `/ws/changes` URL from the HTTP server URL
#[must_use]
pub fn ws_url(server_url: &str, auth_token: &str) -> String {
    let base = server_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base}")
    };
    format!("{ws_base}/ws/changes?token={}", urlencoding::encode(auth_token))
}

/// Background WebSocket listener
pub struct RemoteListener {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RemoteListener {
    /// Start the listener thread.
    #[must_use]
    pub fn spawn(
        url: String,
        queue: Arc<EventQueue>,
        state: Arc<LocalState>,
        scanner: Arc<ChangeScanner>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("esync-listener".to_string())
            .spawn(move || {
                let mut delay = Duration::from_secs(1);

                while !stop_flag.load(Ordering::SeqCst) {
                    match tungstenite::connect(url.as_str()) {
                        Ok((socket, _response)) => {
                            info!("push channel connected");
                            delay = Duration::from_secs(1);

                            // Recover anything missed while disconnected
                            if let Err(e) = scanner.run_once() {
                                debug!(error = %e, "catch-up scan after connect failed");
                            }

                            run_connection(socket, &queue, &state, &stop_flag);
                            if stop_flag.load(Ordering::SeqCst) {
                                break;
                            }
                            warn!("push channel disconnected, will reconnect");
                        }
                        Err(e) => {
                            debug!(error = %e, "push channel connect failed");
                        }
                    }

                    if !sleep_with_stop(delay, &stop_flag) {
                        break;
                    }
                    delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                }
            })
            .expect("failed to spawn listener thread");

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the listener thread
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_connection(
    mut socket: WebSocket<MaybeTlsStream<TcpStream>>,
    queue: &EventQueue,
    state: &LocalState,
    stop: &AtomicBool,
) {
    // Short read timeout so the loop can ping and observe shutdown
    if let MaybeTlsStream::Plain(stream) = socket.get_mut() {
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    }

    let mut last_ping = Instant::now();

    loop {
        if stop.load(Ordering::SeqCst) {
            let _ = socket.close(None);
            return;
        }

        match socket.read() {
            Ok(Message::Text(text)) => handle_frame(&text, queue, state),
            Ok(Message::Ping(payload)) => {
                let _ = socket.send(Message::Pong(payload));
            }
            Ok(Message::Close(_)) => return,
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                if last_ping.elapsed() >= PING_INTERVAL {
                    if socket
                        .send(Message::Text(r#"{"type":"ping"}"#.to_string()))
                        .is_err()
                    {
                        return;
                    }
                    last_ping = Instant::now();
                }
            }
            Err(e) => {
                debug!(error = %e, "push channel read error");
                return;
            }
        }
    }
}

fn handle_frame(text: &str, queue: &EventQueue, state: &LocalState) {
    let frame: PushFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "unparsable push frame");
            return;
        }
    };
    if frame.kind != "file_changed" {
        return;
    }
    let Some(raw_path) = frame.path else {
        return;
    };
    let Ok(path) = RelativePath::new(&raw_path) else {
        debug!(path = %raw_path, "unrepresentable path in push frame");
        return;
    };

    let kind = if state.get(&path).is_some() {
        EventKind::RemoteModified
    } else {
        EventKind::RemoteCreated
    };
    let meta = EventMeta {
        server_version: frame.version,
        ..EventMeta::default()
    };
    debug!(path = %path, ?kind, version = ?frame.version, "push event");
    queue.put(SyncEvent::with_meta(kind, path, meta));
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
    true
}
