/// Raw TDLib JSON backends.
///
/// `TdBackend` mirrors TDLib's JSON interface: client ids are allocated
/// locally, requests are fire-and-forget strings, and everything TDLib
/// emits (responses and updates for every client) comes out of a single
/// `receive` call. Demultiplexing is the transport's job.
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::TransportError;

#[async_trait]
pub trait TdBackend: Send + Sync {
    /// Whether the native side loaded. Never fails.
    fn is_available(&self) -> bool;

    /// Allocates a new client id. TDLib creates the client on the first
    /// request sent to it.
    async fn create_client_id(&self) -> Result<i32, TransportError>;

    /// Sends a serialized request to `client_id`.
    async fn send(&self, client_id: i32, request: &str) -> Result<(), TransportError>;

    /// Returns the next raw message, or `None` if nothing arrives within
    /// `timeout`. A zero timeout only returns what is already buffered.
    async fn receive(&self, timeout: Duration) -> Option<String>;
}

// ── Process backend ──────────────────────────────────────

/// Talks to a helper executable linked against libtdjson.
///
/// Each stdin line is a request object with `@client_id` added; each
/// stdout line is one message from `td_receive`, with its `@client_id`.
pub struct ProcessBackend {
    path: PathBuf,
    stdin: Mutex<Option<ChildStdin>>,
    lines: Mutex<mpsc::UnboundedReceiver<String>>,
    child: Option<Child>,
    /// Cleared once the helper's output ends
    alive: Arc<AtomicBool>,
    next_client_id: AtomicI32,
}

impl ProcessBackend {
    /// Spawns the helper. A helper that cannot be started leaves the
    /// backend unavailable instead of failing.
    pub fn launch(path: &Path, args: &[String]) -> Self {
        let (line_tx, line_rx) = mpsc::unbounded_channel();

        let spawned = Command::new(path)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!("TDLib helper {} could not be started: {e}", path.display());
                return Self::unavailable(path, line_rx);
            }
        };

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                error!("TDLib helper {} has no stdio pipes", path.display());
                return Self::unavailable(path, line_rx);
            }
        };

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[tdjson] {line}");
                }
            });
        }

        let alive = Arc::new(AtomicBool::new(true));
        let reader_alive = alive.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if line_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        warn!("TDLib helper closed its output");
                        break;
                    }
                    Err(e) => {
                        error!("TDLib helper read error: {e}");
                        break;
                    }
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
        });

        info!("TDLib helper started: {}", path.display());

        Self {
            path: path.to_path_buf(),
            stdin: Mutex::new(Some(stdin)),
            lines: Mutex::new(line_rx),
            child: Some(child),
            alive,
            next_client_id: AtomicI32::new(1),
        }
    }

    fn unavailable(path: &Path, line_rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            stdin: Mutex::new(None),
            lines: Mutex::new(line_rx),
            child: None,
            alive: Arc::new(AtomicBool::new(false)),
            next_client_id: AtomicI32::new(1),
        }
    }
}

#[async_trait]
impl TdBackend for ProcessBackend {
    fn is_available(&self) -> bool {
        self.child.is_some() && self.alive.load(Ordering::SeqCst)
    }

    async fn create_client_id(&self) -> Result<i32, TransportError> {
        if !self.is_available() {
            return Err(TransportError::Unavailable);
        }
        Ok(self.next_client_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn send(&self, client_id: i32, request: &str) -> Result<(), TransportError> {
        let value: serde_json::Value =
            serde_json::from_str(request).map_err(|e| TransportError::Io(format!("bad request JSON: {e}")))?;
        let mut line = super::wire::with_client_id(&value, client_id).to_string();
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(TransportError::Unavailable)?;
        let written = match pipe.write_all(line.as_bytes()).await {
            Ok(()) => pipe.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            // The helper is gone; later sends fail fast
            *stdin = None;
            self.alive.store(false, Ordering::SeqCst);
            return Err(TransportError::Io(format!(
                "write to {}: {e}",
                self.path.display()
            )));
        }
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Option<String> {
        let mut lines = self.lines.lock().await;
        if timeout.is_zero() {
            return lines.try_recv().ok();
        }
        tokio::time::timeout(timeout, lines.recv()).await.ok().flatten()
    }
}
