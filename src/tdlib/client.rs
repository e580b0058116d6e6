/// TDLib client transport.
///
/// Wraps a raw `TdBackend` with request/response correlation and an
/// update stream. A background poll loop is the only reader of the
/// backend: it resolves pending requests by their `@extra` token and
/// routes everything else to `receive()` callers or the update queue.
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::backend::TdBackend;
use super::wire;
use crate::config::TimeoutConfig;
use crate::error::TransportError;
use crate::session::SessionState;

/// Timing knobs of the transport.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub max_batch: usize,
    pub destroy_drain: Duration,
}

impl From<&TimeoutConfig> for TransportSettings {
    fn from(t: &TimeoutConfig) -> Self {
        Self {
            request_timeout: t.request(),
            poll_interval: t.receive_poll().max(Duration::from_millis(1)),
            max_batch: t.max_batch.max(1),
            destroy_drain: t.destroy_drain(),
        }
    }
}

type Reply = Result<Value, TransportError>;

/// Unclaimed updates plus the callers waiting for the next one.
#[derive(Default)]
struct UpdateQueue {
    queued: VecDeque<Value>,
    waiters: VecDeque<oneshot::Sender<Option<Value>>>,
}

impl UpdateQueue {
    /// Hands the update to the oldest live waiter, or queues it.
    fn deliver(&mut self, mut update: Value) {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(Some(update)) {
                Ok(()) => return,
                // The waiter timed out; try the next one
                Err(Some(returned)) => update = returned,
                Err(None) => return,
            }
        }
        self.queued.push_back(update);
    }
}

/// State shared with the poll loop.
struct Shared {
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    updates: Mutex<UpdateQueue>,
    /// Set once `authorizationStateClosed` is observed
    closed: watch::Sender<bool>,
}

impl Shared {
    fn route(&self, raw: &str, client_id: i32) {
        let mut message: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!("Skipping malformed TDLib message: {e}");
                return;
            }
        };

        if let Some(owner) = wire::strip_routing(&mut message) {
            if owner != i64::from(client_id) {
                debug!("Dropping message for stale client {owner}");
                return;
            }
        }

        if let Some(token) = wire::extract_extra(&message) {
            let continuation = self.pending.lock().remove(&token);
            if let Some(tx) = continuation {
                trace!("TDLib response for @extra={token}");
                let reply = match wire::parse_error(&message) {
                    Some(e) => Err(TransportError::Td(e)),
                    None => Ok(message),
                };
                let _ = tx.send(reply);
                return;
            }
            debug!("No pending request for @extra={token}, routing as update");
        }

        if wire::is_closed_update(&message) {
            self.closed.send_replace(true);
        }

        trace!("TDLib update: {}", wire::type_of(&message).unwrap_or("?"));
        self.updates.lock().deliver(message);
    }

    /// Rejects every pending request and releases every waiter.
    fn teardown(&self) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(TransportError::Closed));
        }

        let mut updates = self.updates.lock();
        for waiter in updates.waiters.drain(..) {
            let _ = waiter.send(None);
        }
        updates.queued.clear();
    }
}

pub struct TdTransport {
    backend: Arc<dyn TdBackend>,
    session: Arc<SessionState>,
    settings: TransportSettings,
    shared: Arc<Shared>,
    next_token: AtomicU64,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes create/destroy
    lifecycle: tokio::sync::Mutex<()>,
}

impl TdTransport {
    pub fn new(
        backend: Arc<dyn TdBackend>,
        session: Arc<SessionState>,
        settings: TransportSettings,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            backend,
            session,
            settings,
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                updates: Mutex::new(UpdateQueue::default()),
                closed,
            }),
            next_token: AtomicU64::new(1),
            poll_task: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Whether the native library loaded.
    pub fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    pub fn has_client(&self) -> bool {
        self.session.has_client()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Creates the session's client and starts the poll loop.
    pub async fn create_client(&self, data_dir: &Path) -> Result<i32, TransportError> {
        let _lifecycle = self.lifecycle.lock().await;

        if !self.backend.is_available() {
            return Err(TransportError::Unavailable);
        }
        if let Some(existing) = self.session.client() {
            return Err(TransportError::AlreadyExists(existing));
        }

        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| TransportError::Io(format!("create {}: {e}", data_dir.display())))?;

        let client_id = self.backend.create_client_id().await?;
        self.session
            .attach_client(client_id)
            .map_err(TransportError::AlreadyExists)?;
        self.shared.closed.send_replace(false);

        let handle = tokio::spawn(Self::poll_loop(
            self.backend.clone(),
            self.shared.clone(),
            client_id,
            self.settings.poll_interval,
            self.settings.max_batch,
        ));
        if let Some(old) = self.poll_task.lock().replace(handle) {
            old.abort();
        }

        info!("TDLib client {client_id} created ({})", data_dir.display());
        Ok(client_id)
    }

    /// Drains the backend on a fixed interval, a bounded batch per tick.
    async fn poll_loop(
        backend: Arc<dyn TdBackend>,
        shared: Arc<Shared>,
        client_id: i32,
        interval: Duration,
        max_batch: usize,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for _ in 0..max_batch {
                match backend.receive(Duration::ZERO).await {
                    Some(raw) => shared.route(&raw, client_id),
                    None => break,
                }
            }
        }
    }

    /// Sends a request and waits for its correlated response.
    pub async fn send(&self, mut request: Value) -> Result<Value, TransportError> {
        let client_id = self.session.client().ok_or(TransportError::Unavailable)?;
        let request_type = wire::type_of(&request).unwrap_or("request").to_string();

        let token = self.next_token.fetch_add(1, Ordering::SeqCst).to_string();
        wire::inject_extra(&mut request, &token);

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(token.clone(), tx);

        debug!("TDLib send {request_type} (@extra={token})");
        if let Err(e) = self.backend.send(client_id, &request.to_string()).await {
            self.shared.pending.lock().remove(&token);
            return Err(e);
        }

        match tokio::time::timeout(self.settings.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.shared.pending.lock().remove(&token);
                warn!("TDLib request {request_type} timed out");
                Err(TransportError::Timeout {
                    request: request_type,
                    after: self.settings.request_timeout,
                })
            }
        }
    }

    /// Next unsolicited update, or `None` if none arrives within `timeout`.
    pub async fn receive(&self, timeout: Duration) -> Option<Value> {
        let rx = {
            let mut updates = self.shared.updates.lock();
            if let Some(update) = updates.queued.pop_front() {
                return Some(update);
            }
            updates.waiters.retain(|w| !w.is_closed());
            let (tx, rx) = oneshot::channel();
            updates.waiters.push_back(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(update)) => update,
            _ => None,
        }
    }

    /// Closes the client, waits briefly for TDLib to confirm, then
    /// rejects everything still pending. Safe to call repeatedly.
    pub async fn destroy(&self) -> Result<(), TransportError> {
        let _lifecycle = self.lifecycle.lock().await;

        let Some(client_id) = self.session.client() else {
            return Ok(());
        };
        info!("Destroying TDLib client {client_id}");

        let close = wire::close().to_string();
        match self.backend.send(client_id, &close).await {
            Ok(()) => {
                let mut closed = self.shared.closed.subscribe();
                let confirmed = matches!(
                    tokio::time::timeout(self.settings.destroy_drain, closed.wait_for(|c| *c)).await,
                    Ok(Ok(_))
                );
                if !confirmed {
                    warn!(
                        "TDLib client {client_id} did not confirm close within {}ms",
                        self.settings.destroy_drain.as_millis()
                    );
                }
            }
            Err(e) => warn!("Failed to send close to client {client_id}: {e}"),
        }

        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }
        self.shared.teardown();
        self.session.detach_client();
        self.session.set_connecting(false);
        Ok(())
    }
}

impl Drop for TdTransport {
    fn drop(&mut self) {
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }
    }
}
