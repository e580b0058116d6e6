//! In-memory TDLib backend.
//!
//! Records every request and lets the caller inject messages as if TDLib
//! had emitted them. An optional responder produces replies for each
//! request, which is enough to script a whole login flow.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use super::backend::TdBackend;
use super::wire;
use crate::error::TransportError;

/// Builds replies for a request. The request still carries `@extra`.
pub type Responder = Box<dyn FnMut(&Value) -> Vec<Value> + Send>;

pub struct MockBackend {
    available: bool,
    next_client_id: AtomicI32,
    incoming: Mutex<VecDeque<String>>,
    sent: Mutex<Vec<(i32, Value)>>,
    responder: Mutex<Option<Responder>>,
    arrived: Notify,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_availability(true))
    }

    /// A backend whose native library "failed to load".
    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self::with_availability(false))
    }

    fn with_availability(available: bool) -> Self {
        Self {
            available,
            next_client_id: AtomicI32::new(1),
            incoming: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            arrived: Notify::new(),
        }
    }

    /// Installs a responder called for every request sent.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: FnMut(&Value) -> Vec<Value> + Send + 'static,
    {
        *self.responder.lock() = Some(Box::new(responder));
    }

    /// Queues a message as if TDLib emitted it for `client_id`.
    pub fn push(&self, client_id: i32, message: Value) {
        let line = wire::with_client_id(&message, client_id).to_string();
        self.push_raw(line);
    }

    /// Queues a raw line, valid JSON or not.
    pub fn push_raw(&self, line: impl Into<String>) {
        self.incoming.lock().push_back(line.into());
        self.arrived.notify_one();
    }

    /// Every request sent so far, in order.
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().iter().map(|(_, v)| v.clone()).collect()
    }

    /// Sent requests of the given `@type`.
    pub fn sent_of_type(&self, request_type: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|v| wire::type_of(v) == Some(request_type))
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl TdBackend for MockBackend {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn create_client_id(&self) -> Result<i32, TransportError> {
        if !self.available {
            return Err(TransportError::Unavailable);
        }
        Ok(self.next_client_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn send(&self, client_id: i32, request: &str) -> Result<(), TransportError> {
        if !self.available {
            return Err(TransportError::Unavailable);
        }
        let value: Value = serde_json::from_str(request)
            .map_err(|e| TransportError::Io(format!("bad request JSON: {e}")))?;
        self.sent.lock().push((client_id, value.clone()));

        let replies = match self.responder.lock().as_mut() {
            Some(responder) => responder(&value),
            None => Vec::new(),
        };
        for reply in replies {
            self.push(client_id, reply);
        }
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Option<String> {
        if let Some(line) = self.incoming.lock().pop_front() {
            return Some(line);
        }
        if timeout.is_zero() {
            return None;
        }
        let _ = tokio::time::timeout(timeout, self.arrived.notified()).await;
        self.incoming.lock().pop_front()
    }
}
