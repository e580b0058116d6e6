//! Update dispatcher.
//!
//! Turns unsolicited TDLib updates into `SessionState` changes. This is
//! the only component that advances the authorization phase; the driver
//! just observes it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::{AuthPhase, SessionState};
use crate::tdlib::client::TdTransport;
use crate::tdlib::wire;

type Handler = fn(&SessionState, &Value);

pub struct UpdateDispatcher {
    session: Arc<SessionState>,
    handlers: HashMap<&'static str, Handler>,
}

impl UpdateDispatcher {
    pub fn new(session: Arc<SessionState>) -> Self {
        let mut handlers: HashMap<&'static str, Handler> = HashMap::new();
        handlers.insert("updateAuthorizationState", on_authorization_state);
        handlers.insert("updateConnectionState", on_connection_state);
        handlers.insert("error", on_error);
        Self { session, handlers }
    }

    /// Applies one update. Returns false for update types nobody handles,
    /// which are ignored.
    pub fn dispatch(&self, update: &Value) -> bool {
        let Some(update_type) = wire::type_of(update) else {
            return false;
        };
        match self.handlers.get(update_type) {
            Some(handler) => {
                handler(&self.session, update);
                true
            }
            None => false,
        }
    }

    /// Runs the dispatcher on a background task, pulling updates from
    /// `transport` until the task is aborted.
    pub fn spawn(self, transport: Arc<TdTransport>, wait: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("Update dispatcher started");
            loop {
                if let Some(update) = transport.receive(wait).await {
                    self.dispatch(&update);
                }
            }
        })
    }
}

// ── Handlers ─────────────────────────────────────────────

fn on_authorization_state(session: &SessionState, update: &Value) {
    let Some(state) = update.get("authorization_state") else {
        warn!("updateAuthorizationState without a state");
        return;
    };
    let parsed = wire::parse_authorization_state(state);

    // A close confirmation can reach us after the transport already
    // released the client; it must not clobber the next login
    if parsed.phase == AuthPhase::Closed && !session.has_client() {
        debug!("Ignoring close of a released client");
        return;
    }

    match parsed.phase {
        AuthPhase::WaitCode => session.set_code_info(parsed.code_info),
        AuthPhase::WaitPassword => session.set_password_hint(parsed.password_hint),
        AuthPhase::Ready => {
            session.clear_last_error();
            info!("Telegram authorization complete");
        }
        AuthPhase::Closed => warn!("TDLib client closed"),
        AuthPhase::Unknown => debug!(
            "Unhandled authorization state {}",
            wire::type_of(state).unwrap_or("?")
        ),
        _ => {}
    }

    // Phase last, so anyone woken by the change sees the hint/code info
    session.set_auth_phase(parsed.phase);
}

fn on_connection_state(session: &SessionState, update: &Value) {
    let Some(state) = update.pointer("/state/@type").and_then(Value::as_str) else {
        return;
    };
    let name = state.strip_prefix("connectionState").unwrap_or(state);
    let mut chars = name.chars();
    let normalized: String = match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    };
    debug!("Connection state: {normalized}");
    session.set_connection_state(normalized);
}

fn on_error(session: &SessionState, update: &Value) {
    if let Some(e) = wire::parse_error(update) {
        warn!("TDLib error {}: {}", e.code, e.message);
        session.set_last_error(format!("{}: {}", e.code, e.message));
    }
}
