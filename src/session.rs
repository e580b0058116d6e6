//! Shared session record.
//!
//! One `SessionState` exists per login attempt and is shared (via `Arc`)
//! between the transport, the update dispatcher and the auth driver.
//! The authorization phase is published on a `watch` channel so the
//! driver can await changes instead of sleeping in a loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::error::AuthError;
use crate::retry::RetryBudget;
use crate::tdlib::wire::CodeInfo;

/// Step of the login flow as last reported by TDLib.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthPhase {
    WaitParameters,
    WaitPhoneNumber,
    WaitCode,
    WaitPassword,
    Ready,
    /// Closing or logging out; the client is going away
    Closing,
    Closed,
    Unknown,
}

impl AuthPhase {
    /// Phases from which no login request can be issued.
    pub fn is_terminal_failure(self) -> bool {
        matches!(self, AuthPhase::Closing | AuthPhase::Closed | AuthPhase::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuthPhase::WaitParameters => "waitParameters",
            AuthPhase::WaitPhoneNumber => "waitPhoneNumber",
            AuthPhase::WaitCode => "waitCode",
            AuthPhase::WaitPassword => "waitPassword",
            AuthPhase::Ready => "ready",
            AuthPhase::Closing => "closing",
            AuthPhase::Closed => "closed",
            AuthPhase::Unknown => "unknown",
        }
    }
}

impl fmt::Display for AuthPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress indicator shown while a submit is waiting on Telegram.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub percent: u8,
    pub message: String,
}

/// Point-in-time copy of the session, for status output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub auth_phase: AuthPhase,
    pub password_hint: Option<String>,
    pub has_client: bool,
    pub connecting: bool,
    pub last_error: Option<String>,
    pub auth_operation_in_progress: bool,
    pub connection_state: Option<String>,
    pub progress: Option<Progress>,
}

#[derive(Debug, Default)]
struct Fields {
    password_hint: Option<String>,
    client: Option<i32>,
    connecting: bool,
    last_error: Option<String>,
    connection_state: Option<String>,
    code_info: Option<CodeInfo>,
    progress: Option<Progress>,
}

pub struct SessionState {
    phase: watch::Sender<AuthPhase>,
    fields: Mutex<Fields>,
    auth_operation_in_progress: AtomicBool,
    retries: Mutex<RetryBudget>,
}

impl SessionState {
    pub fn new(max_retries: u32) -> Self {
        let (phase, _) = watch::channel(AuthPhase::Unknown);
        Self {
            phase,
            fields: Mutex::new(Fields::default()),
            auth_operation_in_progress: AtomicBool::new(false),
            retries: Mutex::new(RetryBudget::new(max_retries)),
        }
    }

    // ── Authorization phase ──────────────────────────────

    pub fn auth_phase(&self) -> AuthPhase {
        *self.phase.borrow()
    }

    /// Receiver notified on every phase change.
    pub fn subscribe_phase(&self) -> watch::Receiver<AuthPhase> {
        self.phase.subscribe()
    }

    /// Records a phase reported by TDLib. Called by the update dispatcher
    /// and by reset logic only.
    pub(crate) fn set_auth_phase(&self, phase: AuthPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!("Auth phase: {previous} -> {phase}");
        }
    }

    pub fn password_hint(&self) -> Option<String> {
        self.fields.lock().password_hint.clone()
    }

    pub(crate) fn set_password_hint(&self, hint: Option<String>) {
        self.fields.lock().password_hint = hint;
    }

    pub fn code_info(&self) -> Option<CodeInfo> {
        self.fields.lock().code_info.clone()
    }

    pub(crate) fn set_code_info(&self, info: Option<CodeInfo>) {
        self.fields.lock().code_info = info;
    }

    // ── Client handle ────────────────────────────────────

    pub fn client(&self) -> Option<i32> {
        self.fields.lock().client
    }

    pub fn has_client(&self) -> bool {
        self.client().is_some()
    }

    /// Stores a new handle. Fails if one is already held.
    pub(crate) fn attach_client(&self, client_id: i32) -> Result<(), i32> {
        let mut fields = self.fields.lock();
        match fields.client {
            Some(existing) => Err(existing),
            None => {
                fields.client = Some(client_id);
                Ok(())
            }
        }
    }

    pub(crate) fn detach_client(&self) -> Option<i32> {
        self.fields.lock().client.take()
    }

    pub fn is_connecting(&self) -> bool {
        self.fields.lock().connecting
    }

    pub(crate) fn set_connecting(&self, connecting: bool) {
        self.fields.lock().connecting = connecting;
    }

    // ── Errors and connection ────────────────────────────

    pub fn last_error(&self) -> Option<String> {
        self.fields.lock().last_error.clone()
    }

    pub(crate) fn set_last_error(&self, error: impl Into<String>) {
        self.fields.lock().last_error = Some(error.into());
    }

    pub(crate) fn clear_last_error(&self) {
        self.fields.lock().last_error = None;
    }

    pub fn connection_state(&self) -> Option<String> {
        self.fields.lock().connection_state.clone()
    }

    pub(crate) fn set_connection_state(&self, state: String) {
        self.fields.lock().connection_state = Some(state);
    }

    pub fn progress(&self) -> Option<Progress> {
        self.fields.lock().progress.clone()
    }

    pub(crate) fn set_progress(&self, progress: Option<Progress>) {
        self.fields.lock().progress = progress;
    }

    // ── Auth operation lock ──────────────────────────────

    pub fn auth_operation_in_progress(&self) -> bool {
        self.auth_operation_in_progress.load(Ordering::SeqCst)
    }

    /// Takes the auth operation lock, or fails with `Busy` if another
    /// submit holds it. The lock is released when the guard drops.
    pub fn begin_auth_operation(&self) -> Result<AuthOperationGuard<'_>, AuthError> {
        self.auth_operation_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| AuthError::Busy)?;
        Ok(AuthOperationGuard { session: self })
    }

    // ── Retries ──────────────────────────────────────────

    /// Consumes one automatic retry; false once the budget is spent.
    pub(crate) fn try_consume_retry(&self) -> bool {
        self.retries.lock().try_consume()
    }

    pub(crate) fn clear_retries(&self) {
        self.retries.lock().clear();
    }

    pub fn retries_used(&self) -> u32 {
        self.retries.lock().used()
    }

    // ── Reset ────────────────────────────────────────────

    /// Forgets everything learned about the current login attempt.
    /// The handle itself is released by the transport.
    pub(crate) fn reset(&self) {
        self.reset_login();
        self.clear_retries();
    }

    /// Like `reset`, but keeps the retry budget. Used while recovering
    /// inside a submit, so a recovery cannot refill its own budget.
    pub(crate) fn reset_login(&self) {
        {
            let mut fields = self.fields.lock();
            fields.password_hint = None;
            fields.connecting = false;
            fields.last_error = None;
            fields.connection_state = None;
            fields.code_info = None;
            fields.progress = None;
        }
        self.set_auth_phase(AuthPhase::Unknown);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let fields = self.fields.lock();
        SessionSnapshot {
            auth_phase: self.auth_phase(),
            password_hint: fields.password_hint.clone(),
            has_client: fields.client.is_some(),
            connecting: fields.connecting,
            last_error: fields.last_error.clone(),
            auth_operation_in_progress: self.auth_operation_in_progress(),
            connection_state: fields.connection_state.clone(),
            progress: fields.progress.clone(),
        }
    }
}

/// Holds the auth operation lock; releasing it also clears progress.
pub struct AuthOperationGuard<'a> {
    session: &'a SessionState,
}

impl Drop for AuthOperationGuard<'_> {
    fn drop(&mut self) {
        self.session.set_progress(None);
        self.session
            .auth_operation_in_progress
            .store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_unknown() {
        let session = SessionState::new(1);
        assert_eq!(session.auth_phase(), AuthPhase::Unknown);
        assert!(!session.has_client());
        assert!(!session.auth_operation_in_progress());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let session = SessionState::new(1);
        {
            let _guard = session.begin_auth_operation().unwrap();
            assert!(session.auth_operation_in_progress());
            assert!(matches!(session.begin_auth_operation(), Err(AuthError::Busy)));
        }
        assert!(!session.auth_operation_in_progress());
        assert!(session.begin_auth_operation().is_ok());
    }

    #[test]
    fn test_guard_clears_progress() {
        let session = SessionState::new(1);
        {
            let _guard = session.begin_auth_operation().unwrap();
            session.set_progress(Some(Progress {
                percent: 40,
                message: "waiting".into(),
            }));
        }
        assert_eq!(session.progress(), None);
    }

    #[test]
    fn test_attach_client_twice_fails() {
        let session = SessionState::new(1);
        assert!(session.attach_client(1).is_ok());
        assert_eq!(session.attach_client(2), Err(1));
        assert_eq!(session.detach_client(), Some(1));
        assert!(session.attach_client(2).is_ok());
    }

    #[test]
    fn test_subscribers_see_phase_changes() {
        let session = SessionState::new(1);
        let rx = session.subscribe_phase();
        session.set_auth_phase(AuthPhase::WaitCode);
        assert_eq!(*rx.borrow(), AuthPhase::WaitCode);
    }

    #[test]
    fn test_reset_clears_login_state() {
        let session = SessionState::new(1);
        session.set_auth_phase(AuthPhase::WaitPassword);
        session.set_password_hint(Some("hint".into()));
        session.set_last_error("boom");
        assert!(session.try_consume_retry());

        session.reset();

        assert_eq!(session.auth_phase(), AuthPhase::Unknown);
        assert_eq!(session.password_hint(), None);
        assert_eq!(session.last_error(), None);
        assert_eq!(session.retries_used(), 0);
    }

    #[test]
    fn test_reset_login_keeps_retry_budget() {
        let session = SessionState::new(1);
        session.set_auth_phase(AuthPhase::WaitPhoneNumber);
        assert!(session.try_consume_retry());

        session.reset_login();

        assert_eq!(session.auth_phase(), AuthPhase::Unknown);
        assert_eq!(session.retries_used(), 1);
        assert!(!session.try_consume_retry());
    }

    #[test]
    fn test_terminal_failure_phases() {
        assert!(AuthPhase::Closed.is_terminal_failure());
        assert!(AuthPhase::Closing.is_terminal_failure());
        assert!(AuthPhase::Unknown.is_terminal_failure());
        assert!(!AuthPhase::WaitPhoneNumber.is_terminal_failure());
        assert!(!AuthPhase::Ready.is_terminal_failure());
    }
}
