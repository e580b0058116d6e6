//! Error types for the TDLib transport and the login flow.

use std::time::Duration;

use thiserror::Error;

use crate::retry::Recovery;
use crate::session::AuthPhase;
use crate::tdlib::wire::{TdError, TdErrorKind};

/// Errors raised by the TDLib transport.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// The native backend is not loaded.
    #[error("TDLib is not available")]
    Unavailable,

    /// A client handle already exists for this session.
    #[error("TDLib client {0} already exists for this session")]
    AlreadyExists(i32),

    /// No response arrived within the request budget.
    #[error("Request {request} timed out after {}ms", .after.as_millis())]
    Timeout { request: String, after: Duration },

    /// The client was destroyed while the request was pending.
    #[error("TDLib client closed")]
    Closed,

    /// TDLib answered with an `error` object.
    #[error("TDLib error {}: {}", .0.code, .0.message)]
    Td(TdError),

    /// The backend failed to deliver the request.
    #[error("Transport I/O error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn td_kind(&self) -> Option<TdErrorKind> {
        match self {
            TransportError::Td(e) => Some(e.kind()),
            _ => None,
        }
    }
}

/// Errors surfaced by the auth driver and the setup wizard.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Telegram is not available on this host")]
    Unavailable,

    #[error("A Telegram client already exists for this session")]
    AlreadyExists,

    #[error("Telegram client is not initialized")]
    NotInitialized,

    #[error("Telegram account is not signed in (current phase: {0})")]
    NotAuthorized(AuthPhase),

    #[error(
        "Timed out after {elapsed_ms}ms waiting for {} (current phase: {actual}, auth operation in progress: {operation_in_progress})",
        phase_list(.expected)
    )]
    Timeout {
        elapsed_ms: u64,
        expected: Vec<AuthPhase>,
        actual: AuthPhase,
        operation_in_progress: bool,
    },

    #[error("Another sign-in step is already in progress")]
    Busy,

    #[error("Connection to Telegram was closed")]
    ConnectionClosed,

    #[error("{message}")]
    InvalidInput { field: String, message: String },

    #[error("Invalid verification code")]
    InvalidCode,

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Telegram database is corrupted: {0}")]
    DatabaseCorruption(String),

    #[error("Too many attempts, please wait before trying again ({0})")]
    Flood(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Telegram error {code}: {message}")]
    Td { code: i64, message: String },

    #[error("Database maintenance failed: {0}")]
    Database(#[from] std::io::Error),
}

fn phase_list(phases: &[AuthPhase]) -> String {
    phases
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join("|")
}

impl AuthError {
    pub fn invalid_input(field: &str, message: impl Into<String>) -> Self {
        AuthError::InvalidInput {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// What the driver may do about this error before surfacing it.
    pub fn recovery(&self) -> Recovery {
        match self {
            AuthError::Timeout { .. } | AuthError::Network(_) => Recovery::Retry,
            AuthError::DatabaseCorruption(_) => Recovery::ResetDatabase,
            _ => Recovery::None,
        }
    }
}

impl From<TransportError> for AuthError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unavailable => AuthError::Unavailable,
            TransportError::AlreadyExists(_) => AuthError::AlreadyExists,
            TransportError::Closed => AuthError::ConnectionClosed,
            TransportError::Timeout { request, after } => {
                AuthError::Network(format!("{request} got no response within {}ms", after.as_millis()))
            }
            TransportError::Io(msg) => AuthError::Network(msg),
            TransportError::Td(td) => match td.kind() {
                TdErrorKind::InvalidPhone => {
                    AuthError::invalid_input("phone", format!("Telegram rejected the phone number ({})", td.message))
                }
                TdErrorKind::InvalidCode => AuthError::InvalidCode,
                TdErrorKind::InvalidPassword => AuthError::InvalidPassword,
                TdErrorKind::Flood => AuthError::Flood(td.message),
                TdErrorKind::Database => AuthError::DatabaseCorruption(td.message),
                TdErrorKind::Network => AuthError::Network(td.message),
                TdErrorKind::Aborted => AuthError::ConnectionClosed,
                TdErrorKind::Other => AuthError::Td {
                    code: td.code,
                    message: td.message,
                },
            },
        }
    }
}
