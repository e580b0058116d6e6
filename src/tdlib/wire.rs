/// TDLib JSON building and parsing.
/// Every object carries a `@type` discriminator; requests may carry an
/// `@extra` correlation token that TDLib echoes back on the response, and
/// everything TDLib emits carries the `@client_id` it belongs to.
use serde_json::{json, Map, Value};

use crate::config::TelegramConfig;
use crate::session::AuthPhase;

pub const TYPE: &str = "@type";
pub const EXTRA: &str = "@extra";
pub const CLIENT_ID: &str = "@client_id";

// ── Routing fields ───────────────────────────────────────

/// Returns the `@type` of a TDLib object.
pub fn type_of(object: &Value) -> Option<&str> {
    object.get(TYPE).and_then(Value::as_str)
}

/// Writes the correlation token into an outgoing request.
/// Non-object requests are wrapped so the token always has somewhere to go.
pub fn inject_extra(request: &mut Value, token: &str) {
    if !request.is_object() {
        let inner = request.take();
        *request = json!({ "value": inner });
    }
    if let Some(map) = request.as_object_mut() {
        map.insert(EXTRA.to_string(), Value::String(token.to_string()));
    }
}

/// Reads the correlation token back. TDLib echoes `@extra` verbatim, so a
/// numeric token sent by another client is accepted as well.
pub fn extract_extra(object: &Value) -> Option<String> {
    match object.get(EXTRA)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Removes the `@client_id` routing field and returns it.
pub fn strip_routing(object: &mut Value) -> Option<i64> {
    object
        .as_object_mut()
        .and_then(|map| map.remove(CLIENT_ID))
        .and_then(|v| v.as_i64())
}

/// Adds `@client_id` to an outgoing line for multiplexing backends.
pub fn with_client_id(request: &Value, client_id: i32) -> Value {
    let mut map = match request {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };
    map.insert(CLIENT_ID.to_string(), json!(client_id));
    Value::Object(map)
}

// ── Requests ─────────────────────────────────────────────

pub fn get_option(name: &str) -> Value {
    json!({ "@type": "getOption", "name": name })
}

pub fn set_tdlib_parameters(config: &TelegramConfig) -> Value {
    json!({
        "@type": "setTdlibParameters",
        "use_test_dc": config.use_test_dc,
        "database_directory": config.database_dir().to_string_lossy(),
        "files_directory": config.files_dir().to_string_lossy(),
        "database_encryption_key": "",
        "use_file_database": false,
        "use_chat_info_database": true,
        "use_message_database": true,
        "use_secret_chats": false,
        "api_id": config.api_id,
        "api_hash": config.api_hash,
        "system_language_code": config.system_language_code,
        "device_model": config.device_model,
        "system_version": std::env::consts::OS,
        "application_version": config.application_version,
    })
}

pub fn set_authentication_phone_number(phone: &str) -> Value {
    json!({
        "@type": "setAuthenticationPhoneNumber",
        "phone_number": phone,
        "settings": {
            "@type": "phoneNumberAuthenticationSettings",
            "allow_flash_call": false,
            "allow_missed_call": false,
            "is_current_phone_number": false,
            "allow_sms_retriever_api": false,
        }
    })
}

pub fn check_authentication_code(code: &str) -> Value {
    json!({ "@type": "checkAuthenticationCode", "code": code })
}

pub fn check_authentication_password(password: &str) -> Value {
    json!({ "@type": "checkAuthenticationPassword", "password": password })
}

pub fn resend_authentication_code() -> Value {
    json!({ "@type": "resendAuthenticationCode" })
}

pub fn get_me() -> Value {
    json!({ "@type": "getMe" })
}

pub fn close() -> Value {
    json!({ "@type": "close" })
}

// ── Authorization states ─────────────────────────────────

/// How the login code was delivered, from `authorizationStateWaitCode`.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeInfo {
    pub phone_number: String,
    /// e.g. `authenticationCodeTypeSms`, `authenticationCodeTypeTelegramMessage`
    pub delivery: String,
    pub length: Option<u64>,
}

impl CodeInfo {
    /// Human-readable delivery channel for the code step.
    pub fn delivery_description(&self) -> &'static str {
        match self.delivery.as_str() {
            "authenticationCodeTypeTelegramMessage" => "in the Telegram app",
            "authenticationCodeTypeSms" | "authenticationCodeTypeSmsWord"
            | "authenticationCodeTypeSmsPhrase" => "by SMS",
            "authenticationCodeTypeCall" => "by phone call",
            "authenticationCodeTypeFlashCall" | "authenticationCodeTypeMissedCall" => {
                "by a call from Telegram"
            }
            "authenticationCodeTypeFragment" => "on fragment.com",
            _ => "by Telegram",
        }
    }
}

/// A parsed `authorizationState*` object.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationState {
    pub phase: AuthPhase,
    pub password_hint: Option<String>,
    pub code_info: Option<CodeInfo>,
}

/// Maps a TDLib authorization state type onto the login phases.
pub fn phase_from_state_type(state_type: &str) -> AuthPhase {
    match state_type {
        "authorizationStateWaitTdlibParameters" => AuthPhase::WaitParameters,
        "authorizationStateWaitPhoneNumber" => AuthPhase::WaitPhoneNumber,
        "authorizationStateWaitCode" => AuthPhase::WaitCode,
        "authorizationStateWaitPassword" => AuthPhase::WaitPassword,
        "authorizationStateReady" => AuthPhase::Ready,
        "authorizationStateClosing" | "authorizationStateLoggingOut" => AuthPhase::Closing,
        "authorizationStateClosed" => AuthPhase::Closed,
        _ => AuthPhase::Unknown,
    }
}

/// Parses the `authorization_state` object of an `updateAuthorizationState`.
pub fn parse_authorization_state(state: &Value) -> AuthorizationState {
    let phase = type_of(state)
        .map(phase_from_state_type)
        .unwrap_or(AuthPhase::Unknown);

    let password_hint = state
        .get("password_hint")
        .and_then(Value::as_str)
        .filter(|h| !h.is_empty())
        .map(String::from);

    let code_info = match phase {
        AuthPhase::WaitCode => state.get("code_info").map(|info| CodeInfo {
            phone_number: info
                .get("phone_number")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            delivery: info
                .pointer("/type/@type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            length: info.pointer("/type/length").and_then(Value::as_u64),
        }),
        _ => None,
    };

    AuthorizationState {
        phase,
        password_hint,
        code_info,
    }
}

/// True when `object` is an update announcing the closed state.
pub fn is_closed_update(object: &Value) -> bool {
    type_of(object) == Some("updateAuthorizationState")
        && object
            .get("authorization_state")
            .and_then(type_of)
            == Some("authorizationStateClosed")
}

// ── Errors ───────────────────────────────────────────────

/// A TDLib `error` object.
#[derive(Debug, Clone, PartialEq)]
pub struct TdError {
    pub code: i64,
    pub message: String,
}

/// What a TDLib error means for the login flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdErrorKind {
    InvalidPhone,
    InvalidCode,
    InvalidPassword,
    /// Rate limited (code 429 / FLOOD_WAIT)
    Flood,
    /// The local database cannot be opened or is inconsistent
    Database,
    /// Network-level failure or internal server error
    Network,
    /// The request was aborted because the client is closing
    Aborted,
    Other,
}

/// Reads an `error` object, if that's what `object` is.
pub fn parse_error(object: &Value) -> Option<TdError> {
    if type_of(object) != Some("error") {
        return None;
    }
    Some(TdError {
        code: object.get("code").and_then(Value::as_i64).unwrap_or(0),
        message: object
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

impl TdError {
    /// Classifies the error by code and by TDLib's upper-case identifiers.
    ///
    /// This is the only place in the crate that looks at error text.
    pub fn kind(&self) -> TdErrorKind {
        let msg = self.message.as_str();
        let identifier_is = |ids: &[&str]| ids.iter().any(|id| msg.contains(id));

        if self.code == 429 || msg.starts_with("Too Many Requests") || identifier_is(&["FLOOD_WAIT"]) {
            TdErrorKind::Flood
        } else if identifier_is(&[
            "PHONE_NUMBER_INVALID",
            "PHONE_NUMBER_BANNED",
            "PHONE_NUMBER_UNOCCUPIED",
        ]) {
            TdErrorKind::InvalidPhone
        } else if identifier_is(&["PHONE_CODE_INVALID", "PHONE_CODE_EMPTY", "PHONE_CODE_EXPIRED"]) {
            TdErrorKind::InvalidCode
        } else if identifier_is(&["PASSWORD_HASH_INVALID"]) {
            TdErrorKind::InvalidPassword
        } else if msg.starts_with("Can't open database")
            || msg.starts_with("Wrong database encryption key")
            || msg.starts_with("Database is broken")
        {
            TdErrorKind::Database
        } else if msg == "Request aborted" {
            TdErrorKind::Aborted
        } else if self.code >= 500 || self.code == -1 {
            TdErrorKind::Network
        } else {
            TdErrorKind::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Routing ─────────────────────────────────────────

    #[test]
    fn test_inject_and_extract_extra() {
        let mut req = get_me();
        inject_extra(&mut req, "42");
        assert_eq!(req["@extra"], "42");
        assert_eq!(req["@type"], "getMe");
        assert_eq!(extract_extra(&req).as_deref(), Some("42"));
    }

    #[test]
    fn test_extract_numeric_extra() {
        let msg = json!({"@type": "ok", "@extra": 7});
        assert_eq!(extract_extra(&msg).as_deref(), Some("7"));
    }

    #[test]
    fn test_extract_extra_missing() {
        assert_eq!(extract_extra(&json!({"@type": "ok"})), None);
        assert_eq!(extract_extra(&json!({"@type": "ok", "@extra": null})), None);
    }

    #[test]
    fn test_strip_routing_removes_client_id() {
        let mut msg = json!({"@type": "ok", "@client_id": 3, "@extra": "1"});
        assert_eq!(strip_routing(&mut msg), Some(3));
        assert!(msg.get("@client_id").is_none());
        assert_eq!(msg["@extra"], "1");
    }

    #[test]
    fn test_with_client_id_keeps_request() {
        let line = with_client_id(&close(), 9);
        assert_eq!(line["@client_id"], 9);
        assert_eq!(line["@type"], "close");
    }

    // ── Requests ────────────────────────────────────────

    #[test]
    fn test_set_tdlib_parameters_uses_config() {
        let mut config = TelegramConfig::with_data_dir("/tmp/tg");
        config.api_id = 123;
        config.api_hash = "abc".to_string();
        let req = set_tdlib_parameters(&config);
        assert_eq!(req["@type"], "setTdlibParameters");
        assert_eq!(req["api_id"], 123);
        assert_eq!(req["api_hash"], "abc");
        assert_eq!(req["database_directory"], "/tmp/tg/db");
        assert_eq!(req["files_directory"], "/tmp/tg/files");
    }

    #[test]
    fn test_phone_number_request() {
        let req = set_authentication_phone_number("+15551234567");
        assert_eq!(req["@type"], "setAuthenticationPhoneNumber");
        assert_eq!(req["phone_number"], "+15551234567");
        assert_eq!(req["settings"]["@type"], "phoneNumberAuthenticationSettings");
    }

    // ── Authorization states ────────────────────────────

    #[test]
    fn test_phase_mapping() {
        assert_eq!(
            phase_from_state_type("authorizationStateWaitTdlibParameters"),
            AuthPhase::WaitParameters
        );
        assert_eq!(
            phase_from_state_type("authorizationStateWaitPhoneNumber"),
            AuthPhase::WaitPhoneNumber
        );
        assert_eq!(phase_from_state_type("authorizationStateReady"), AuthPhase::Ready);
        assert_eq!(phase_from_state_type("authorizationStateLoggingOut"), AuthPhase::Closing);
        assert_eq!(phase_from_state_type("authorizationStateClosed"), AuthPhase::Closed);
        assert_eq!(
            phase_from_state_type("authorizationStateWaitEmailAddress"),
            AuthPhase::Unknown
        );
    }

    #[test]
    fn test_parse_wait_password_with_hint() {
        let state = json!({
            "@type": "authorizationStateWaitPassword",
            "password_hint": "pet name",
            "has_recovery_email_address": false
        });
        let parsed = parse_authorization_state(&state);
        assert_eq!(parsed.phase, AuthPhase::WaitPassword);
        assert_eq!(parsed.password_hint.as_deref(), Some("pet name"));
    }

    #[test]
    fn test_parse_empty_hint_is_none() {
        let state = json!({"@type": "authorizationStateWaitPassword", "password_hint": ""});
        assert_eq!(parse_authorization_state(&state).password_hint, None);
    }

    #[test]
    fn test_parse_wait_code_info() {
        let state = json!({
            "@type": "authorizationStateWaitCode",
            "code_info": {
                "phone_number": "15551234567",
                "type": {"@type": "authenticationCodeTypeSms", "length": 5}
            }
        });
        let parsed = parse_authorization_state(&state);
        assert_eq!(parsed.phase, AuthPhase::WaitCode);
        let info = parsed.code_info.unwrap();
        assert_eq!(info.phone_number, "15551234567");
        assert_eq!(info.length, Some(5));
        assert_eq!(info.delivery_description(), "by SMS");
    }

    #[test]
    fn test_is_closed_update() {
        let closed = json!({
            "@type": "updateAuthorizationState",
            "authorization_state": {"@type": "authorizationStateClosed"}
        });
        let ready = json!({
            "@type": "updateAuthorizationState",
            "authorization_state": {"@type": "authorizationStateReady"}
        });
        assert!(is_closed_update(&closed));
        assert!(!is_closed_update(&ready));
        assert!(!is_closed_update(&json!({"@type": "ok"})));
    }

    // ── Errors ──────────────────────────────────────────

    fn err(code: i64, message: &str) -> TdError {
        TdError {
            code,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_parse_error_object() {
        let e = parse_error(&json!({"@type": "error", "code": 400, "message": "PHONE_CODE_INVALID"}))
            .unwrap();
        assert_eq!(e.code, 400);
        assert_eq!(e.kind(), TdErrorKind::InvalidCode);
        assert!(parse_error(&json!({"@type": "ok"})).is_none());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(err(400, "PHONE_NUMBER_INVALID").kind(), TdErrorKind::InvalidPhone);
        assert_eq!(err(400, "PASSWORD_HASH_INVALID").kind(), TdErrorKind::InvalidPassword);
        assert_eq!(err(429, "Too Many Requests: retry after 30").kind(), TdErrorKind::Flood);
        assert_eq!(err(400, "Can't open database: disk I/O").kind(), TdErrorKind::Database);
        assert_eq!(err(500, "Request aborted").kind(), TdErrorKind::Aborted);
        assert_eq!(err(500, "Internal server error").kind(), TdErrorKind::Network);
        assert_eq!(err(400, "Some other problem").kind(), TdErrorKind::Other);
    }

    #[test]
    fn test_unrelated_keyword_is_not_misclassified() {
        // Free text mentioning a keyword must not trigger database recovery
        assert_eq!(
            err(400, "Chat database entry not found").kind(),
            TdErrorKind::Other
        );
        assert_eq!(err(400, "connection to chat lost").kind(), TdErrorKind::Other);
    }
}
