//! Setup wizard: the host's step/field protocol on top of the login flow.
//!
//! The host renders one `SetupStep` at a time and posts back the values
//! the user entered. Every response says whether to show another step,
//! whether setup is complete, or which fields were rejected.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::AuthError;
use crate::host::{StateStore, KEY_PHONE_NUMBER, KEY_SETUP_COMPLETE};
use crate::session::AuthPhase;
use crate::telegram::TelegramSession;

pub const STEP_PHONE: &str = "phone";
pub const STEP_CODE: &str = "code";
pub const STEP_PASSWORD: &str = "password";

static PHONE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+[1-9]\d{6,14}$").expect("Invalid phone regex"));

// ── Protocol types ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    Text,
    Password,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupField {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupStep {
    pub id: String,
    pub title: String,
    pub description: String,
    pub fields: Vec<SetupField>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupSubmission {
    pub step_id: String,
    #[serde(default)]
    pub values: HashMap<String, Value>,
}

impl SetupSubmission {
    fn value(&self, field: &str) -> String {
        match self.values.get(field) {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SetupStatus {
    Next,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupResponse {
    pub status: SetupStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step: Option<SetupStep>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
}

impl SetupResponse {
    fn next(step: SetupStep) -> Self {
        Self {
            status: SetupStatus::Next,
            next_step: Some(step),
            errors: Vec::new(),
        }
    }

    fn complete() -> Self {
        Self {
            status: SetupStatus::Complete,
            next_step: None,
            errors: Vec::new(),
        }
    }

    fn error(field: &str, message: impl Into<String>) -> Self {
        Self {
            status: SetupStatus::Error,
            next_step: None,
            errors: vec![FieldError {
                field: field.to_string(),
                message: message.into(),
            }],
        }
    }
}

// ── Validation ───────────────────────────────────────────

/// Strips common separators and checks for an E.164 number.
pub fn normalize_phone(input: &str) -> Result<String, AuthError> {
    let phone: String = input
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();
    if phone.is_empty() {
        return Err(AuthError::invalid_input(STEP_PHONE, "Phone number is required"));
    }
    if !PHONE_REGEX.is_match(&phone) {
        return Err(AuthError::invalid_input(
            STEP_PHONE,
            "Enter the phone number in international format, e.g. +15551234567",
        ));
    }
    Ok(phone)
}

/// Which field an error belongs to, defaulting to the submitted step's.
fn field_for(err: &AuthError, step_field: &str) -> String {
    match err {
        AuthError::InvalidInput { field, .. } => field.clone(),
        AuthError::InvalidCode => STEP_CODE.to_string(),
        AuthError::InvalidPassword => STEP_PASSWORD.to_string(),
        _ => step_field.to_string(),
    }
}

fn error_response(err: &AuthError, step_field: &str) -> SetupResponse {
    SetupResponse::error(&field_for(err, step_field), err.to_string())
}

// ── Wizard ───────────────────────────────────────────────

pub struct SetupWizard {
    telegram: Arc<TelegramSession>,
    state: Arc<dyn StateStore>,
}

impl SetupWizard {
    pub fn new(telegram: Arc<TelegramSession>, state: Arc<dyn StateStore>) -> Self {
        Self { telegram, state }
    }

    /// First step to show. Connects if needed; connection failures are
    /// reported in the step description.
    pub async fn on_setup_start(&self) -> SetupStep {
        if let Err(e) = self.telegram.recover_if_needed().await {
            warn!("Session recovery failed: {e}");
        }

        let mut problem = None;
        if !self.telegram.session().has_client() {
            if let Err(e) = self.telegram.start().await {
                problem = Some(format!("Could not connect to Telegram: {e}"));
            }
        }

        let phase = self.telegram.session().auth_phase();
        info!("Setup started in phase {phase}");
        let mut step = self.step_for(phase);
        if let Some(problem) = problem {
            step.description = format!("{problem}\n\n{}", step.description);
        }
        step
    }

    pub async fn on_setup_submit(&self, submission: SetupSubmission) -> SetupResponse {
        match submission.step_id.as_str() {
            STEP_PHONE => self.submit_phone(&submission.value(STEP_PHONE)).await,
            STEP_CODE => self.submit_code(&submission.value(STEP_CODE)).await,
            STEP_PASSWORD => self.submit_password(&submission.value(STEP_PASSWORD)).await,
            other => SetupResponse::error("stepId", format!("Unknown setup step: {other}")),
        }
    }

    /// Abandons an unfinished login. A signed-in session is kept.
    pub async fn on_setup_cancel(&self) {
        let phase = self.telegram.session().auth_phase();
        if phase == AuthPhase::Ready {
            return;
        }
        info!("Setup cancelled in phase {phase}");
        if let Err(e) = self.telegram.disconnect().await {
            warn!("Disconnect after cancel failed: {e}");
        }
    }

    async fn submit_phone(&self, input: &str) -> SetupResponse {
        let session = self.telegram.session();
        if session.auth_phase() == AuthPhase::Ready {
            return self.complete(None);
        }

        let phone = match normalize_phone(input) {
            Ok(phone) => phone,
            Err(e) => return error_response(&e, STEP_PHONE),
        };

        if !session.has_client() {
            if let Err(e) = self.telegram.start().await {
                return error_response(&e, STEP_PHONE);
            }
        }

        // Already past the phone step, e.g. after a restart mid-login
        let phase = session.auth_phase();
        if matches!(phase, AuthPhase::WaitCode | AuthPhase::WaitPassword | AuthPhase::Ready) {
            info!("Phone step already done ({phase}), skipping ahead");
            if let Err(e) = self.state.set(KEY_PHONE_NUMBER, json!(phone)) {
                warn!("Failed to save phone number: {e}");
            }
            return self.advance(phase, Some(&phone));
        }

        match self.telegram.driver().submit_phone_number(&phone).await {
            Ok(phase) => {
                if let Err(e) = self.state.set(KEY_PHONE_NUMBER, json!(phone)) {
                    warn!("Failed to save phone number: {e}");
                }
                self.advance(phase, Some(&phone))
            }
            Err(e) => error_response(&e, STEP_PHONE),
        }
    }

    async fn submit_code(&self, code: &str) -> SetupResponse {
        if code.is_empty() {
            return SetupResponse::error(STEP_CODE, "Verification code is required");
        }
        match self.telegram.driver().submit_code(code).await {
            Ok(phase) => self.advance(phase, None),
            Err(e) => error_response(&e, STEP_CODE),
        }
    }

    async fn submit_password(&self, password: &str) -> SetupResponse {
        if password.is_empty() {
            return SetupResponse::error(STEP_PASSWORD, "Password is required");
        }
        match self.telegram.driver().submit_password(password).await {
            Ok(phase) => self.advance(phase, None),
            Err(e) => error_response(&e, STEP_PASSWORD),
        }
    }

    fn advance(&self, phase: AuthPhase, phone: Option<&str>) -> SetupResponse {
        match phase {
            AuthPhase::Ready => self.complete(phone),
            other => SetupResponse::next(self.step_for(other)),
        }
    }

    fn complete(&self, phone: Option<&str>) -> SetupResponse {
        if let Some(phone) = phone {
            if let Err(e) = self.state.set(KEY_PHONE_NUMBER, json!(phone)) {
                return SetupResponse::error(STEP_PHONE, format!("Could not save setup state: {e}"));
            }
        }
        if let Err(e) = self.state.set(KEY_SETUP_COMPLETE, json!(true)) {
            return SetupResponse::error(STEP_PHONE, format!("Could not save setup state: {e}"));
        }
        info!("Telegram setup complete");
        SetupResponse::complete()
    }

    // ── Steps ───────────────────────────────────────────

    fn step_for(&self, phase: AuthPhase) -> SetupStep {
        match phase {
            AuthPhase::WaitCode => self.code_step(),
            AuthPhase::WaitPassword => self.password_step(),
            AuthPhase::Ready => self.connected_step(),
            _ => phone_step(),
        }
    }

    fn code_step(&self) -> SetupStep {
        let description = match self.telegram.session().code_info() {
            Some(info) if !info.phone_number.is_empty() => format!(
                "Enter the code sent {} to {}.",
                info.delivery_description(),
                info.phone_number
            ),
            Some(info) => format!("Enter the code sent {}.", info.delivery_description()),
            None => "Enter the verification code Telegram sent you.".to_string(),
        };
        let placeholder = self
            .telegram
            .session()
            .code_info()
            .and_then(|info| info.length)
            .map(|len| "0".repeat(len as usize));

        SetupStep {
            id: STEP_CODE.to_string(),
            title: "Verification code".to_string(),
            description,
            fields: vec![SetupField {
                name: STEP_CODE.to_string(),
                label: "Code".to_string(),
                field_type: FieldType::Text,
                required: true,
                placeholder,
            }],
        }
    }

    fn password_step(&self) -> SetupStep {
        let description = match self.telegram.session().password_hint() {
            Some(hint) => format!("This account has two-step verification. Hint: {hint}"),
            None => "This account has two-step verification. Enter your password.".to_string(),
        };
        SetupStep {
            id: STEP_PASSWORD.to_string(),
            title: "Two-step verification".to_string(),
            description,
            fields: vec![SetupField {
                name: STEP_PASSWORD.to_string(),
                label: "Password".to_string(),
                field_type: FieldType::Password,
                required: true,
                placeholder: None,
            }],
        }
    }

    fn connected_step(&self) -> SetupStep {
        let account = match self.state.get(KEY_PHONE_NUMBER) {
            Ok(Some(Value::String(phone))) => format!(" as {phone}"),
            _ => String::new(),
        };
        let mut step = phone_step();
        step.description = format!("Telegram is already connected{account}. Submit to finish setup.");
        for field in &mut step.fields {
            field.required = false;
        }
        step
    }
}

fn phone_step() -> SetupStep {
    SetupStep {
        id: STEP_PHONE.to_string(),
        title: "Connect Telegram".to_string(),
        description: "Enter the phone number of your Telegram account.".to_string(),
        fields: vec![SetupField {
            name: STEP_PHONE.to_string(),
            label: "Phone number".to_string(),
            field_type: FieldType::Text,
            required: true,
            placeholder: Some("+15551234567".to_string()),
        }],
    }
}
