//! Login flow driver.
//!
//! Issues the phone/code/password requests and then waits for the update
//! dispatcher to move the session into an expected phase. The driver never
//! writes the phase itself. Every submit holds the session's auth
//! operation lock for its whole duration, so at most one runs at a time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::{TelegramConfig, TimeoutConfig};
use crate::database::DatabaseGuard;
use crate::error::AuthError;
use crate::retry::{Recovery, RetryPolicy};
use crate::session::{AuthPhase, Progress, SessionState};
use crate::tdlib::client::TdTransport;
use crate::tdlib::wire;

/// Progress reported while a wait drags on: (share of the budget in
/// 45ths, percent, message).
const CHECKPOINTS: &[(u32, u8, &str)] = &[
    (5, 20, "Contacting Telegram"),
    (15, 40, "Waiting for Telegram to respond"),
    (25, 60, "Still waiting for Telegram"),
    (35, 80, "Telegram is taking longer than usual"),
    (42, 90, "Almost out of time"),
];

/// Phases in which the client accepts login requests.
const SETTLED: &[AuthPhase] = &[
    AuthPhase::WaitPhoneNumber,
    AuthPhase::WaitCode,
    AuthPhase::WaitPassword,
    AuthPhase::Ready,
];

pub struct AuthDriver {
    session: Arc<SessionState>,
    transport: Arc<TdTransport>,
    telegram: TelegramConfig,
    timeouts: TimeoutConfig,
    policy: RetryPolicy,
    database: DatabaseGuard,
}

impl AuthDriver {
    pub fn new(
        session: Arc<SessionState>,
        transport: Arc<TdTransport>,
        telegram: TelegramConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        let policy = RetryPolicy::from_config(&timeouts);
        let database = DatabaseGuard::new(telegram.database_dir());
        Self {
            session,
            transport,
            telegram,
            timeouts,
            policy,
            database,
        }
    }

    pub fn database(&self) -> &DatabaseGuard {
        &self.database
    }

    // ── Waiting ──────────────────────────────────────────

    /// Waits until the session reaches one of `expected`.
    ///
    /// Returns at once if the phase already matches. Fails with
    /// `ConnectionClosed` if the client closes, or `Timeout` once
    /// `timeout` has elapsed.
    pub async fn wait_for_phase_change(
        &self,
        expected: &[AuthPhase],
        timeout: Duration,
    ) -> Result<AuthPhase, AuthError> {
        let mut phases = self.session.subscribe_phase();
        let recheck = self.timeouts.phase_poll().max(Duration::from_millis(1));
        let started = Instant::now();
        let mut next_checkpoint = 0;

        loop {
            let current = *phases.borrow_and_update();
            if expected.contains(&current) {
                return Ok(current);
            }
            if current == AuthPhase::Closed {
                return Err(AuthError::ConnectionClosed);
            }

            let elapsed = started.elapsed();
            while let Some(&(share, percent, message)) = CHECKPOINTS.get(next_checkpoint) {
                if elapsed < timeout * share / 45 {
                    break;
                }
                info!("{message} ({percent}%)");
                self.session.set_progress(Some(Progress {
                    percent,
                    message: message.to_string(),
                }));
                next_checkpoint += 1;
            }

            if elapsed >= timeout {
                return Err(AuthError::Timeout {
                    elapsed_ms: elapsed.as_millis() as u64,
                    expected: expected.to_vec(),
                    actual: current,
                    operation_in_progress: self.session.auth_operation_in_progress(),
                });
            }

            let wait = recheck.min(timeout - elapsed);
            if let Ok(Err(_)) = tokio::time::timeout(wait, phases.changed()).await {
                // The session itself is gone
                return Err(AuthError::ConnectionClosed);
            }
        }
    }

    // ── Initialization ───────────────────────────────────

    /// Creates the client and brings it to a phase that accepts login
    /// requests.
    pub async fn initialize(&self) -> Result<AuthPhase, AuthError> {
        self.session.set_connecting(true);
        let result = self.connect().await;
        self.session.set_connecting(false);

        match &result {
            Ok(phase) => {
                self.session.clear_last_error();
                info!("Telegram client initialized ({phase})");
            }
            Err(e) => {
                warn!("Telegram client initialization failed: {e}");
                // A half-started client would block the next attempt.
                // An existing client belongs to someone else.
                if !matches!(e, AuthError::Unavailable | AuthError::AlreadyExists) {
                    self.discard_client().await;
                }
                self.session.set_last_error(e.to_string());
            }
        }
        result
    }

    /// Closes a client that never finished initializing and returns the
    /// session to `Unknown`, so the next `initialize` starts over.
    async fn discard_client(&self) {
        if !self.session.has_client() {
            return;
        }
        if let Err(e) = self.transport.destroy().await {
            warn!("Failed to close half-initialized client: {e}");
        }
        self.session.reset_login();
    }

    async fn connect(&self) -> Result<AuthPhase, AuthError> {
        if !self.transport.is_available() {
            return Err(AuthError::Unavailable);
        }
        self.transport.create_client(&self.telegram.data_dir).await?;

        // Any request makes TDLib start the client and report its state
        self.transport.send(wire::get_option("version")).await?;

        let mut expected = vec![AuthPhase::WaitParameters];
        expected.extend_from_slice(SETTLED);
        let phase = self
            .wait_for_phase_change(&expected, self.timeouts.initialize())
            .await?;
        if phase != AuthPhase::WaitParameters {
            return Ok(phase);
        }

        self.transport
            .send(wire::set_tdlib_parameters(&self.telegram))
            .await?;
        self.wait_for_phase_change(SETTLED, self.timeouts.initialize())
            .await
    }

    // ── Submits ──────────────────────────────────────────

    fn ensure_can_submit(&self) -> Result<AuthPhase, AuthError> {
        if !self.session.has_client() || self.session.is_connecting() {
            return Err(AuthError::NotInitialized);
        }
        match self.session.auth_phase() {
            AuthPhase::Unknown | AuthPhase::WaitParameters => Err(AuthError::NotInitialized),
            phase if phase.is_terminal_failure() => Err(AuthError::ConnectionClosed),
            phase => Ok(phase),
        }
    }

    /// Sends the phone number and waits for Telegram to ask for a code,
    /// a password, or nothing at all.
    ///
    /// Timeouts and connection failures get one retry after the backoff.
    /// A corrupted database is reset and the client reconnected before
    /// the retry.
    pub async fn submit_phone_number(&self, phone: &str) -> Result<AuthPhase, AuthError> {
        self.ensure_can_submit()?;
        let _guard = self.session.begin_auth_operation()?;
        info!("Submitting phone number");

        let result = loop {
            let err = match self.attempt_phone_number(phone).await {
                Ok(phase) => break Ok(phase),
                Err(e) => e,
            };

            let recovery = err.recovery();
            if recovery == Recovery::None || !self.session.try_consume_retry() {
                break Err(err);
            }
            warn!("Phone submission failed ({err}), retrying");

            if recovery == Recovery::ResetDatabase {
                if let Err(e) = self.recover_database().await {
                    break Err(e);
                }
            }
            tokio::time::sleep(self.policy.delay_for(recovery)).await;
        };

        self.finish(result)
    }

    async fn attempt_phone_number(&self, phone: &str) -> Result<AuthPhase, AuthError> {
        self.transport
            .send(wire::set_authentication_phone_number(phone))
            .await?;
        self.wait_for_phase_change(
            &[AuthPhase::WaitCode, AuthPhase::WaitPassword, AuthPhase::Ready],
            self.timeouts.phone_submit(),
        )
        .await
    }

    /// Sends the verification code. A code that Telegram rejects, or that
    /// leaves the session waiting for a code, is `InvalidCode`.
    pub async fn submit_code(&self, code: &str) -> Result<AuthPhase, AuthError> {
        self.ensure_can_submit()?;
        let _guard = self.session.begin_auth_operation()?;
        info!("Submitting verification code");

        let result = match self.transport.send(wire::check_authentication_code(code)).await {
            Err(e) => Err(rejection_as(AuthError::from(e), AuthError::InvalidCode)),
            Ok(_) => {
                self.await_acceptance(
                    &[AuthPhase::WaitPassword, AuthPhase::Ready],
                    AuthPhase::WaitCode,
                    self.timeouts.code_submit(),
                    AuthError::InvalidCode,
                )
                .await
            }
        };

        self.finish(result)
    }

    /// Sends the two-step verification password.
    pub async fn submit_password(&self, password: &str) -> Result<AuthPhase, AuthError> {
        self.ensure_can_submit()?;
        let _guard = self.session.begin_auth_operation()?;
        info!("Submitting password");

        let result = match self
            .transport
            .send(wire::check_authentication_password(password))
            .await
        {
            Err(e) => Err(rejection_as(AuthError::from(e), AuthError::InvalidPassword)),
            Ok(_) => {
                self.await_acceptance(
                    &[AuthPhase::Ready],
                    AuthPhase::WaitPassword,
                    self.timeouts.password_submit(),
                    AuthError::InvalidPassword,
                )
                .await
            }
        };

        self.finish(result)
    }

    /// Asks Telegram to deliver the code again, possibly by another route.
    pub async fn resend_code(&self) -> Result<(), AuthError> {
        let phase = self.ensure_can_submit()?;
        if phase != AuthPhase::WaitCode {
            return Err(AuthError::invalid_input(
                "code",
                "No verification code is pending",
            ));
        }
        let _guard = self.session.begin_auth_operation()?;

        self.transport
            .send(wire::resend_authentication_code())
            .await?;
        info!("Verification code resent");
        Ok(())
    }

    /// Waits for an acknowledged input to move the session on.
    ///
    /// TDLib updates the phase before it acknowledges accepted input, so a
    /// session still in `input_phase` after the grace period did not take
    /// it. Any other phase gets the rest of `budget`.
    async fn await_acceptance(
        &self,
        expected: &[AuthPhase],
        input_phase: AuthPhase,
        budget: Duration,
        rejected: AuthError,
    ) -> Result<AuthPhase, AuthError> {
        let grace = self.timeouts.input_grace().min(budget);
        match self.wait_for_phase_change(expected, grace).await {
            Err(AuthError::Timeout { actual, .. }) if actual == input_phase => {
                info!("Input acknowledged but still {input_phase} after {}ms", grace.as_millis());
                Err(rejected)
            }
            Err(AuthError::Timeout { .. }) => self
                .wait_for_phase_change(expected, budget.saturating_sub(grace))
                .await
                .map_err(|e| unchanged_as(e, input_phase, rejected)),
            other => other,
        }
    }

    fn finish(&self, result: Result<AuthPhase, AuthError>) -> Result<AuthPhase, AuthError> {
        match &result {
            Ok(phase) => {
                self.session.clear_retries();
                self.session.clear_last_error();
                info!("Sign-in step accepted, now {phase}");
            }
            Err(e) => {
                warn!("Sign-in step failed: {e}");
                self.session.set_last_error(e.to_string());
            }
        }
        result
    }

    // ── Recovery ─────────────────────────────────────────

    /// Tears the client down, moves the database aside and reconnects.
    async fn recover_database(&self) -> Result<(), AuthError> {
        warn!("Resetting TDLib database at {}", self.database.dir().display());
        self.transport.destroy().await?;
        self.session.reset_login();
        self.database.reset().await?;
        self.initialize().await?;
        Ok(())
    }
}

/// Replaces a generic TDLib rejection with the step-specific error.
fn rejection_as(err: AuthError, specific: AuthError) -> AuthError {
    match err {
        AuthError::Td { code: 400, .. } | AuthError::InvalidCode | AuthError::InvalidPassword => {
            specific
        }
        other => other,
    }
}

/// A wait that timed out while still in `phase` means the input was not
/// accepted.
fn unchanged_as(err: AuthError, phase: AuthPhase, specific: AuthError) -> AuthError {
    match err {
        AuthError::Timeout { actual, .. } if actual == phase => specific,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::UpdateDispatcher;
    use crate::tdlib::client::TransportSettings;
    use crate::tdlib::mock::MockBackend;
    use serde_json::{json, Value};
    use tokio::task::JoinHandle;

    struct Harness {
        backend: Arc<MockBackend>,
        session: Arc<SessionState>,
        driver: Arc<AuthDriver>,
        dispatcher: JoinHandle<()>,
        _dir: tempfile::TempDir,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.dispatcher.abort();
        }
    }

    fn timeouts() -> TimeoutConfig {
        let mut t = TimeoutConfig::default();
        t.phone_submit_ms = 300;
        t.code_submit_ms = 150;
        t.password_submit_ms = 150;
        t.input_grace_ms = 100;
        t.initialize_ms = 1_000;
        t.request_ms = 200;
        t.receive_poll_ms = 5;
        t.phase_poll_ms = 10;
        t.destroy_drain_ms = 200;
        t.retry_backoff_ms = 10;
        t
    }

    fn state(state_type: &str) -> Value {
        json!({
            "@type": "updateAuthorizationState",
            "authorization_state": {"@type": state_type}
        })
    }

    fn ok(req: &Value) -> Value {
        json!({"@type": "ok", "@extra": req["@extra"].clone()})
    }

    fn td_error(req: &Value, code: i64, message: &str) -> Value {
        json!({"@type": "error", "code": code, "message": message, "@extra": req["@extra"].clone()})
    }

    /// A well-behaved TDLib: accepts code "12345" and password "hunter2";
    /// any other code is acknowledged but leaves the phase unchanged.
    fn tdlib(req: &Value) -> Vec<Value> {
        match wire::type_of(req) {
            Some("getOption") => vec![
                json!({"@type": "optionValueString", "value": "1.8.0", "@extra": req["@extra"].clone()}),
                state("authorizationStateWaitTdlibParameters"),
            ],
            Some("setTdlibParameters") => vec![ok(req), state("authorizationStateWaitPhoneNumber")],
            Some("setAuthenticationPhoneNumber") => vec![ok(req), state("authorizationStateWaitCode")],
            Some("checkAuthenticationCode") if req["code"] == "12345" => {
                vec![ok(req), state("authorizationStateWaitPassword")]
            }
            Some("checkAuthenticationCode") => vec![ok(req)],
            Some("checkAuthenticationPassword") if req["password"] == "hunter2" => {
                vec![ok(req), state("authorizationStateReady")]
            }
            Some("checkAuthenticationPassword") => vec![td_error(req, 400, "PASSWORD_HASH_INVALID")],
            Some("resendAuthenticationCode") => vec![ok(req)],
            Some("close") => vec![state("authorizationStateClosed")],
            _ => vec![ok(req)],
        }
    }

    fn harness_with(backend: Arc<MockBackend>) -> Harness {
        harness_with_timeouts(backend, timeouts())
    }

    fn harness_with_timeouts(backend: Arc<MockBackend>, t: TimeoutConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(SessionState::new(t.max_retries));
        let transport = Arc::new(TdTransport::new(
            backend.clone(),
            session.clone(),
            TransportSettings::from(&t),
        ));
        let dispatcher = UpdateDispatcher::new(session.clone())
            .spawn(transport.clone(), Duration::from_millis(20));
        let driver = Arc::new(AuthDriver::new(
            session.clone(),
            transport,
            TelegramConfig::with_data_dir(dir.path()),
            t,
        ));
        Harness {
            backend,
            session,
            driver,
            dispatcher,
            _dir: dir,
        }
    }

    async fn initialized(backend: Arc<MockBackend>) -> Harness {
        let h = harness_with(backend);
        let phase = h.driver.initialize().await.unwrap();
        assert_eq!(phase, AuthPhase::WaitPhoneNumber);
        h
    }

    fn scripted() -> Arc<MockBackend> {
        let backend = MockBackend::new();
        backend.respond_with(tdlib);
        backend
    }

    // ── Waiting ─────────────────────────────────────────

    #[tokio::test]
    async fn test_wait_returns_immediately_when_phase_matches() {
        let h = harness_with(MockBackend::new());
        h.session.set_auth_phase(AuthPhase::WaitCode);

        let started = Instant::now();
        let phase = h
            .driver
            .wait_for_phase_change(&[AuthPhase::WaitCode], Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(phase, AuthPhase::WaitCode);
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_phase_change() {
        let h = harness_with(MockBackend::new());
        h.session.set_auth_phase(AuthPhase::WaitPhoneNumber);

        let session = h.session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            session.set_auth_phase(AuthPhase::Ready);
        });
        let phase = h
            .driver
            .wait_for_phase_change(&[AuthPhase::Ready], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(phase, AuthPhase::Ready);
    }

    #[tokio::test]
    async fn test_wait_timeout_has_diagnostics() {
        let h = harness_with(MockBackend::new());
        h.session.set_auth_phase(AuthPhase::WaitPhoneNumber);

        match h
            .driver
            .wait_for_phase_change(&[AuthPhase::WaitCode, AuthPhase::Ready], Duration::from_millis(90))
            .await
        {
            Err(AuthError::Timeout {
                elapsed_ms,
                expected,
                actual,
                operation_in_progress,
            }) => {
                assert!(elapsed_ms >= 90);
                assert_eq!(expected, vec![AuthPhase::WaitCode, AuthPhase::Ready]);
                assert_eq!(actual, AuthPhase::WaitPhoneNumber);
                assert!(!operation_in_progress);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
        // The last checkpoint was reached before the budget ran out
        assert_eq!(h.session.progress().map(|p| p.percent), Some(90));
    }

    #[tokio::test]
    async fn test_wait_fails_when_closed() {
        let h = harness_with(MockBackend::new());
        h.session.set_auth_phase(AuthPhase::Closed);

        assert!(matches!(
            h.driver
                .wait_for_phase_change(&[AuthPhase::Ready], Duration::from_secs(5))
                .await,
            Err(AuthError::ConnectionClosed)
        ));
    }

    // ── Initialization ──────────────────────────────────

    #[tokio::test]
    async fn test_initialize_sends_parameters() {
        let h = initialized(scripted()).await;
        let params = h.backend.sent_of_type("setTdlibParameters");
        assert_eq!(params.len(), 1);
        assert!(params[0]["database_directory"]
            .as_str()
            .unwrap()
            .ends_with("db"));
        assert!(!h.session.is_connecting());
        assert_eq!(h.session.last_error(), None);
    }

    #[tokio::test]
    async fn test_initialize_unavailable_records_error() {
        let h = harness_with(MockBackend::unavailable());
        assert!(matches!(h.driver.initialize().await, Err(AuthError::Unavailable)));
        assert!(h.session.last_error().is_some());
        assert!(!h.session.is_connecting());
    }

    // ── Phone ───────────────────────────────────────────

    #[tokio::test]
    async fn test_failed_initialize_releases_client() {
        let backend = MockBackend::new();
        let mut version_requests = 0;
        backend.respond_with(move |req| match wire::type_of(req) {
            Some("getOption") => {
                version_requests += 1;
                if version_requests == 1 {
                    // TDLib never answers the first request
                    vec![]
                } else {
                    tdlib(req)
                }
            }
            _ => tdlib(req),
        });
        let h = harness_with(backend);

        assert!(matches!(h.driver.initialize().await, Err(AuthError::Network(_))));
        assert!(!h.session.has_client());
        assert!(!h.session.is_connecting());
        assert_eq!(h.session.auth_phase(), AuthPhase::Unknown);
        assert!(h.session.last_error().is_some());
        assert_eq!(h.backend.sent_of_type("close").len(), 1);
        assert!(matches!(
            h.driver.submit_phone_number("+15551234567").await,
            Err(AuthError::NotInitialized)
        ));

        // The next attempt starts from scratch
        assert_eq!(h.driver.initialize().await.unwrap(), AuthPhase::WaitPhoneNumber);
        assert_eq!(h.backend.sent_of_type("getOption").len(), 2);
        assert_eq!(h.session.last_error(), None);
        assert_eq!(
            h.driver.submit_phone_number("+15551234567").await.unwrap(),
            AuthPhase::WaitCode
        );
    }

    #[tokio::test]
    async fn test_unavailable_initialize_closes_nothing() {
        let h = harness_with(MockBackend::unavailable());
        assert!(matches!(h.driver.initialize().await, Err(AuthError::Unavailable)));
        assert!(h.backend.sent_of_type("close").is_empty());
    }

    #[tokio::test]
    async fn test_submit_before_parameters_is_not_initialized() {
        let h = harness_with(MockBackend::new());
        h.driver.transport.create_client(h._dir.path()).await.unwrap();
        assert_eq!(h.session.auth_phase(), AuthPhase::Unknown);
        assert!(matches!(
            h.driver.submit_phone_number("+15551234567").await,
            Err(AuthError::NotInitialized)
        ));

        h.session.set_auth_phase(AuthPhase::WaitParameters);
        assert!(matches!(
            h.driver.submit_code("12345").await,
            Err(AuthError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_submit_without_client_is_not_initialized() {
        let h = harness_with(scripted());
        assert!(matches!(
            h.driver.submit_phone_number("+15551234567").await,
            Err(AuthError::NotInitialized)
        ));
        assert_eq!(h.backend.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_phone_reaches_wait_code() {
        let h = initialized(scripted()).await;
        let phase = h.driver.submit_phone_number("+15551234567").await.unwrap();
        assert_eq!(phase, AuthPhase::WaitCode);
        assert!(!h.session.auth_operation_in_progress());
        assert_eq!(h.session.progress(), None);

        let sent = h.backend.sent_of_type("setAuthenticationPhoneNumber");
        assert_eq!(sent[0]["phone_number"], "+15551234567");
    }

    #[tokio::test]
    async fn test_concurrent_submits_one_proceeds() {
        let backend = MockBackend::new();
        // Phone requests are acknowledged but the phase only moves later
        backend.respond_with(|req| match wire::type_of(req) {
            Some("setAuthenticationPhoneNumber") => vec![ok(req)],
            _ => tdlib(req),
        });
        let h = initialized(backend).await;

        let mut handles = Vec::new();
        for _ in 0..3 {
            let driver = h.driver.clone();
            handles.push(tokio::spawn(async move {
                driver.submit_phone_number("+15551234567").await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.session.set_auth_phase(AuthPhase::WaitCode);

        let mut ok_count = 0;
        let mut busy = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(AuthPhase::WaitCode) => ok_count += 1,
                Err(AuthError::Busy) => busy += 1,
                other => panic!("unexpected result {other:?}"),
            }
        }
        assert_eq!(ok_count, 1);
        assert_eq!(busy, 2);
        assert!(!h.session.auth_operation_in_progress());
    }

    #[tokio::test]
    async fn test_lock_released_after_failure() {
        let backend = MockBackend::new();
        backend.respond_with(|req| match wire::type_of(req) {
            Some("setAuthenticationPhoneNumber") => vec![td_error(req, 400, "PHONE_NUMBER_INVALID")],
            _ => tdlib(req),
        });
        let h = initialized(backend).await;

        match h.driver.submit_phone_number("+15550000000").await {
            Err(AuthError::InvalidInput { field, .. }) => assert_eq!(field, "phone"),
            other => panic!("expected InvalidInput, got {other:?}"),
        }
        assert!(!h.session.auth_operation_in_progress());
        assert!(h.session.last_error().is_some());
        // Not retryable
        assert_eq!(h.backend.sent_of_type("setAuthenticationPhoneNumber").len(), 1);
    }

    #[tokio::test]
    async fn test_phone_timeout_is_retried_once() {
        let backend = MockBackend::new();
        let mut attempts = 0;
        backend.respond_with(move |req| match wire::type_of(req) {
            Some("setAuthenticationPhoneNumber") => {
                attempts += 1;
                if attempts == 1 {
                    // No answer: the request times out
                    vec![]
                } else {
                    vec![ok(req), state("authorizationStateWaitCode")]
                }
            }
            _ => tdlib(req),
        });
        let h = initialized(backend).await;

        let phase = h.driver.submit_phone_number("+15551234567").await.unwrap();
        assert_eq!(phase, AuthPhase::WaitCode);
        assert_eq!(h.backend.sent_of_type("setAuthenticationPhoneNumber").len(), 2);
        assert_eq!(h.session.retries_used(), 0);
    }

    #[tokio::test]
    async fn test_phone_wait_timeout_is_retried_once() {
        let backend = MockBackend::new();
        let mut attempts = 0;
        backend.respond_with(move |req| match wire::type_of(req) {
            Some("setAuthenticationPhoneNumber") => {
                attempts += 1;
                if attempts == 1 {
                    // Acknowledged, but the phase never moves
                    vec![ok(req)]
                } else {
                    vec![ok(req), state("authorizationStateWaitCode")]
                }
            }
            _ => tdlib(req),
        });
        let h = initialized(backend).await;

        let phase = h.driver.submit_phone_number("+15551234567").await.unwrap();
        assert_eq!(phase, AuthPhase::WaitCode);
        assert_eq!(h.backend.sent_of_type("setAuthenticationPhoneNumber").len(), 2);
        assert_eq!(h.session.retries_used(), 0);
        assert_eq!(h.session.last_error(), None);
        assert!(!h.session.auth_operation_in_progress());
    }

    #[tokio::test]
    async fn test_second_failure_surfaces() {
        let backend = MockBackend::new();
        backend.respond_with(|req| match wire::type_of(req) {
            Some("setAuthenticationPhoneNumber") => vec![],
            _ => tdlib(req),
        });
        let h = initialized(backend).await;

        assert!(matches!(
            h.driver.submit_phone_number("+15551234567").await,
            Err(AuthError::Network(_))
        ));
        assert_eq!(h.backend.sent_of_type("setAuthenticationPhoneNumber").len(), 2);
        assert!(!h.session.auth_operation_in_progress());
    }

    #[tokio::test]
    async fn test_database_corruption_recovers_and_retries() {
        let backend = MockBackend::new();
        let mut attempts = 0;
        backend.respond_with(move |req| match wire::type_of(req) {
            Some("setAuthenticationPhoneNumber") => {
                attempts += 1;
                if attempts == 1 {
                    vec![td_error(req, 400, "Database is broken: binlog mismatch")]
                } else {
                    vec![ok(req), state("authorizationStateWaitCode")]
                }
            }
            _ => tdlib(req),
        });
        let h = initialized(backend).await;
        std::fs::create_dir_all(h.driver.database().dir()).unwrap();
        std::fs::write(h.driver.database().dir().join("td.binlog"), b"").unwrap();

        let phase = h.driver.submit_phone_number("+15551234567").await.unwrap();
        assert_eq!(phase, AuthPhase::WaitCode);

        // The client was closed and set up again
        assert_eq!(h.backend.sent_of_type("close").len(), 1);
        assert_eq!(h.backend.sent_of_type("setTdlibParameters").len(), 2);
        assert!(!h.driver.database().dir().join("td.binlog").exists());
        assert!(h.session.has_client());
    }

    // ── Code and password ───────────────────────────────

    #[tokio::test]
    async fn test_unchanged_wait_code_is_invalid_code() {
        let h = initialized(scripted()).await;
        h.driver.submit_phone_number("+15551234567").await.unwrap();

        let err = h.driver.submit_code("00000").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCode));
        assert_eq!(err.to_string(), "Invalid verification code");
        assert_eq!(h.session.auth_phase(), AuthPhase::WaitCode);
        assert!(!h.session.auth_operation_in_progress());
    }

    #[tokio::test]
    async fn test_wrong_code_fails_after_grace_period() {
        let mut t = timeouts();
        t.code_submit_ms = 10_000;
        t.input_grace_ms = 100;
        let h = harness_with_timeouts(scripted(), t);
        h.driver.initialize().await.unwrap();
        h.driver.submit_phone_number("+15551234567").await.unwrap();

        let started = std::time::Instant::now();
        assert!(matches!(
            h.driver.submit_code("00000").await,
            Err(AuthError::InvalidCode)
        ));
        assert!(started.elapsed() < Duration::from_secs(2));

        // A correct code still gets through afterwards
        assert_eq!(h.driver.submit_code("12345").await.unwrap(), AuthPhase::WaitPassword);
    }

    #[tokio::test]
    async fn test_rejected_code_is_invalid_code() {
        let backend = MockBackend::new();
        backend.respond_with(|req| match wire::type_of(req) {
            Some("checkAuthenticationCode") => vec![td_error(req, 400, "PHONE_CODE_INVALID")],
            _ => tdlib(req),
        });
        let h = initialized(backend).await;
        h.driver.submit_phone_number("+15551234567").await.unwrap();

        assert!(matches!(
            h.driver.submit_code("11111").await,
            Err(AuthError::InvalidCode)
        ));
    }

    #[tokio::test]
    async fn test_full_login_with_password() {
        let h = initialized(scripted()).await;
        h.driver.submit_phone_number("+15551234567").await.unwrap();

        assert_eq!(h.driver.submit_code("12345").await.unwrap(), AuthPhase::WaitPassword);
        assert!(matches!(
            h.driver.submit_password("wrong").await,
            Err(AuthError::InvalidPassword)
        ));
        assert_eq!(h.driver.submit_password("hunter2").await.unwrap(), AuthPhase::Ready);
        assert_eq!(h.session.last_error(), None);
    }

    #[tokio::test]
    async fn test_resend_code_requires_wait_code() {
        let h = initialized(scripted()).await;
        assert!(matches!(
            h.driver.resend_code().await,
            Err(AuthError::InvalidInput { .. })
        ));

        h.driver.submit_phone_number("+15551234567").await.unwrap();
        h.driver.resend_code().await.unwrap();
        assert_eq!(h.backend.sent_of_type("resendAuthenticationCode").len(), 1);
    }

    #[tokio::test]
    async fn test_submit_after_close_is_connection_closed() {
        let h = initialized(scripted()).await;
        h.session.set_auth_phase(AuthPhase::Closing);
        assert!(matches!(
            h.driver.submit_code("12345").await,
            Err(AuthError::ConnectionClosed)
        ));
    }
}
