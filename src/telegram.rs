//! One Telegram connection: session record, transport, update dispatcher
//! and login driver, wired together.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::AuthDriver;
use crate::config::{TelegramConfig, TimeoutConfig};
use crate::database::DatabaseHealth;
use crate::dispatcher::UpdateDispatcher;
use crate::error::AuthError;
use crate::session::{AuthPhase, SessionState};
use crate::tdlib::backend::TdBackend;
use crate::tdlib::client::{TdTransport, TransportSettings};
use crate::tdlib::wire;

/// How long the dispatcher blocks on each `receive`.
const DISPATCH_WAIT: Duration = Duration::from_secs(1);

pub struct TelegramSession {
    session: Arc<SessionState>,
    transport: Arc<TdTransport>,
    driver: AuthDriver,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramSession {
    pub fn new(backend: Arc<dyn TdBackend>, telegram: TelegramConfig, timeouts: TimeoutConfig) -> Self {
        let session = Arc::new(SessionState::new(timeouts.max_retries));
        let transport = Arc::new(TdTransport::new(
            backend,
            session.clone(),
            TransportSettings::from(&timeouts),
        ));
        let driver = AuthDriver::new(session.clone(), transport.clone(), telegram, timeouts);
        Self {
            session,
            transport,
            driver,
            dispatcher: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    pub fn driver(&self) -> &AuthDriver {
        &self.driver
    }

    pub fn is_available(&self) -> bool {
        self.transport.is_available()
    }

    fn ensure_dispatcher(&self) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let task = UpdateDispatcher::new(self.session.clone()).spawn(self.transport.clone(), DISPATCH_WAIT);
        *dispatcher = Some(task);
    }

    /// Creates and initializes the client if there isn't one yet.
    pub async fn start(&self) -> Result<AuthPhase, AuthError> {
        self.ensure_dispatcher();
        if self.session.has_client() {
            return Ok(self.session.auth_phase());
        }
        self.driver.initialize().await
    }

    /// Checks a session that looks unhealthy and discards it if it cannot
    /// be used. Returns true if the session was reset.
    pub async fn recover_if_needed(&self) -> Result<bool, AuthError> {
        if !self.session.has_client() {
            return Ok(false);
        }
        let phase = self.session.auth_phase();

        if matches!(phase, AuthPhase::Closing | AuthPhase::Closed) {
            info!("Telegram client is {phase}, reconnecting");
            self.disconnect().await?;
            return Ok(true);
        }

        if self.session.last_error().is_none() && phase != AuthPhase::Unknown {
            return Ok(false);
        }

        match self.driver.database().check().await {
            DatabaseHealth::Corrupt(reason) => {
                warn!("TDLib database is corrupt: {reason}");
                self.reset().await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Disconnects and wipes the local database.
    pub async fn reset(&self) -> Result<(), AuthError> {
        self.transport.destroy().await?;
        self.session.reset();
        self.driver.database().reset().await?;
        Ok(())
    }

    /// Disconnects and forgets the login attempt. The database is kept.
    pub async fn disconnect(&self) -> Result<(), AuthError> {
        self.transport.destroy().await?;
        self.session.reset();
        info!("Telegram session disconnected");
        Ok(())
    }

    /// The signed-in account.
    pub async fn get_me(&self) -> Result<Value, AuthError> {
        let phase = self.session.auth_phase();
        if phase != AuthPhase::Ready {
            return Err(AuthError::NotAuthorized(phase));
        }
        let mut user = self.transport.send(wire::get_me()).await?;
        if let Some(map) = user.as_object_mut() {
            map.remove(wire::EXTRA);
        }
        Ok(user)
    }
}

impl Drop for TelegramSession {
    fn drop(&mut self) {
        if let Some(task) = self.dispatcher.lock().take() {
            task.abort();
        }
    }
}
