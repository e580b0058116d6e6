pub mod backend;
pub mod client;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod wire;

use std::sync::Arc;

use crate::config::TelegramConfig;
use backend::{ProcessBackend, TdBackend};

/// Starts the configured TDLib helper. The backend reports unavailable
/// if the helper is missing.
pub fn process_backend(telegram: &TelegramConfig) -> Arc<dyn TdBackend> {
    Arc::new(ProcessBackend::launch(
        &telegram.bridge_path,
        &telegram.bridge_args,
    ))
}
