use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub skill: SkillConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    /// Application id from https://my.telegram.org
    pub api_id: i32,
    /// Supports ${ENV_VAR} substitution
    pub api_hash: String,
    /// TDLib database and files live here
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Helper executable speaking TDLib JSON over stdin/stdout
    #[serde(default = "default_bridge_path")]
    pub bridge_path: PathBuf,
    #[serde(default)]
    pub bridge_args: Vec<String>,
    #[serde(default = "default_language_code")]
    pub system_language_code: String,
    #[serde(default = "default_device_model")]
    pub device_model: String,
    #[serde(default = "default_application_version")]
    pub application_version: String,
    /// Connect to Telegram's test data centers
    #[serde(default)]
    pub use_test_dc: bool,
}

/// Every budget of the login flow, in milliseconds.
///
/// The phone step gets a longer budget than code/password because it
/// includes the first network handshake with Telegram.
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    #[serde(default = "default_phone_submit_ms")]
    pub phone_submit_ms: u64,
    #[serde(default = "default_code_submit_ms")]
    pub code_submit_ms: u64,
    #[serde(default = "default_password_submit_ms")]
    pub password_submit_ms: u64,
    /// How long an acknowledged code or password may leave the phase
    /// unchanged before it counts as rejected
    #[serde(default = "default_input_grace_ms")]
    pub input_grace_ms: u64,
    #[serde(default = "default_initialize_ms")]
    pub initialize_ms: u64,
    #[serde(default = "default_request_ms")]
    pub request_ms: u64,
    #[serde(default = "default_receive_poll_ms")]
    pub receive_poll_ms: u64,
    #[serde(default = "default_phase_poll_ms")]
    pub phase_poll_ms: u64,
    #[serde(default = "default_destroy_drain_ms")]
    pub destroy_drain_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SkillConfig {
    /// Where the skill's key-value state is persisted
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/telegram")
}

fn default_bridge_path() -> PathBuf {
    PathBuf::from("tdjson-bridge")
}

fn default_language_code() -> String {
    "en".to_string()
}

fn default_device_model() -> String {
    "Server".to_string()
}

fn default_application_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_phone_submit_ms() -> u64 {
    45_000
}

fn default_code_submit_ms() -> u64 {
    15_000
}

fn default_password_submit_ms() -> u64 {
    15_000
}

fn default_input_grace_ms() -> u64 {
    3_000
}

fn default_initialize_ms() -> u64 {
    30_000
}

fn default_request_ms() -> u64 {
    30_000
}

fn default_receive_poll_ms() -> u64 {
    50
}

fn default_phase_poll_ms() -> u64 {
    250
}

fn default_destroy_drain_ms() -> u64 {
    5_000
}

fn default_retry_backoff_ms() -> u64 {
    2_000
}

fn default_max_batch() -> usize {
    100
}

fn default_max_retries() -> u32 {
    1
}

fn default_state_path() -> PathBuf {
    PathBuf::from("./data/state.json")
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            phone_submit_ms: default_phone_submit_ms(),
            code_submit_ms: default_code_submit_ms(),
            input_grace_ms: default_input_grace_ms(),
            password_submit_ms: default_password_submit_ms(),
            initialize_ms: default_initialize_ms(),
            request_ms: default_request_ms(),
            receive_poll_ms: default_receive_poll_ms(),
            phase_poll_ms: default_phase_poll_ms(),
            destroy_drain_ms: default_destroy_drain_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_batch: default_max_batch(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for SkillConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
        }
    }
}

impl TimeoutConfig {
    pub fn phone_submit(&self) -> Duration {
        Duration::from_millis(self.phone_submit_ms)
    }

    pub fn code_submit(&self) -> Duration {
        Duration::from_millis(self.code_submit_ms)
    }

    pub fn password_submit(&self) -> Duration {
        Duration::from_millis(self.password_submit_ms)
    }

    pub fn input_grace(&self) -> Duration {
        Duration::from_millis(self.input_grace_ms)
    }

    pub fn initialize(&self) -> Duration {
        Duration::from_millis(self.initialize_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn receive_poll(&self) -> Duration {
        Duration::from_millis(self.receive_poll_ms)
    }

    pub fn phase_poll(&self) -> Duration {
        Duration::from_millis(self.phase_poll_ms)
    }

    pub fn destroy_drain(&self) -> Duration {
        Duration::from_millis(self.destroy_drain_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl TelegramConfig {
    /// Minimal config pointing at `data_dir`, used by tests and embedders.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            api_id: 0,
            api_hash: String::new(),
            data_dir: data_dir.into(),
            bridge_path: default_bridge_path(),
            bridge_args: Vec::new(),
            system_language_code: default_language_code(),
            device_model: default_device_model(),
            application_version: default_application_version(),
            use_test_dc: false,
        }
    }

    pub fn database_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.data_dir.join("files")
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${TELEGRAM_API_HASH}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        if config.telegram.api_id <= 0 {
            anyhow::bail!("telegram.api_id must be a positive application id");
        }
        Ok(config)
    }
}
