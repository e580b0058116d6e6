use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use telegram_skill::config::Config;
use telegram_skill::host::{JsonFileStateStore, StateStore};
use telegram_skill::setup::{SetupSubmission, SetupWizard};
use telegram_skill::skills::builtin::{TelegramGetMeSkill, TelegramStatusSkill};
use telegram_skill::skills::{SkillContext, SkillRegistry};
use telegram_skill::tdlib;
use telegram_skill::telegram::TelegramSession;

fn print_help() {
    println!(
        "\
telegram-skill v{}

Telegram skill for agent runtimes. Speaks one JSON object per line on
stdin/stdout; logs go to stderr.

USAGE:
    telegram-skill [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/telegram.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

REQUESTS:
    {{\"op\":\"setup_start\"}}
    {{\"op\":\"setup_submit\",\"stepId\":\"phone\",\"values\":{{\"phone\":\"+15551234567\"}}}}
    {{\"op\":\"setup_cancel\"}}
    {{\"op\":\"tools\"}}
    {{\"op\":\"call\",\"tool\":\"telegram_status\",\"params\":{{}}}}

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG             Log level filter for tracing
                         (e.g. debug, telegram_skill=debug,warn)
    TELEGRAM_API_HASH    API hash from https://my.telegram.org

EXAMPLES:
    telegram-skill                              # uses config/telegram.toml
    telegram-skill /etc/telegram/skill.toml     # custom config path
    RUST_LOG=debug telegram-skill               # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

/// One line of the host protocol.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    SetupStart,
    SetupSubmit(SetupSubmission),
    SetupCancel,
    Tools,
    Call {
        tool: String,
        #[serde(default)]
        params: Value,
    },
}

struct Host {
    wizard: SetupWizard,
    skills: SkillRegistry,
    context: SkillContext,
}

impl Host {
    async fn handle_line(&self, line: &str) -> Value {
        let request: Request = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                warn!("Bad request: {e}");
                return json!({"ok": false, "error": format!("Bad request: {e}")});
            }
        };

        match request {
            Request::SetupStart => {
                let step = self.wizard.on_setup_start().await;
                json!({"ok": true, "step": step})
            }
            Request::SetupSubmit(submission) => {
                let response = self.wizard.on_setup_submit(submission).await;
                json!({"ok": true, "response": response})
            }
            Request::SetupCancel => {
                self.wizard.on_setup_cancel().await;
                json!({"ok": true})
            }
            Request::Tools => json!({"ok": true, "tools": self.skills.tool_definitions()}),
            Request::Call { tool, params } => {
                match self.skills.execute(&tool, params, &self.context).await {
                    Ok(result) => json!({"ok": true, "result": result}),
                    Err(e) => {
                        warn!("Tool {tool} failed: {e}");
                        json!({"ok": false, "error": e.to_string()})
                    }
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("telegram-skill v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("telegram_skill=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/telegram.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    info!("TDLib helper: {}", config.telegram.bridge_path.display());
    info!("Data directory: {}", config.telegram.data_dir.display());
    if config.telegram.use_test_dc {
        info!("Using Telegram test data centers");
    }

    let backend = tdlib::process_backend(&config.telegram);
    let telegram = Arc::new(TelegramSession::new(
        backend,
        config.telegram.clone(),
        config.timeouts.clone(),
    ));
    if !telegram.is_available() {
        warn!("TDLib helper is not available; setup will report the failure");
    }

    let state: Arc<dyn StateStore> = Arc::new(JsonFileStateStore::open(&config.skill.state_path)?);

    let mut skills = SkillRegistry::new();
    skills.register(Box::new(TelegramStatusSkill));
    skills.register(Box::new(TelegramGetMeSkill));
    info!("Skills: {} registered", skills.len());

    let host = Host {
        wizard: SetupWizard::new(telegram.clone(), state.clone()),
        skills,
        context: SkillContext {
            telegram: telegram.clone(),
            state,
        },
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    // ── Request loop ───────────────────────────────────────────────
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting");
                break;
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Host closed stdin, exiting");
                break;
            }
            Err(e) => {
                error!("Failed to read request: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = host.handle_line(&line).await;
        let mut out = reply.to_string();
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }

    // Close the client so TDLib flushes its database
    if let Err(e) = telegram.disconnect().await {
        warn!("Failed to close Telegram client: {e}");
    }
    Ok(())
}
