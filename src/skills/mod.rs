pub mod builtin;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;

use crate::host::StateStore;
use crate::telegram::TelegramSession;

/// Runtime context passed to skill execution.
///
/// Gives skills the live Telegram session and the host's key-value state.
#[derive(Clone)]
pub struct SkillContext {
    pub telegram: Arc<TelegramSession>,
    pub state: Arc<dyn StateStore>,
}

/// A tool the host can invoke on behalf of the agent.
///
/// The host calls `execute()` when the agent requests the tool by name.
#[async_trait]
pub trait Skill: Send + Sync {
    /// Unique identifier advertised to the host.
    /// Must be lowercase alphanumeric + underscores (e.g. "telegram_status").
    fn name(&self) -> &str;

    /// Human-readable description shown to the agent so it knows
    /// when to invoke this skill.
    fn description(&self) -> &str;

    /// JSON Schema describing the parameters this skill accepts.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Capabilities the skill needs from the host.
    /// Examples: "telegram:session:read", "state:read"
    fn capabilities(&self) -> Vec<String> {
        vec![]
    }

    /// Execute the skill with the given parameters and return a text result.
    async fn execute(
        &self,
        params: serde_json::Value,
        context: &SkillContext,
    ) -> anyhow::Result<String>;
}

pub use registry::SkillRegistry;
