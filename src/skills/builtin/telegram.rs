//! Builtin skills: Telegram session status and the signed-in account.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::host::{KEY_PHONE_NUMBER, KEY_SETUP_COMPLETE};
use crate::skills::{Skill, SkillContext};

/// Reports where the Telegram login stands.
///
/// Returns the session snapshot as JSON, plus whether setup was completed
/// and the phone number it was completed with.
pub struct TelegramStatusSkill;

#[async_trait]
impl Skill for TelegramStatusSkill {
    fn name(&self) -> &str {
        "telegram_status"
    }

    fn description(&self) -> &str {
        "Show the state of the Telegram connection: the current sign-in step, \
         whether a client is running, the network state and the last error. \
         Use this before other Telegram tools to check that the account is connected."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["telegram:session:read".to_string(), "state:read".to_string()]
    }

    async fn execute(&self, _params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let snapshot = context.telegram.session().snapshot();
        let setup_complete = context
            .state
            .get(KEY_SETUP_COMPLETE)?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let phone_number = context.state.get(KEY_PHONE_NUMBER)?;

        let status = json!({
            "available": context.telegram.is_available(),
            "setupComplete": setup_complete,
            "phoneNumber": phone_number,
            "session": snapshot,
        });
        Ok(serde_json::to_string_pretty(&status)?)
    }
}

/// Returns the profile of the signed-in account.
pub struct TelegramGetMeSkill;

#[async_trait]
impl Skill for TelegramGetMeSkill {
    fn name(&self) -> &str {
        "telegram_get_me"
    }

    fn description(&self) -> &str {
        "Get the profile of the Telegram account this skill is signed in as \
         (id, name, usernames, phone number). Fails if sign-in is not complete."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["telegram:session:read".to_string()]
    }

    async fn execute(&self, _params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let user = context.telegram.get_me().await?;
        Ok(serde_json::to_string_pretty(&user)?)
    }
}
