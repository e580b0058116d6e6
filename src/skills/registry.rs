/// Skills registry.
///
/// Holds the skills this plugin exposes, in registration order, and
/// renders them as tool definitions for the host.
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{Skill, SkillContext};

#[derive(Default)]
pub struct SkillRegistry {
    skills: Vec<Box<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a skill. A skill with the same name replaces the earlier one.
    pub fn register(&mut self, skill: Box<dyn Skill>) {
        info!("Registering skill: {}", skill.name());
        self.skills.retain(|s| s.name() != skill.name());
        self.skills.push(skill);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Skill> {
        self.skills
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Tool definitions in the host's format.
    pub fn tool_definitions(&self) -> Vec<Value> {
        self.skills
            .iter()
            .map(|s| {
                json!({
                    "name": s.name(),
                    "description": s.description(),
                    "inputSchema": s.parameters_schema(),
                    "capabilities": s.capabilities(),
                })
            })
            .collect()
    }

    pub async fn execute(&self, name: &str, params: Value, context: &SkillContext) -> Result<String> {
        let skill = self
            .get(name)
            .ok_or_else(|| anyhow!("Unknown tool: {name}"))?;
        debug!("Executing skill {name}");
        skill.execute(params, context).await
    }
}
