use crate::budget::BudgetState;
use async_trait::async_trait;
use crewgraph_core::{CrewResult, Kind, ToolCall, ToolResult};
use serde::{Deserialize, Serialize};

/// Metadata describing a skill's interface and how calls to it may be shared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDescriptor {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
    /// Kind of a successful result.
    #[serde(default = "default_produces")]
    pub produces: Kind,
    /// Identical calls within one run may be served from cache.
    #[serde(default)]
    pub cacheable: bool,
    /// Argument naming the external resource a call touches; calls on the
    /// same resource are serialized.
    #[serde(default)]
    pub resource_key_arg: Option<String>,
}

fn default_produces() -> Kind {
    Kind::ToolResult
}

impl SkillDescriptor {
    /// Creates a descriptor with an empty object schema.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters_schema: serde_json::json!({"type": "object"}),
            produces: Kind::ToolResult,
            cacheable: false,
            resource_key_arg: None,
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.parameters_schema = schema;
        self
    }

    pub fn producing(mut self, kind: Kind) -> Self {
        self.produces = kind;
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    pub fn locked_on(mut self, arg: impl Into<String>) -> Self {
        self.resource_key_arg = Some(arg.into());
        self
    }

    /// Cache key for a call, if this skill is cacheable.
    pub fn cache_key(&self, call: &ToolCall) -> Option<String> {
        self.cacheable
            .then(|| format!("v1|name={}|args={}", self.name, call.arguments))
    }

    /// Resource lock key for a call, if the descriptor names a resource argument
    /// and the call supplies it.
    pub fn resource_key(&self, call: &ToolCall) -> Option<String> {
        let arg = self.resource_key_arg.as_deref()?;
        let value = match call.arguments.get(arg)? {
            serde_json::Value::String(s) => s.trim().to_string(),
            other => other.to_string(),
        };
        if value.is_empty() {
            return None;
        }
        Some(format!("{}:{value}", self.name))
    }
}

/// Trait that all skills implement. This is the skill-execution collaborator.
#[async_trait]
pub trait Skill: Send + Sync {
    fn descriptor(&self) -> &SkillDescriptor;

    /// Execute one call. `budget` is a snapshot of the calling node's tool budget.
    async fn execute(&self, call: ToolCall, budget: &BudgetState) -> CrewResult<ToolResult>;
}
