use crate::context::CompiledContext;
use async_trait::async_trait;
use crewgraph_core::{CrewResult, Message, ToolCall};
use crewgraph_skills::SkillDescriptor;
use serde::{Deserialize, Serialize};

/// Everything a model sees for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub node: String,
    pub system_prompt: Option<String>,
    pub context: CompiledContext,
    /// Assistant messages that requested tools earlier in this loop.
    pub transcript: Vec<Message>,
    /// Skills the model may call. Always empty on the final pass.
    pub tools: Vec<SkillDescriptor>,
    pub round: u32,
    pub final_pass: bool,
}

/// A model reply: text, plus any tool calls it wants made.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: content.into(),
            tool_calls,
        }
    }

    pub fn wants_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Model-calling collaborator.
///
/// Implementations talk to a provider (or a local stub). The engine never
/// assumes anything about transport; it only needs a response or an error.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn invoke(&self, request: &ModelRequest) -> CrewResult<ModelResponse>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "backend"
    }
}
