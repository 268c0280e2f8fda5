use crate::kind::Kind;
use serde::{Deserialize, Serialize};

/// A request from the model to invoke a specific tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier assigned by the model for this tool call.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// JSON arguments to pass to the tool.
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Creates a tool call.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Identity of the call ignoring its id: name plus canonical JSON arguments.
    ///
    /// `serde_json` keeps object keys sorted, so two calls with the same
    /// arguments in a different key order share a fingerprint.
    pub fn fingerprint(&self) -> String {
        format!("{}|{}", self.name.trim(), self.arguments)
    }
}

/// The result returned after executing a [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The ID of the [`ToolCall`] this result corresponds to.
    pub call_id: String,
    /// The textual output produced by the tool.
    pub content: String,
    /// Whether the tool execution ended in an error.
    pub is_error: bool,
    /// Type tag of the content, consumed by the context compiler.
    #[serde(default = "default_result_kind")]
    pub kind: Kind,
}

fn default_result_kind() -> Kind {
    Kind::ToolResult
}

impl ToolResult {
    /// Creates a successful tool result tagged `tool/result`.
    pub fn success(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
            kind: Kind::ToolResult,
        }
    }

    /// Creates an error tool result tagged `tool/error`.
    pub fn error(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: true,
            kind: Kind::ToolError,
        }
    }

    /// Re-tag a successful result with a more specific kind.
    pub fn with_kind(mut self, kind: Kind) -> Self {
        if !self.is_error {
            self.kind = kind;
        }
        self
    }
}
