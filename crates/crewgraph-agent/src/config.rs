use serde::{Deserialize, Serialize};

/// Limits applied to one node's tool loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolLoopLimits {
    /// Model rounds before the forced synthesis pass. `0` falls back to the default.
    pub max_tool_rounds: u32,
    /// Identical calls (same name and arguments) allowed before they are refused.
    /// `0` disables the guard.
    pub max_repeated_tool_calls: u32,
    pub tool_max_calls: Option<u32>,
    pub tool_max_exec_ms: Option<u64>,
}

impl ToolLoopLimits {
    pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 8;
    pub const DEFAULT_MAX_REPEATED_TOOL_CALLS: u32 = 2;

    pub fn rounds(&self) -> u32 {
        if self.max_tool_rounds == 0 {
            Self::DEFAULT_MAX_TOOL_ROUNDS
        } else {
            self.max_tool_rounds
        }
    }
}

impl Default for ToolLoopLimits {
    fn default() -> Self {
        Self {
            max_tool_rounds: Self::DEFAULT_MAX_TOOL_ROUNDS,
            max_repeated_tool_calls: Self::DEFAULT_MAX_REPEATED_TOOL_CALLS,
            tool_max_calls: None,
            tool_max_exec_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let limits: ToolLoopLimits = from_json("{}");
        assert_eq!(limits, ToolLoopLimits::default());
        assert_eq!(limits.rounds(), 8);
    }

    #[test]
    fn test_zero_rounds_uses_default() {
        let limits = ToolLoopLimits {
            max_tool_rounds: 0,
            ..Default::default()
        };
        assert_eq!(limits.rounds(), ToolLoopLimits::DEFAULT_MAX_TOOL_ROUNDS);
    }

    fn from_json(json: &str) -> ToolLoopLimits {
        serde_json::from_str(json).unwrap()
    }
}
