use crewgraph_agent::{ContextBudget, Moment, ToolLoopLimits};
use crewgraph_core::{CrewError, Kind, ToolCall};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// How contributions to the same input port combine.
///
/// `Auto` only exists in declarations; the graph builder resolves it from the
/// channel kind so a built channel never carries it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MergePolicy {
    #[default]
    Auto,
    Latest,
    Append,
    AppendLast(usize),
}

impl MergePolicy {
    /// Concrete policy for a channel of `kind`. Non-`Auto` policies are kept.
    pub fn resolve(self, kind: Kind) -> MergePolicy {
        if self != MergePolicy::Auto {
            return self;
        }
        match kind.category() {
            _ if kind == Kind::ToolError => MergePolicy::AppendLast(4),
            "diagnostic" => MergePolicy::AppendLast(4),
            "summary" | "memory" | "tool" | "artifact" | "code" | "json" | "data" => {
                MergePolicy::AppendLast(3)
            }
            "message" | "text" => MergePolicy::AppendLast(2),
            _ => MergePolicy::Latest,
        }
    }

    /// Character cap used when a port declares neither `max_chars` nor `max_tokens`.
    pub fn default_max_chars(self) -> usize {
        match self {
            MergePolicy::Auto | MergePolicy::Latest | MergePolicy::AppendLast(0 | 1) => 220,
            MergePolicy::AppendLast(2) => 260,
            MergePolicy::AppendLast(3) => 300,
            MergePolicy::AppendLast(_) => 320,
            MergePolicy::Append => 300,
        }
    }

    /// Whether merged text is tagged with its source.
    pub fn is_append(self) -> bool {
        matches!(self, MergePolicy::Append | MergePolicy::AppendLast(_))
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergePolicy::Auto => f.write_str("auto"),
            MergePolicy::Latest => f.write_str("latest"),
            MergePolicy::Append => f.write_str("append"),
            MergePolicy::AppendLast(n) => write!(f, "append_last:{n}"),
        }
    }
}

impl FromStr for MergePolicy {
    type Err = CrewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "" | "auto" => return Ok(MergePolicy::Auto),
            "latest" => return Ok(MergePolicy::Latest),
            "append" => return Ok(MergePolicy::Append),
            "append2" => return Ok(MergePolicy::AppendLast(2)),
            "append3" => return Ok(MergePolicy::AppendLast(3)),
            "append4" => return Ok(MergePolicy::AppendLast(4)),
            _ => {}
        }
        normalized
            .strip_prefix("append_last:")
            .and_then(|n| n.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .map(MergePolicy::AppendLast)
            .ok_or_else(|| CrewError::Config(format!("invalid merge policy: {s}")))
    }
}

impl TryFrom<String> for MergePolicy {
    type Error = CrewError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MergePolicy> for String {
    fn from(value: MergePolicy) -> Self {
        value.to_string()
    }
}

/// A named, typed input slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputPortSpec {
    pub name: String,
    /// Accepted kinds in preference order. Empty means `message/agent`.
    #[serde(default)]
    pub accepts: Vec<Kind>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub merge_policy: MergePolicy,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub max_chars: Option<usize>,
    #[serde(default)]
    pub channel_priority: f64,
}

impl InputPortSpec {
    pub const IMPLICIT: &'static str = "input";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            accepts: Vec::new(),
            required: false,
            merge_policy: MergePolicy::Auto,
            max_tokens: None,
            max_chars: None,
            channel_priority: 0.0,
        }
    }

    pub fn accepting(mut self, kinds: impl IntoIterator<Item = Kind>) -> Self {
        self.accepts = kinds.into_iter().collect();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = Some(max_chars);
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.channel_priority = priority;
        self
    }

    /// Accepted kinds with the `message/agent` default applied.
    pub fn accepted(&self) -> Vec<Kind> {
        if self.accepts.is_empty() {
            vec![Kind::MessageAgent]
        } else {
            self.accepts.clone()
        }
    }

    /// The port's merge policy with `auto` resolved against its first
    /// accepted kind. Every channel into the port shares it.
    pub fn resolved_policy(&self) -> MergePolicy {
        let declared = self.accepted().first().copied().unwrap_or(Kind::MessageAgent);
        self.merge_policy.resolve(declared)
    }

    pub fn accepts_message(&self) -> bool {
        self.accepted().iter().any(|k| k.is_message_like())
    }

    /// Character cap for channels into this port.
    ///
    /// An explicit `max_chars` wins, then `max_tokens * 4` clamped to
    /// `96..=1200`, then the policy default.
    pub fn effective_max_chars(&self, policy: MergePolicy) -> usize {
        if let Some(chars) = self.max_chars.filter(|c| *c > 0) {
            return chars;
        }
        if let Some(tokens) = self.max_tokens.filter(|t| *t > 0) {
            return tokens.saturating_mul(4).clamp(96, 1200);
        }
        policy.default_max_chars()
    }
}

/// A named output slot producing one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputPortSpec {
    pub name: String,
    #[serde(default)]
    pub produces: Kind,
}

impl OutputPortSpec {
    pub const IMPLICIT: &'static str = "output";

    pub fn new(name: impl Into<String>, produces: Kind) -> Self {
        Self {
            name: name.into(),
            produces,
        }
    }
}

/// Caps on what a node pushes downstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublishBudget {
    /// Channels fed per publish. `0` means all.
    pub max_channels: usize,
    /// Token cap on published content. `0` means no cap.
    pub max_channel_tokens: usize,
}

/// A tool call issued before the first model round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartupCall {
    pub skill: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl StartupCall {
    pub fn new(skill: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            skill: skill.into(),
            arguments,
        }
    }

    pub fn to_call(&self, node: &str, index: usize) -> ToolCall {
        let arguments = if self.arguments.is_null() {
            serde_json::json!({})
        } else {
            self.arguments.clone()
        };
        ToolCall::new(format!("{node}-startup-{index}"), self.skill.clone(), arguments)
    }
}

/// Declaration of one agent node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Input port name to producer selectors (`agent` or `agent.port`).
    #[serde(default)]
    pub depends_on_ports: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub inputs: Vec<InputPortSpec>,
    #[serde(default)]
    pub outputs: Vec<OutputPortSpec>,
    #[serde(default)]
    pub moment: Option<Moment>,
    #[serde(default)]
    pub input_prefix: Option<String>,
    #[serde(default)]
    pub input_suffix: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub tool_loop: ToolLoopLimits,
    /// Overrides the runtime context budget for this node.
    #[serde(default)]
    pub context: Option<ContextBudget>,
    #[serde(default)]
    pub publish: PublishBudget,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub startup_calls: Vec<StartupCall>,
    #[serde(default)]
    pub stage_tool_max_calls: Option<u32>,
    #[serde(default)]
    pub stage_tool_max_exec_ms: Option<u64>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            depends_on_ports: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            moment: None,
            input_prefix: None,
            input_suffix: None,
            system_prompt: None,
            skills: Vec::new(),
            tool_loop: ToolLoopLimits::default(),
            context: None,
            publish: PublishBudget::default(),
            timeout_ms: None,
            startup_calls: Vec::new(),
            stage_tool_max_calls: None,
            stage_tool_max_exec_ms: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_port_selectors<I, S>(mut self, port: impl Into<String>, selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on_ports
            .entry(port.into())
            .or_default()
            .extend(selectors.into_iter().map(Into::into));
        self
    }

    pub fn with_input(mut self, port: InputPortSpec) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn with_output(mut self, port: OutputPortSpec) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn with_moment(mut self, moment: Moment) -> Self {
        self.moment = Some(moment);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_input_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.input_prefix = Some(prefix.into());
        self
    }

    pub fn with_input_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.input_suffix = Some(suffix.into());
        self
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills.extend(skills.into_iter().map(Into::into));
        self
    }

    pub fn with_limits(mut self, limits: ToolLoopLimits) -> Self {
        self.tool_loop = limits;
        self
    }

    pub fn with_context_budget(mut self, budget: ContextBudget) -> Self {
        self.context = Some(budget);
        self
    }

    pub fn with_publish_budget(mut self, budget: PublishBudget) -> Self {
        self.publish = budget;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_startup_call(mut self, call: StartupCall) -> Self {
        self.startup_calls.push(call);
        self
    }

    pub fn with_stage_tool_budget(mut self, max_calls: Option<u32>, max_exec_ms: Option<u64>) -> Self {
        self.stage_tool_max_calls = max_calls;
        self.stage_tool_max_exec_ms = max_exec_ms;
        self
    }

    /// Declared moment, or one inferred from the node's name and skills.
    pub fn effective_moment(&self) -> Moment {
        if let Some(moment) = self.moment {
            return moment;
        }
        let name = self.name.to_lowercase();
        if name.contains("review") || name.contains("lint") {
            Moment::Validate
        } else if !self.skills.is_empty() {
            Moment::ToolLoop
        } else {
            Moment::Synthesis
        }
    }

    pub fn startup_tool_calls(&self) -> Vec<ToolCall> {
        self.startup_calls
            .iter()
            .enumerate()
            .map(|(i, c)| c.to_call(&self.name, i))
            .collect()
    }
}

/// Status of a node within one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Completed,
    Failed { reason: String },
    Skipped { reason: String },
}

impl NodeStatus {
    pub fn failed(reason: impl Into<String>) -> Self {
        NodeStatus::Failed {
            reason: reason.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        NodeStatus::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, NodeStatus::Completed)
    }

    /// Failed or skipped.
    pub fn is_unsuccessful(&self) -> bool {
        matches!(self, NodeStatus::Failed { .. } | NodeStatus::Skipped { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            NodeStatus::Failed { reason } | NodeStatus::Skipped { reason } => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Pending => f.write_str("pending"),
            NodeStatus::Ready => f.write_str("ready"),
            NodeStatus::Running => f.write_str("running"),
            NodeStatus::Completed => f.write_str("completed"),
            NodeStatus::Failed { reason } => write!(f, "failed ({reason})"),
            NodeStatus::Skipped { reason } => write!(f, "skipped ({reason})"),
        }
    }
}
