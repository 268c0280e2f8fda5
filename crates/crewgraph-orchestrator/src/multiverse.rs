//! Multiverse runs: several staged graphs ("universes") side by side.
//!
//! Universes are nodes of an outer graph built by the same [`GraphBuilder`]
//! and driven by the same [`Scheduler`] as agent graphs. A universe runs its
//! inner graph to completion and publishes its sink outputs on its output
//! port; universes that depend on it get a `[multiverse_handoffs]` block in
//! their input. An optional judge agent compares the finished branches.

use crate::engine::{failure_marker, wrap_input, AgentNodeExecutor, GraphRunner};
use crate::graph::{Channel, Graph, GraphBuilder, GraphNode, GraphTrace};
use crate::judge::JudgeDecision;
use crate::monitor::{NoopObserver, RunObserver};
use crate::scheduler::{NodeExecutor, NodeInput, NodeOutput, RunReport, Scheduler};
use crate::types::{InputPortSpec, MergePolicy, NodeSpec, NodeStatus, OutputPortSpec};
use async_trait::async_trait;
use crewgraph_agent::ContextUnit;
use crewgraph_core::text::truncate_chars;
use crewgraph_core::{CrewError, CrewResult, Kind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Node name of the judge in the outer graph.
pub const JUDGE_NODE: &str = "judge";

/// Channel name of the comparison prompt handed to the judge.
pub const COMPARE_CHANNEL: &str = "multiverse_compare_request";

const GOAL_MAX_CHARS: usize = 600;
const FINGERPRINT_LEN: usize = 12;

fn default_input_port() -> String {
    "context".into()
}

fn default_output_port() -> String {
    "result".into()
}

fn default_output_kind() -> Kind {
    Kind::SummaryText
}

fn default_merge_policy() -> MergePolicy {
    MergePolicy::Append
}

fn default_handoff_max_chars() -> usize {
    260
}

fn default_max_chars_per_branch() -> usize {
    600
}

/// One branch of a crew.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UniverseSpec {
    /// Defaults to `u{n}`, 1-based by position.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Staged expression over the configured agents, e.g. `planner>coder`.
    pub spec: String,
    /// Replaces the run input for this universe.
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub input_prefix: Option<String>,
    #[serde(default)]
    pub input_suffix: Option<String>,
    /// Ids or labels of other universes, matched case-insensitively.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_input_port")]
    pub input_port: String,
    #[serde(default = "default_output_port")]
    pub output_port: String,
    #[serde(default = "default_output_kind")]
    pub output_kind: Kind,
    #[serde(default = "default_merge_policy")]
    pub merge_policy: MergePolicy,
    #[serde(default = "default_handoff_max_chars")]
    pub handoff_max_chars: usize,
}

impl UniverseSpec {
    pub fn new(spec: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            label: None,
            spec: spec.into(),
            input: None,
            input_prefix: None,
            input_suffix: None,
            depends_on: Vec::new(),
            input_port: default_input_port(),
            output_port: default_output_port(),
            output_kind: default_output_kind(),
            merge_policy: default_merge_policy(),
            handoff_max_chars: default_handoff_max_chars(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
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

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_output_kind(mut self, kind: Kind) -> Self {
        self.output_kind = kind;
        self
    }

    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_handoff_max_chars(mut self, max_chars: usize) -> Self {
        self.handoff_max_chars = max_chars;
        self
    }

    /// `label (id)`, or just the id.
    pub fn display_name(&self) -> String {
        match self.label.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
            Some(label) => format!("{label} ({})", self.id),
            None => self.id.clone(),
        }
    }
}

/// Judge agent comparing the finished universes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JudgeSpec {
    pub agent: String,
    #[serde(default = "default_max_chars_per_branch")]
    pub max_chars_per_branch: usize,
}

impl JudgeSpec {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            max_chars_per_branch: default_max_chars_per_branch(),
        }
    }
}

/// A named set of universes plus an optional judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrewSpec {
    pub name: String,
    pub universes: Vec<UniverseSpec>,
    #[serde(default)]
    pub judge: Option<JudgeSpec>,
    /// Used when the run input is blank.
    #[serde(default)]
    pub input: Option<String>,
}

impl CrewSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            universes: Vec::new(),
            judge: None,
            input: None,
        }
    }

    pub fn with_universe(mut self, universe: UniverseSpec) -> Self {
        self.universes.push(universe);
        self
    }

    pub fn with_judge(mut self, judge: JudgeSpec) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Universes with default ids filled in and dependencies rewritten to ids.
    pub fn resolved_universes(&self) -> CrewResult<Vec<UniverseSpec>> {
        let mut universes = self.universes.clone();
        let mut ids = HashSet::new();
        for (i, universe) in universes.iter_mut().enumerate() {
            let id = universe.id.trim();
            universe.id = if id.is_empty() {
                format!("u{}", i + 1)
            } else {
                id.to_string()
            };
            if universe.spec.trim().is_empty() {
                return Err(CrewError::Config(format!(
                    "crew '{}': universe '{}' has an empty spec",
                    self.name, universe.id
                )));
            }
            let label = universe.label.as_deref().map(|l| l.trim().to_lowercase());
            if universe.id.to_lowercase() == JUDGE_NODE || label.as_deref() == Some(JUDGE_NODE) {
                return Err(CrewError::Structural(vec![format!(
                    "crew '{}': universe '{}' collides with the '{JUDGE_NODE}' node",
                    self.name,
                    universe.display_name()
                )]));
            }
            if !ids.insert(universe.id.to_lowercase()) {
                return Err(CrewError::Config(format!(
                    "crew '{}': duplicate universe id '{}'",
                    self.name, universe.id
                )));
            }
        }

        let keys: Vec<(String, Option<String>)> = universes
            .iter()
            .map(|u| (u.id.clone(), u.label.as_ref().map(|l| l.trim().to_lowercase())))
            .collect();
        for universe in &mut universes {
            let mut resolved = Vec::new();
            for dep in &universe.depends_on {
                let wanted = dep.trim().to_lowercase();
                let (id, _) = keys
                    .iter()
                    .find(|(id, label)| id.to_lowercase() == wanted || label.as_deref() == Some(wanted.as_str()))
                    .ok_or_else(|| {
                        CrewError::Config(format!(
                            "crew '{}': universe '{}' depends on unknown universe '{dep}'",
                            self.name, universe.id
                        ))
                    })?;
                if !resolved.contains(id) {
                    resolved.push(id.clone());
                }
            }
            universe.depends_on = resolved;
        }
        Ok(universes)
    }
}

/// A universe as a node of the outer graph.
#[derive(Debug, Clone)]
pub struct UniverseNode {
    pub spec: UniverseSpec,
    inputs: Vec<InputPortSpec>,
    outputs: Vec<OutputPortSpec>,
}

impl UniverseNode {
    /// `upstream` holds the output kinds of the universes this one depends on.
    pub fn new(spec: UniverseSpec, upstream: impl IntoIterator<Item = Kind>) -> Self {
        let mut accepts: Vec<Kind> = Vec::new();
        for kind in upstream.into_iter().chain([Kind::MessageAgent]) {
            if !accepts.contains(&kind) {
                accepts.push(kind);
            }
        }
        let input = InputPortSpec::new(spec.input_port.clone())
            .accepting(accepts)
            .with_policy(spec.merge_policy)
            .with_max_chars(spec.handoff_max_chars);
        let output = OutputPortSpec::new(spec.output_port.clone(), spec.output_kind);
        Self {
            spec,
            inputs: vec![input],
            outputs: vec![output],
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }
}

/// The judge as a node of the outer graph.
#[derive(Debug, Clone)]
pub struct JudgeNode {
    pub agent: NodeSpec,
    pub max_chars_per_branch: usize,
    depends_on: Vec<String>,
    inputs: Vec<InputPortSpec>,
    outputs: Vec<OutputPortSpec>,
}

impl JudgeNode {
    /// Input port receiving one contribution per finished branch.
    pub const PORT: &'static str = "branches";

    pub fn new(
        agent: NodeSpec,
        branches: impl IntoIterator<Item = (String, Kind)>,
        max_chars_per_branch: usize,
    ) -> Self {
        let mut depends_on = Vec::new();
        let mut accepts = Vec::new();
        for (id, kind) in branches {
            depends_on.push(id);
            if !accepts.contains(&kind) {
                accepts.push(kind);
            }
        }
        if !accepts.contains(&Kind::MessageAgent) {
            accepts.push(Kind::MessageAgent);
        }
        let input = InputPortSpec::new(Self::PORT)
            .accepting(accepts)
            .with_policy(MergePolicy::Append)
            .with_max_chars(max_chars_per_branch);
        Self {
            agent,
            max_chars_per_branch,
            depends_on,
            inputs: vec![input],
            outputs: vec![OutputPortSpec::new("verdict", Kind::SummaryText)],
        }
    }
}

/// Node type of the outer multiverse graph.
#[derive(Debug, Clone)]
pub enum CrewNode {
    Universe(UniverseNode),
    Judge(JudgeNode),
}

impl GraphNode for CrewNode {
    fn name(&self) -> &str {
        match self {
            CrewNode::Universe(u) => u.id(),
            CrewNode::Judge(_) => JUDGE_NODE,
        }
    }

    fn depends_on(&self) -> &[String] {
        match self {
            CrewNode::Universe(u) => &u.spec.depends_on,
            CrewNode::Judge(j) => &j.depends_on,
        }
    }

    fn inputs(&self) -> &[InputPortSpec] {
        match self {
            CrewNode::Universe(u) => &u.inputs,
            CrewNode::Judge(j) => &j.inputs,
        }
    }

    fn outputs(&self) -> &[OutputPortSpec] {
        match self {
            CrewNode::Universe(u) => &u.outputs,
            CrewNode::Judge(j) => &j.outputs,
        }
    }

    fn timeout(&self) -> Option<Duration> {
        match self {
            CrewNode::Universe(_) => None,
            CrewNode::Judge(j) => j.agent.timeout(),
        }
    }
}

/// Output of one sink agent of a universe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkOutput {
    pub agent: String,
    pub text: String,
}

/// First twelve hex characters of SHA-256 over the sink outputs.
pub fn sink_fingerprint(sinks: &[SinkOutput]) -> String {
    let mut hasher = Sha256::new();
    for sink in sinks {
        hasher.update(sink.agent.as_bytes());
        hasher.update([0u8]);
        hasher.update(sink.text.as_bytes());
        hasher.update([b'\n']);
    }
    let mut fp = hex::encode(hasher.finalize());
    fp.truncate(FINGERPRINT_LEN);
    fp
}

fn render_sinks(sinks: &[SinkOutput]) -> String {
    match sinks {
        [only] => only.text.clone(),
        _ => sinks
            .iter()
            .map(|s| format!("[{}]\n{}", s.agent, s.text))
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

/// Whitespace collapsed to single spaces, then truncated.
fn clip_line(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if max_chars == 0 {
        return collapsed;
    }
    truncate_chars(&collapsed, max_chars).0.into_owned()
}

fn quote_inline(text: &str) -> String {
    format!("\"{}\"", text.trim().replace('\\', "\\\\").replace('"', "\\\""))
}

fn push_sinks(lines: &mut Vec<String>, sinks: &[SinkOutput], max_chars: usize) {
    lines.push("  sink_outputs:".into());
    if sinks.is_empty() {
        lines.push("    - agent: none".into());
        lines.push("      text: \"\"".into());
        return;
    }
    for sink in sinks {
        lines.push(format!("    - agent: {}", sink.agent));
        lines.push("      text: |".into());
        lines.push(format!("        {}", clip_line(&sink.text, max_chars)));
    }
}

/// What a finished universe left behind for its dependents and the report.
#[derive(Debug, Clone, Default)]
struct UniverseOutcome {
    sinks: Vec<SinkOutput>,
    fingerprint: Option<String>,
    error: Option<String>,
    report: Option<RunReport>,
    duration_ms: u64,
}

struct CrewExecutor {
    agents: Vec<NodeSpec>,
    runner: GraphRunner,
    judge_runner: AgentNodeExecutor,
    crew: String,
    goal: String,
    universes: Vec<UniverseSpec>,
    channels: Vec<Channel>,
    outcomes: Arc<Mutex<HashMap<String, UniverseOutcome>>>,
}

impl CrewExecutor {
    fn universe(&self, id: &str) -> Option<&UniverseSpec> {
        self.universes.iter().find(|u| u.id == id)
    }

    fn record(&self, id: &str, outcome: UniverseOutcome) {
        self.outcomes.lock().insert(id.to_string(), outcome);
    }

    /// `[multiverse_handoffs]` block for `node`, or `None` when nothing upstream finished.
    fn handoff_block(&self, node: &UniverseNode, input: &NodeInput) -> Option<String> {
        let resolved = input.input(&node.spec.input_port)?;
        let into: Vec<&Channel> = self
            .channels
            .iter()
            .filter(|c| c.to_node == node.id() && c.to_port == node.spec.input_port)
            .collect();
        let outcomes = self.outcomes.lock();

        let selected: Vec<&Channel> = match resolved.policy {
            MergePolicy::Auto | MergePolicy::Latest => {
                let newest = resolved.contributions.last()?;
                into.into_iter().filter(|c| c.id == newest.channel).collect()
            }
            MergePolicy::Append => into
                .into_iter()
                .filter(|c| outcomes.contains_key(&c.from_node))
                .collect(),
            MergePolicy::AppendLast(n) => {
                let finished: Vec<&Channel> = into
                    .into_iter()
                    .filter(|c| outcomes.contains_key(&c.from_node))
                    .collect();
                let skip = finished.len().saturating_sub(n.max(1));
                finished.into_iter().skip(skip).collect()
            }
        };
        if selected.is_empty() {
            return None;
        }

        let mut lines = vec![
            "[multiverse_handoffs]".to_string(),
            format!("kind: {}", Kind::ContextCompiled),
            format!("target: {}", node.spec.display_name()),
        ];
        for channel in selected {
            let Some(outcome) = outcomes.get(&channel.from_node) else {
                continue;
            };
            let from = self
                .universe(&channel.from_node)
                .map_or_else(|| channel.from_node.clone(), UniverseSpec::display_name);
            lines.push(format!("- channel: {}", channel.id));
            lines.push(format!("  kind: {}", channel.kind));
            lines.push(format!("  from: {}", quote_inline(&from)));
            if let Some(error) = &outcome.error {
                lines.push("  status: error".into());
                lines.push(format!("  error: {}", quote_inline(error)));
                continue;
            }
            lines.push("  status: ok".into());
            if let Some(fp) = &outcome.fingerprint {
                lines.push(format!("  sink_fingerprint: {fp}"));
            }
            push_sinks(&mut lines, &outcome.sinks, channel.max_chars);
        }
        Some(lines.join("\n"))
    }

    /// `[multiverse_compare_request]` prompt listing every branch.
    fn compare_request(&self, max_chars_per_branch: usize) -> String {
        let outcomes = self.outcomes.lock();
        let mut lines = vec![
            "[multiverse_compare_request]".to_string(),
            format!("type: {}", Kind::PlanSummary),
            format!("crew: {}", self.crew),
        ];
        if !self.goal.trim().is_empty() {
            lines.push("goal:".into());
            lines.push(clip_line(&self.goal, GOAL_MAX_CHARS));
        }
        lines.push("instruction:".into());
        lines.push("Compare the branch outputs and choose the best branch for the goal.".into());
        lines.push("Be explicit about tradeoffs, risks, and why other branches were not selected.".into());
        lines.push(
            r#"Return JSON when possible: {"winner":"u1","reason":"...","diffs":["..."],"risk":"...","followups":["..."]}"#
                .into(),
        );
        lines.push("If uncertain, set winner to a branch id or label and explain in reason.".into());
        lines.push("branches:".into());
        for universe in &self.universes {
            lines.push(format!("- id: {}", universe.id));
            lines.push(format!("  label: {}", universe.display_name()));
            lines.push(format!("  spec: {}", quote_inline(&universe.spec)));
            let Some(outcome) = outcomes.get(&universe.id) else {
                lines.push("  status: error".into());
                lines.push(format!("  error: {}", quote_inline("did not run")));
                continue;
            };
            lines.push(format!("  duration_ms: {}", outcome.duration_ms));
            if let Some(error) = &outcome.error {
                lines.push("  status: error".into());
                lines.push(format!("  error: {}", quote_inline(error)));
                continue;
            }
            lines.push("  status: ok".into());
            push_sinks(&mut lines, &outcome.sinks, max_chars_per_branch);
            if let Some(fp) = &outcome.fingerprint {
                lines.push(format!("  sink_fingerprint: {fp}"));
            }
        }
        lines.push(format!("return_type_hint: {}", Kind::SummaryText));
        lines.join("\n")
    }

    async fn run_universe(&self, node: &UniverseNode, input: NodeInput) -> CrewResult<NodeOutput> {
        let spec = &node.spec;
        let base = wrap_input(
            spec.input_prefix.as_deref(),
            spec.input.as_deref().unwrap_or(&self.goal),
            spec.input_suffix.as_deref(),
        );
        let combined = match self.handoff_block(node, &input) {
            Some(block) if base.is_empty() => block,
            Some(block) => format!("{base}\n\n{block}"),
            None => base,
        };

        let started = Instant::now();
        let result = self
            .runner
            .run_spec(&self.agents, &spec.spec, &combined, input.cancel.clone())
            .await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                self.record(
                    node.id(),
                    UniverseOutcome {
                        error: Some(e.to_string()),
                        duration_ms,
                        ..UniverseOutcome::default()
                    },
                );
                return Err(e);
            }
        };

        let sinks: Vec<SinkOutput> = report
            .sink_outputs()
            .into_iter()
            .map(|(agent, text)| SinkOutput {
                agent: agent.to_string(),
                text: text.trim().to_string(),
            })
            .collect();
        if sinks.is_empty() {
            let err = if report.cancelled {
                CrewError::Cancelled(format!("universe '{}' was cancelled", node.id()))
            } else {
                CrewError::Orchestrator(format!("universe '{}': no sink agent completed", node.id()))
            };
            self.record(
                node.id(),
                UniverseOutcome {
                    error: Some(err.to_string()),
                    report: Some(report),
                    duration_ms,
                    ..UniverseOutcome::default()
                },
            );
            return Err(err);
        }

        let output = NodeOutput {
            content: render_sinks(&sinks),
            warnings: report
                .results
                .iter()
                .flat_map(|r| r.warnings.iter().map(move |w| format!("{}: {w}", r.node)))
                .collect(),
            rounds: report.results.iter().map(|r| r.rounds).sum(),
            cache_hits: report.results.iter().map(|r| r.cache_hits).sum(),
            ..NodeOutput::default()
        };
        let fingerprint = sink_fingerprint(&sinks);
        info!(universe = %node.id(), sinks = sinks.len(), fingerprint = %fingerprint, duration_ms, "Universe completed");
        self.record(
            node.id(),
            UniverseOutcome {
                sinks,
                fingerprint: Some(fingerprint),
                error: None,
                report: Some(report),
                duration_ms,
            },
        );
        Ok(output)
    }

    async fn run_judge(&self, node: &JudgeNode, input: NodeInput) -> CrewResult<NodeOutput> {
        let mut units = Vec::new();
        if let Some(branches) = input.input(JudgeNode::PORT) {
            for payload in &branches.contributions {
                units.push(
                    ContextUnit::new(
                        payload.channel.clone(),
                        payload.from_node.clone(),
                        payload.kind,
                        payload.content.to_string(),
                    )
                    .required(true),
                );
            }
        }
        for upstream in input.unsuccessful_upstream() {
            units.push(failure_marker(&upstream.node, &upstream.status));
        }
        units.push(
            ContextUnit::new(
                COMPARE_CHANNEL,
                JUDGE_NODE,
                Kind::PlanSummary,
                self.compare_request(node.max_chars_per_branch),
            )
            .required(true)
            .with_priority(1.0),
        );
        self.judge_runner.run_units(&node.agent, units, &input).await
    }
}

#[async_trait]
impl NodeExecutor<CrewNode> for CrewExecutor {
    async fn execute(&self, node: &CrewNode, input: NodeInput) -> CrewResult<NodeOutput> {
        match node {
            CrewNode::Universe(universe) => self.run_universe(universe, input).await,
            CrewNode::Judge(judge) => self.run_judge(judge, input).await,
        }
    }
}

/// Result of one universe.
#[derive(Debug, Clone, Serialize)]
pub struct UniverseReport {
    pub id: String,
    pub label: Option<String>,
    pub spec: String,
    pub status: NodeStatus,
    pub output: Option<String>,
    pub sinks: Vec<SinkOutput>,
    pub fingerprint: Option<String>,
    pub duration_ms: u64,
    /// Inner run, when the inner graph was built.
    pub report: Option<RunReport>,
}

impl UniverseReport {
    pub fn display_name(&self) -> String {
        match self.label.as_deref().filter(|l| !l.trim().is_empty()) {
            Some(label) => format!("{label} ({})", self.id),
            None => self.id.clone(),
        }
    }
}

/// The judge's verdict.
#[derive(Debug, Clone, Serialize)]
pub struct JudgeReport {
    pub agent: String,
    pub status: NodeStatus,
    pub output: Option<String>,
    pub decision: Option<JudgeDecision>,
    /// Universe id the decision resolved to.
    pub winner: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiverseReport {
    pub crew: String,
    /// In declaration order.
    pub universes: Vec<UniverseReport>,
    pub judge: Option<JudgeReport>,
    /// The outer run over universes and judge.
    pub outer: RunReport,
}

impl MultiverseReport {
    pub fn universe(&self, id: &str) -> Option<&UniverseReport> {
        self.universes.iter().find(|u| u.id == id)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &UniverseReport> {
        self.universes.iter().filter(|u| u.status.is_completed())
    }

    pub fn winner(&self) -> Option<&UniverseReport> {
        let id = self.judge.as_ref()?.winner.as_deref()?;
        self.universe(id)
    }

    /// Every branch with its status and output.
    pub fn side_by_side(&self) -> String {
        self.universes
            .iter()
            .map(|u| {
                let body = match (&u.status, u.output.as_deref()) {
                    (NodeStatus::Completed, Some(output)) => output.to_string(),
                    (status, _) => format!("({status})"),
                };
                format!("=== {} [{}] {} ===\n{body}", u.display_name(), u.spec, u.status)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

impl fmt::Display for MultiverseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "crew {}", self.crew)?;
        writeln!(f, "{}", self.side_by_side())?;
        if let Some(judge) = &self.judge {
            writeln!(f)?;
            writeln!(f, "judge {} {}", judge.agent, judge.status)?;
            if let Some(winner) = &judge.winner {
                writeln!(f, "winner: {winner}")?;
            }
            if let Some(reason) = judge.decision.as_ref().and_then(|d| d.reason.as_deref()) {
                writeln!(f, "reason: {reason}")?;
            }
        }
        Ok(())
    }
}

/// Inner trace of one universe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UniverseTrace {
    pub id: String,
    pub spec: String,
    pub trace: GraphTrace,
}

/// Outer universe graph plus the inner graph of each universe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultiverseTrace {
    pub crew: String,
    pub outer: GraphTrace,
    pub universes: Vec<UniverseTrace>,
}

impl fmt::Display for MultiverseTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "crew {}", self.crew)?;
        write!(f, "{}", self.outer)?;
        for universe in &self.universes {
            writeln!(f, "universe {} ({})", universe.id, universe.spec)?;
            for line in universe.trace.to_string().lines() {
                writeln!(f, "  {line}")?;
            }
        }
        Ok(())
    }
}

/// Runs crews of universes over a fixed set of agents.
pub struct MultiverseOrchestrator {
    agents: Vec<NodeSpec>,
    runner: GraphRunner,
    observer: Arc<dyn RunObserver>,
}

impl MultiverseOrchestrator {
    pub fn new(agents: Vec<NodeSpec>, runner: GraphRunner) -> Self {
        Self {
            agents,
            runner,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Observer for the outer run; inner runs use the runner's observer.
    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn agents(&self) -> &[NodeSpec] {
        &self.agents
    }

    /// Outer graph of `crew` along with its resolved universes.
    pub fn plan(&self, crew: &CrewSpec) -> CrewResult<(Vec<UniverseSpec>, Graph<CrewNode>)> {
        let universes = crew.resolved_universes()?;
        let kinds: HashMap<&str, Kind> = universes
            .iter()
            .map(|u| (u.id.as_str(), u.output_kind))
            .collect();

        let mut nodes: Vec<CrewNode> = universes
            .iter()
            .map(|u| {
                let upstream = u.depends_on.iter().filter_map(|d| kinds.get(d.as_str()).copied());
                CrewNode::Universe(UniverseNode::new(u.clone(), upstream))
            })
            .collect();

        if let Some(judge) = &crew.judge {
            let agent = self
                .agents
                .iter()
                .find(|a| a.name == judge.agent)
                .cloned()
                .ok_or_else(|| {
                    CrewError::Config(format!(
                        "crew '{}' judge references unknown agent '{}'",
                        crew.name, judge.agent
                    ))
                })?;
            let upstream: HashSet<&str> = universes
                .iter()
                .flat_map(|u| u.depends_on.iter().map(String::as_str))
                .collect();
            let terminal = universes
                .iter()
                .filter(|u| !upstream.contains(u.id.as_str()))
                .map(|u| (u.id.clone(), u.output_kind));
            nodes.push(CrewNode::Judge(JudgeNode::new(agent, terminal, judge.max_chars_per_branch)));
        }

        let graph = GraphBuilder::new().nodes(nodes).build()?;
        Ok((universes, graph))
    }

    /// Outer and inner traces without running anything.
    pub fn trace(&self, crew: &CrewSpec) -> CrewResult<MultiverseTrace> {
        let (universes, graph) = self.plan(crew)?;
        let inner = universes
            .iter()
            .map(|u| {
                Ok(UniverseTrace {
                    id: u.id.clone(),
                    spec: u.spec.clone(),
                    trace: self.runner.trace_spec(&self.agents, &u.spec)?,
                })
            })
            .collect::<CrewResult<Vec<_>>>()?;
        Ok(MultiverseTrace {
            crew: crew.name.clone(),
            outer: graph.trace(),
            universes: inner,
        })
    }

    /// Run every universe of `crew`, then the judge if one is configured.
    ///
    /// A failing universe never stops its siblings. With a judge, the run
    /// fails when no universe succeeded.
    pub async fn run(
        &self,
        crew: &CrewSpec,
        input: &str,
        cancel: CancellationToken,
    ) -> CrewResult<MultiverseReport> {
        let (universes, graph) = self.plan(crew)?;
        let goal = if input.trim().is_empty() {
            crew.input.clone().unwrap_or_default()
        } else {
            input.to_string()
        };
        info!(
            crew = %crew.name,
            universes = universes.len(),
            judge = crew.judge.is_some(),
            stages = graph.stages().len(),
            "Running multiverse"
        );

        let outcomes = Arc::new(Mutex::new(HashMap::new()));
        let executor = CrewExecutor {
            agents: self.agents.clone(),
            runner: self.runner.clone(),
            judge_runner: self.runner.executor(&goal),
            crew: crew.name.clone(),
            goal,
            universes: universes.clone(),
            channels: graph.channels().to_vec(),
            outcomes: Arc::clone(&outcomes),
        };
        let runtime = self.runner.runtime();
        let outer = Scheduler::new(graph, executor)
            .with_concurrency_limit(runtime.concurrency_limit)
            .with_run_timeout(runtime.run_timeout())
            .with_observer(Arc::clone(&self.observer))
            .with_cancel(cancel)
            .run()
            .await;

        let mut outcomes = std::mem::take(&mut *outcomes.lock());
        let reports: Vec<UniverseReport> = universes
            .iter()
            .map(|u| {
                let outcome = outcomes.remove(&u.id).unwrap_or_default();
                UniverseReport {
                    id: u.id.clone(),
                    label: u.label.clone(),
                    spec: u.spec.clone(),
                    status: outer.status(&u.id).cloned().unwrap_or_default(),
                    output: outer.output(&u.id).map(str::to_string),
                    sinks: outcome.sinks,
                    fingerprint: outcome.fingerprint,
                    duration_ms: outcome.duration_ms,
                    report: outcome.report,
                }
            })
            .collect();
        let succeeded = reports.iter().filter(|u| u.status.is_completed()).count();

        let judge = crew.judge.as_ref().map(|spec| {
            let output = outer.output(JUDGE_NODE).map(str::to_string);
            let decision = output.as_deref().and_then(JudgeDecision::parse);
            let branches: Vec<(String, String)> = universes
                .iter()
                .map(|u| (u.id.clone(), u.label.clone().unwrap_or_default()))
                .collect();
            let winner = decision
                .as_ref()
                .and_then(|d| d.resolve_winner(&branches))
                .map(str::to_string);
            if output.is_some() && winner.is_none() {
                warn!(crew = %crew.name, "Judge verdict did not name a known universe");
            }
            JudgeReport {
                agent: spec.agent.clone(),
                status: outer.status(JUDGE_NODE).cloned().unwrap_or_default(),
                output,
                decision,
                winner,
            }
        });

        if judge.is_some() && succeeded == 0 {
            return Err(if outer.cancelled {
                CrewError::Cancelled(format!("crew '{}' was cancelled", crew.name))
            } else {
                CrewError::Orchestrator(format!("crew '{}': no universe succeeded", crew.name))
            });
        }

        info!(
            crew = %crew.name,
            succeeded,
            failed = reports.len() - succeeded,
            duration_ms = outer.duration_ms,
            "Multiverse finished"
        );
        Ok(MultiverseReport {
            crew: crew.name.clone(),
            universes: reports,
            judge,
            outer,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::BackendFactory;
    use crewgraph_agent::{LlmBackend, ModelRequest, ModelResponse};
    use crewgraph_skills::{SkillRegistry, ToolBroker};

    /// Answers by agent name; `broken` always errors, `judge` picks `u2`.
    struct Scripted {
        name: String,
    }

    #[async_trait]
    impl LlmBackend for Scripted {
        async fn invoke(&self, request: &ModelRequest) -> CrewResult<ModelResponse> {
            let text = &request.context.text;
            match self.name.as_str() {
                "broken" => Err(CrewError::Backend("provider down".into())),
                "judge" => {
                    assert!(text.contains("[multiverse_compare_request]"));
                    Ok(ModelResponse::text(
                        r#"{"winner": "Careful", "reason": "covers edge cases"}"#,
                    ))
                }
                "reviewer" => Ok(ModelResponse::text(format!(
                    "review handoffs={} fingerprint={}",
                    text.contains("[multiverse_handoffs]"),
                    text.contains("sink_fingerprint:")
                ))),
                other => Ok(ModelResponse::text(format!("{other} done"))),
            }
        }
    }

    fn orchestrator() -> MultiverseOrchestrator {
        let factory: BackendFactory = Arc::new(|node: &NodeSpec| {
            Arc::new(Scripted {
                name: node.name.clone(),
            }) as Arc<dyn LlmBackend>
        });
        let runner = GraphRunner::new(factory, Arc::new(ToolBroker::new(Arc::new(SkillRegistry::new()))));
        let agents = ["planner", "coder", "reviewer", "broken", "judge"]
            .into_iter()
            .map(NodeSpec::new)
            .collect();
        MultiverseOrchestrator::new(agents, runner)
    }

    #[test]
    fn test_resolved_universes_fill_ids_and_match_labels() {
        let crew = CrewSpec::new("c")
            .with_universe(UniverseSpec::new("planner").with_label("Fast"))
            .with_universe(UniverseSpec::new("coder").with_id("careful").depends_on(["FAST"]));
        let universes = crew.resolved_universes().unwrap();
        assert_eq!(universes[0].id, "u1");
        assert_eq!(universes[1].depends_on, vec!["u1"]);
        assert_eq!(universes[0].display_name(), "Fast (u1)");

        let bad = CrewSpec::new("c").with_universe(UniverseSpec::new("planner").depends_on(["ghost"]));
        assert!(matches!(bad.resolved_universes(), Err(CrewError::Config(m)) if m.contains("ghost")));
    }

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        let sinks = vec![SinkOutput {
            agent: "coder".into(),
            text: "fn main() {}".into(),
        }];
        let fp = sink_fingerprint(&sinks);
        assert_eq!(fp.len(), 12);
        assert_eq!(fp, sink_fingerprint(&sinks.clone()));
        assert_ne!(fp, sink_fingerprint(&[]));
    }

    #[test]
    fn test_universe_cycle_is_structural() {
        let crew = CrewSpec::new("c")
            .with_universe(UniverseSpec::new("planner").with_id("a").depends_on(["b"]))
            .with_universe(UniverseSpec::new("coder").with_id("b").depends_on(["a"]));
        let err = orchestrator().plan(&crew).unwrap_err();
        assert!(matches!(err, CrewError::Structural(issues) if issues.iter().any(|i| i.contains("cycle"))));
    }

    #[test]
    fn test_universe_cannot_take_the_judge_name() {
        let by_id = CrewSpec::new("c").with_universe(UniverseSpec::new("planner").with_id("Judge"));
        assert!(matches!(
            by_id.resolved_universes(),
            Err(CrewError::Structural(issues)) if issues == vec!["crew 'c': universe 'Judge' collides with the 'judge' node"]
        ));

        let by_label = CrewSpec::new("c")
            .with_universe(UniverseSpec::new("planner").with_label(" judge "))
            .with_universe(UniverseSpec::new("coder").depends_on(["judge"]));
        let err = orchestrator().plan(&by_label).unwrap_err();
        assert!(matches!(err, CrewError::Structural(issues) if issues[0].contains("universe 'judge (u1)'")));
    }

    #[tokio::test]
    async fn test_side_by_side_without_judge() {
        let crew = CrewSpec::new("c")
            .with_universe(UniverseSpec::new("planner>coder"))
            .with_universe(UniverseSpec::new("broken"));
        let report = orchestrator()
            .run(&crew, "build it", CancellationToken::new())
            .await
            .unwrap();
        assert!(report.judge.is_none());
        assert_eq!(report.universe("u1").unwrap().output.as_deref(), Some("coder done"));
        assert!(report.universe("u2").unwrap().status.is_unsuccessful());
        assert_eq!(report.succeeded().count(), 1);
        let text = report.side_by_side();
        assert!(text.contains("=== u1 [planner>coder] completed ==="));
        assert!(text.contains("=== u2 [broken]"));
    }

    #[tokio::test]
    async fn test_handoff_reaches_dependent_universe() {
        let crew = CrewSpec::new("c")
            .with_universe(UniverseSpec::new("planner>coder"))
            .with_universe(UniverseSpec::new("reviewer").depends_on(["u1"]));
        let report = orchestrator()
            .run(&crew, "build it", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            report.universe("u2").unwrap().output.as_deref(),
            Some("review handoffs=true fingerprint=true")
        );
        assert_eq!(report.outer.result("u2").unwrap().stage, 1);
    }

    #[tokio::test]
    async fn test_judge_picks_winner_by_label() {
        let crew = CrewSpec::new("c")
            .with_universe(UniverseSpec::new("planner").with_label("Fast"))
            .with_universe(UniverseSpec::new("coder").with_label("Careful"))
            .with_universe(UniverseSpec::new("broken"))
            .with_judge(JudgeSpec::new("judge"));
        let report = orchestrator()
            .run(&crew, "build it", CancellationToken::new())
            .await
            .unwrap();
        let judge = report.judge.as_ref().unwrap();
        assert!(judge.status.is_completed());
        assert_eq!(judge.winner.as_deref(), Some("u2"));
        assert_eq!(report.winner().unwrap().output.as_deref(), Some("coder done"));
        assert_eq!(
            judge.decision.as_ref().unwrap().reason.as_deref(),
            Some("covers edge cases")
        );
    }

    #[tokio::test]
    async fn test_judge_without_any_success_fails_the_run() {
        let crew = CrewSpec::new("c")
            .with_universe(UniverseSpec::new("broken"))
            .with_judge(JudgeSpec::new("judge"));
        let err = orchestrator()
            .run(&crew, "x", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CrewError::Orchestrator(m) if m.contains("no universe succeeded")));
    }

    #[test]
    fn test_trace_includes_inner_graphs() {
        let crew = CrewSpec::new("c")
            .with_universe(UniverseSpec::new("planner>coder"))
            .with_universe(UniverseSpec::new("reviewer").depends_on(["u1"]))
            .with_judge(JudgeSpec::new("judge"));
        let trace = orchestrator().trace(&crew).unwrap();
        assert_eq!(
            trace.outer.stages,
            vec![vec!["u1".to_string()], vec!["u2".to_string()], vec![JUDGE_NODE.to_string()]]
        );
        assert_eq!(trace.outer.channels[0].id, "u1.result->u2.context#summary/text");
        assert_eq!(trace.universes[0].trace.stages.len(), 2);
        let text = trace.to_string();
        assert!(text.contains("universe u2 (reviewer)"));
        assert!(text.contains("  stage 0: planner"));
    }
}
