//! Graph construction and validation.
//!
//! [`GraphBuilder`] turns a list of nodes into a [`Graph`]: dependency stages
//! (Kahn layering, declaration order within a stage) and the typed channels
//! inferred between producer output ports and consumer input ports. Every
//! structural problem is collected before anything runs.

use crate::types::{InputPortSpec, MergePolicy, NodeSpec, OutputPortSpec, PublishBudget};
use crewgraph_core::{CrewError, CrewResult, Kind};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Anything the builder and scheduler can treat as a node.
pub trait GraphNode: Send + Sync {
    fn name(&self) -> &str;

    fn depends_on(&self) -> &[String];

    /// Input port name to producer selectors.
    fn port_selectors(&self) -> Option<&BTreeMap<String, Vec<String>>> {
        None
    }

    fn inputs(&self) -> &[InputPortSpec];

    fn outputs(&self) -> &[OutputPortSpec];

    fn publish_budget(&self) -> PublishBudget {
        PublishBudget::default()
    }

    /// `(max_calls, max_exec_ms)` this node asks of its stage.
    fn stage_tool_budget(&self) -> (Option<u32>, Option<u64>) {
        (None, None)
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }
}

impl GraphNode for NodeSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    fn port_selectors(&self) -> Option<&BTreeMap<String, Vec<String>>> {
        Some(&self.depends_on_ports)
    }

    fn inputs(&self) -> &[InputPortSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[OutputPortSpec] {
        &self.outputs
    }

    fn publish_budget(&self) -> PublishBudget {
        self.publish
    }

    fn stage_tool_budget(&self) -> (Option<u32>, Option<u64>) {
        (self.stage_tool_max_calls, self.stage_tool_max_exec_ms)
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

/// `agent` or `agent.port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSelector {
    pub agent: String,
    pub port: Option<String>,
}

impl PortSelector {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("empty selector".into());
        }
        if raw.chars().any(char::is_whitespace) {
            return Err("selector must not contain spaces".into());
        }
        let parts: Vec<&str> = raw.split('.').collect();
        match parts.as_slice() {
            [agent] => Ok(Self {
                agent: (*agent).to_string(),
                port: None,
            }),
            [agent, port] if !agent.is_empty() && !port.is_empty() => Ok(Self {
                agent: (*agent).to_string(),
                port: Some((*port).to_string()),
            }),
            [_, _] => Err("selector has an empty agent or port".into()),
            _ => Err("expected 'agent' or 'agent.port'".into()),
        }
    }

    fn allows(&self, agent: &str, port: &str) -> bool {
        self.agent == agent && self.port.as_deref().map_or(true, |p| p == port)
    }
}

/// One problem found while validating a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum StructuralIssue {
    EmptyName { index: usize },
    DuplicateNode { name: String },
    UnknownDependency { node: String, dependency: String },
    SelfDependency { node: String },
    /// `port` is qualified as `owner.port`.
    UndeclaredPort { node: String, port: String },
    InvalidSelector { node: String, selector: String, reason: String },
    TypeMismatch {
        node: String,
        port: String,
        producer: String,
        produced: Kind,
    },
    Cycle { members: Vec<String> },
}

impl fmt::Display for StructuralIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructuralIssue::EmptyName { index } => write!(f, "node #{index} has an empty name"),
            StructuralIssue::DuplicateNode { name } => write!(f, "duplicate node '{name}'"),
            StructuralIssue::UnknownDependency { node, dependency } => {
                write!(f, "node '{node}' depends on unknown node '{dependency}'")
            }
            StructuralIssue::SelfDependency { node } => write!(f, "node '{node}' depends on itself"),
            StructuralIssue::UndeclaredPort { node, port } => {
                write!(f, "node '{node}' references undeclared port '{port}'")
            }
            StructuralIssue::InvalidSelector {
                node,
                selector,
                reason,
            } => write!(f, "node '{node}' has invalid selector '{selector}': {reason}"),
            StructuralIssue::TypeMismatch {
                node,
                port,
                producer,
                produced,
            } => write!(
                f,
                "port '{node}.{port}' cannot accept '{produced}' from '{producer}'"
            ),
            StructuralIssue::Cycle { members } => write!(f, "cycle: {}", members.join(" -> ")),
        }
    }
}

/// An inferred path from an output port to an input port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Channel {
    pub id: String,
    pub from_node: String,
    pub from_port: String,
    pub to_node: String,
    pub to_port: String,
    pub kind: Kind,
    pub policy: MergePolicy,
    pub max_chars: usize,
    pub max_tokens: Option<usize>,
    pub priority: f64,
    pub required: bool,
}

impl Channel {
    fn new(from_node: &str, out: &str, to_node: &str, input: &InputPortSpec, kind: Kind) -> Self {
        let policy = input.resolved_policy();
        Self {
            id: format!("{from_node}.{out}->{to_node}.{}#{kind}", input.name),
            from_node: from_node.to_string(),
            from_port: out.to_string(),
            to_node: to_node.to_string(),
            to_port: input.name.clone(),
            kind,
            policy,
            max_chars: input.effective_max_chars(policy),
            max_tokens: input.max_tokens.filter(|t| *t > 0),
            priority: input.channel_priority,
            required: input.required,
        }
    }
}

#[derive(Debug, Clone)]
struct NodePorts {
    inputs: Vec<InputPortSpec>,
    outputs: Vec<OutputPortSpec>,
}

impl NodePorts {
    fn of<N: GraphNode>(node: &N) -> Self {
        let mut inputs = node.inputs().to_vec();
        if inputs.is_empty() {
            inputs.push(InputPortSpec::new(InputPortSpec::IMPLICIT));
        }
        let mut outputs = node.outputs().to_vec();
        if outputs.is_empty() {
            outputs.push(OutputPortSpec::new(OutputPortSpec::IMPLICIT, Kind::MessageAgent));
        }
        Self { inputs, outputs }
    }

    fn input(&self, name: &str) -> Option<&InputPortSpec> {
        self.inputs.iter().find(|p| p.name == name)
    }

    fn output(&self, name: &str) -> Option<&OutputPortSpec> {
        self.outputs.iter().find(|p| p.name == name)
    }
}

struct Analysis {
    issues: Vec<StructuralIssue>,
    ports: Vec<NodePorts>,
    deps: Vec<Vec<usize>>,
    channels: Vec<Channel>,
}

/// Collects nodes and builds a validated [`Graph`].
pub struct GraphBuilder<N> {
    nodes: Vec<N>,
}

impl<N: GraphNode> GraphBuilder<N> {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn node(mut self, node: N) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn nodes(mut self, nodes: impl IntoIterator<Item = N>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    /// Every structural issue, without building.
    pub fn validate(&self) -> Vec<StructuralIssue> {
        self.analyze().issues
    }

    pub fn build(self) -> CrewResult<Graph<N>> {
        let Analysis {
            issues,
            ports,
            deps,
            channels,
        } = self.analyze();
        if !issues.is_empty() {
            return Err(CrewError::Structural(
                issues.iter().map(ToString::to_string).collect(),
            ));
        }

        let stages = kahn_stages(&deps)?;

        let mut dependents = vec![Vec::new(); self.nodes.len()];
        for (consumer, ds) in deps.iter().enumerate() {
            for &d in ds {
                dependents[d].push(consumer);
            }
        }
        let index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name().to_string(), i))
            .collect();

        debug!(
            nodes = self.nodes.len(),
            stages = stages.len(),
            channels = channels.len(),
            "Graph built"
        );
        Ok(Graph {
            nodes: self.nodes,
            index,
            ports,
            deps,
            dependents,
            stages,
            channels,
        })
    }

    fn analyze(&self) -> Analysis {
        let mut issues = Vec::new();
        let ports: Vec<NodePorts> = self.nodes.iter().map(NodePorts::of).collect();

        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            let name = node.name().trim();
            if name.is_empty() {
                issues.push(StructuralIssue::EmptyName { index: i });
                continue;
            }
            if index.insert(name, i).is_some() {
                issues.push(StructuralIssue::DuplicateNode {
                    name: name.to_string(),
                });
            }
        }

        let mut deps = vec![Vec::new(); self.nodes.len()];
        let mut selectors = vec![BTreeMap::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            let name = node.name();
            let mut push_dep = |dep: &str, issues: &mut Vec<StructuralIssue>| -> Option<usize> {
                if dep == name {
                    issues.push(StructuralIssue::SelfDependency {
                        node: name.to_string(),
                    });
                    return None;
                }
                match index.get(dep) {
                    Some(&d) => {
                        if !deps[i].contains(&d) {
                            deps[i].push(d);
                        }
                        Some(d)
                    }
                    None => {
                        issues.push(StructuralIssue::UnknownDependency {
                            node: name.to_string(),
                            dependency: dep.to_string(),
                        });
                        None
                    }
                }
            };

            for dep in node.depends_on() {
                let dep = dep.trim();
                if !dep.is_empty() {
                    push_dep(dep, &mut issues);
                }
            }

            let Some(port_selectors) = node.port_selectors() else {
                continue;
            };
            for (port, raw_selectors) in port_selectors {
                let input = ports[i].input(port);
                if input.is_none() {
                    issues.push(StructuralIssue::UndeclaredPort {
                        node: name.to_string(),
                        port: format!("{name}.{port}"),
                    });
                }
                let mut parsed = Vec::new();
                for raw in raw_selectors {
                    let sel = match PortSelector::parse(raw) {
                        Ok(sel) => sel,
                        Err(reason) => {
                            issues.push(StructuralIssue::InvalidSelector {
                                node: name.to_string(),
                                selector: raw.clone(),
                                reason,
                            });
                            continue;
                        }
                    };
                    let Some(producer) = push_dep(&sel.agent, &mut issues) else {
                        continue;
                    };
                    if let Some(out_name) = &sel.port {
                        match ports[producer].output(out_name) {
                            None => issues.push(StructuralIssue::UndeclaredPort {
                                node: name.to_string(),
                                port: format!("{}.{out_name}", sel.agent),
                            }),
                            Some(out) => {
                                if let Some(input) = input {
                                    let compatible = input
                                        .accepted()
                                        .iter()
                                        .any(|k| out.produces.satisfies(*k));
                                    if !compatible && !input.accepts_message() {
                                        issues.push(StructuralIssue::TypeMismatch {
                                            node: name.to_string(),
                                            port: port.clone(),
                                            producer: format!("{}.{out_name}", sel.agent),
                                            produced: out.produces,
                                        });
                                    }
                                }
                            }
                        }
                    }
                    parsed.push(sel);
                }
                selectors[i].insert(port.clone(), parsed);
            }
        }

        let mut channels = Vec::new();
        for (consumer, node) in self.nodes.iter().enumerate() {
            for input in &ports[consumer].inputs {
                let sels = selectors[consumer].get(&input.name).map(Vec::as_slice);
                for &producer in &deps[consumer] {
                    if let Some(ch) = infer_channel(
                        self.nodes[producer].name(),
                        &ports[producer],
                        node.name(),
                        input,
                        sels.unwrap_or_default(),
                    ) {
                        channels.push(ch);
                    }
                }
            }
        }
        issues.extend(self.static_mismatches(&ports, &deps, &selectors, &channels));

        issues.extend(find_cycles(&self.nodes, &deps));
        Analysis {
            issues,
            ports,
            deps,
            channels,
        }
    }

    /// Input ports that no typed dependency can ever feed.
    ///
    /// A port without selectors is checked when every dependency declares
    /// its outputs; a port with `agent` selectors is checked per selected
    /// agent. Ports accepting messages always get a fallback channel, and
    /// pinned `agent.port` selectors were checked while parsing.
    fn static_mismatches(
        &self,
        ports: &[NodePorts],
        deps: &[Vec<usize>],
        selectors: &[BTreeMap<String, Vec<PortSelector>>],
        channels: &[Channel],
    ) -> Vec<StructuralIssue> {
        let typed = |i: usize| !self.nodes[i].outputs().is_empty();
        let fed = |producer: usize, consumer: usize, port: &str| {
            let (from, to) = (self.nodes[producer].name(), self.nodes[consumer].name());
            channels
                .iter()
                .any(|c| c.from_node == from && c.to_node == to && c.to_port == port)
        };
        let mismatch = |consumer: usize, port: &str, producer: usize| {
            let out = &ports[producer].outputs[0];
            StructuralIssue::TypeMismatch {
                node: self.nodes[consumer].name().to_string(),
                port: port.to_string(),
                producer: format!("{}.{}", self.nodes[producer].name(), out.name),
                produced: out.produces,
            }
        };

        let mut issues = Vec::new();
        for (consumer, node) in self.nodes.iter().enumerate() {
            if node.inputs().is_empty() {
                continue;
            }
            let ds = &deps[consumer];
            for input in ports[consumer].inputs.iter().filter(|p| !p.accepts_message()) {
                match selectors[consumer].get(&input.name) {
                    None => {
                        if ds.is_empty() || !ds.iter().all(|&d| typed(d)) {
                            continue;
                        }
                        if !ds.iter().any(|&d| fed(d, consumer, &input.name)) {
                            issues.push(mismatch(consumer, &input.name, ds[0]));
                        }
                    }
                    Some(sels) => {
                        for sel in sels.iter().filter(|s| s.port.is_none()) {
                            let Some(&producer) =
                                ds.iter().find(|&&d| self.nodes[d].name() == sel.agent)
                            else {
                                continue;
                            };
                            if typed(producer) && !fed(producer, consumer, &input.name) {
                                issues.push(mismatch(consumer, &input.name, producer));
                            }
                        }
                    }
                }
            }
        }
        issues
    }
}

impl<N: GraphNode> Default for GraphBuilder<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// First compatible `(accepted, produced)` pair, else a message fallback.
fn infer_channel(
    producer: &str,
    producer_ports: &NodePorts,
    consumer: &str,
    input: &InputPortSpec,
    selectors: &[PortSelector],
) -> Option<Channel> {
    let allowed = |port: &str| selectors.is_empty() || selectors.iter().any(|s| s.allows(producer, port));
    if !selectors.is_empty() && !selectors.iter().any(|s| s.agent == producer) {
        return None;
    }

    for accepted in input.accepted() {
        for out in &producer_ports.outputs {
            if out.produces.satisfies(accepted) && allowed(&out.name) {
                return Some(Channel::new(producer, &out.name, consumer, input, out.produces));
            }
        }
    }

    if input.accepts_message() {
        let pinned = selectors
            .iter()
            .find(|s| s.agent == producer)
            .and_then(|s| s.port.as_deref());
        let port = pinned
            .or_else(|| producer_ports.outputs.first().map(|o| o.name.as_str()))
            .unwrap_or(OutputPortSpec::IMPLICIT);
        if allowed(port) {
            return Some(Channel::new(producer, port, consumer, input, Kind::MessageAgent));
        }
    }
    None
}

/// DFS with a recursion stack; one issue per distinct cycle.
fn find_cycles<N: GraphNode>(nodes: &[N], deps: &[Vec<usize>]) -> Vec<StructuralIssue> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        OnStack,
        Done,
    }

    fn visit<N: GraphNode>(
        v: usize,
        nodes: &[N],
        deps: &[Vec<usize>],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
        seen: &mut HashSet<Vec<usize>>,
        out: &mut Vec<StructuralIssue>,
    ) {
        marks[v] = Mark::OnStack;
        stack.push(v);
        for &d in &deps[v] {
            match marks[d] {
                Mark::New => visit(d, nodes, deps, marks, stack, seen, out),
                Mark::OnStack => {
                    let start = stack.iter().rposition(|&s| s == d).unwrap_or(0);
                    let cycle = &stack[start..];
                    let mut key = cycle.to_vec();
                    key.sort_unstable();
                    if seen.insert(key) {
                        let mut members: Vec<String> =
                            cycle.iter().map(|&i| nodes[i].name().to_string()).collect();
                        members.push(nodes[d].name().to_string());
                        out.push(StructuralIssue::Cycle { members });
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[v] = Mark::Done;
    }

    let mut marks = vec![Mark::New; nodes.len()];
    let mut stack = Vec::new();
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for v in 0..nodes.len() {
        if marks[v] == Mark::New {
            visit(v, nodes, deps, &mut marks, &mut stack, &mut seen, &mut out);
        }
    }
    out
}

fn kahn_stages(deps: &[Vec<usize>]) -> CrewResult<Vec<Vec<usize>>> {
    let mut placed = vec![false; deps.len()];
    let mut remaining = deps.len();
    let mut stages = Vec::new();
    while remaining > 0 {
        let stage: Vec<usize> = (0..deps.len())
            .filter(|&i| !placed[i] && deps[i].iter().all(|&d| placed[d]))
            .collect();
        if stage.is_empty() {
            return Err(CrewError::Structural(vec![
                "graph has no schedulable nodes left (cycle)".into(),
            ]));
        }
        for &i in &stage {
            placed[i] = true;
        }
        remaining -= stage.len();
        stages.push(stage);
    }
    Ok(stages)
}

/// A validated node graph.
pub struct Graph<N> {
    nodes: Vec<N>,
    index: HashMap<String, usize>,
    ports: Vec<NodePorts>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    stages: Vec<Vec<usize>>,
    channels: Vec<Channel>,
}

impl<N: GraphNode> fmt::Debug for Graph<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |stage: &Vec<usize>| -> Vec<&str> {
            stage.iter().map(|&i| self.nodes[i].name()).collect()
        };
        f.debug_struct("Graph")
            .field("stages", &self.stages.iter().map(names).collect::<Vec<_>>())
            .field("channels", &self.channels)
            .finish()
    }
}

impl<N: GraphNode> Graph<N> {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[N] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &N {
        &self.nodes[idx]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn find(&self, name: &str) -> Option<&N> {
        self.index_of(name).map(|i| &self.nodes[i])
    }

    /// Effective dependencies, including selector-implied ones.
    pub fn deps(&self, idx: usize) -> &[usize] {
        &self.deps[idx]
    }

    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    pub fn stages(&self) -> &[Vec<usize>] {
        &self.stages
    }

    pub fn stage_names(&self) -> Vec<Vec<String>> {
        self.stages
            .iter()
            .map(|s| s.iter().map(|&i| self.nodes[i].name().to_string()).collect())
            .collect()
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channels_into<'a>(&'a self, node: &'a str, port: &'a str) -> impl Iterator<Item = &'a Channel> {
        self.channels
            .iter()
            .filter(move |c| c.to_node == node && c.to_port == port)
    }

    /// Input ports with the implicit `input` port applied.
    pub fn inputs_of(&self, idx: usize) -> &[InputPortSpec] {
        &self.ports[idx].inputs
    }

    /// Output ports with the implicit `output` port applied.
    pub fn outputs_of(&self, idx: usize) -> &[OutputPortSpec] {
        &self.ports[idx].outputs
    }

    /// Nodes nothing depends on.
    pub fn sinks(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.dependents[i].is_empty())
            .collect()
    }

    pub fn trace(&self) -> GraphTrace {
        GraphTrace {
            stages: self.stage_names(),
            channels: self.channels.clone(),
        }
    }
}

/// Stages and channels of a graph, renderable without running it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphTrace {
    pub stages: Vec<Vec<String>>,
    pub channels: Vec<Channel>,
}

impl fmt::Display for GraphTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            writeln!(f, "stage {i}: {}", stage.join(", "))?;
        }
        for ch in &self.channels {
            write!(
                f,
                "channel {} policy={} max_chars={}",
                ch.id, ch.policy, ch.max_chars
            )?;
            if let Some(tokens) = ch.max_tokens {
                write!(f, " max_tokens={tokens}")?;
            }
            if ch.priority != 0.0 {
                write!(f, " priority={}", ch.priority)?;
            }
            if ch.required {
                f.write_str(" required")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Parse a staged expression such as `a+b>c>d`.
pub fn parse_spec_expression(expr: &str) -> CrewResult<Vec<Vec<String>>> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(CrewError::Config("empty spec".into()));
    }
    let mut seen = HashSet::new();
    let mut stages = Vec::new();
    for raw_stage in expr.split('>') {
        let raw_stage = raw_stage.trim();
        if raw_stage.is_empty() {
            return Err(CrewError::Config(format!("empty stage near '>' in '{expr}'")));
        }
        let mut stage = Vec::new();
        for raw_name in raw_stage.split('+') {
            let name = raw_name.trim();
            if name.is_empty() {
                return Err(CrewError::Config(format!("empty agent near '+' in '{expr}'")));
            }
            if name.chars().any(char::is_whitespace) {
                return Err(CrewError::Config(format!("invalid agent name '{name}'")));
            }
            if !seen.insert(name.to_string()) {
                return Err(CrewError::Config(format!("duplicate agent '{name}' in '{expr}'")));
            }
            stage.push(name.to_string());
        }
        stages.push(stage);
    }
    Ok(stages)
}

/// Node specs for a staged expression over `agents`.
///
/// A node that declares neither `depends_on` nor `depends_on_ports` depends
/// on every node of the previous stage. Declared dependencies must appear in
/// an earlier or the same stage of the expression.
pub fn select_nodes(agents: &[NodeSpec], expr: &str) -> CrewResult<Vec<NodeSpec>> {
    let stages = parse_spec_expression(expr)?;
    let stage_of: HashMap<&str, usize> = stages
        .iter()
        .enumerate()
        .flat_map(|(i, s)| s.iter().map(move |n| (n.as_str(), i)))
        .collect();

    let mut out = Vec::new();
    for (i, stage) in stages.iter().enumerate() {
        for name in stage {
            let agent = agents
                .iter()
                .find(|a| &a.name == name)
                .ok_or_else(|| CrewError::Config(format!("unknown agent '{name}' in spec '{expr}'")))?;
            let mut node = agent.clone();
            let explicit = !node.depends_on.is_empty() || !node.depends_on_ports.is_empty();
            if explicit {
                let selected = node.depends_on_ports.values().flatten().filter_map(|raw| {
                    PortSelector::parse(raw).ok().map(|s| s.agent)
                });
                for dep in node.depends_on.iter().cloned().chain(selected) {
                    match stage_of.get(dep.as_str()) {
                        None => {
                            return Err(CrewError::Config(format!(
                                "agent '{name}' depends on '{dep}' which is not part of spec '{expr}'"
                            )))
                        }
                        Some(&s) if s > i => {
                            return Err(CrewError::Config(format!(
                                "agent '{name}' depends on '{dep}' which appears in a later stage of '{expr}'"
                            )))
                        }
                        Some(_) => {}
                    }
                }
            } else if i > 0 {
                node.depends_on = stages[i - 1].clone();
            }
            out.push(node);
        }
    }
    Ok(out)
}
