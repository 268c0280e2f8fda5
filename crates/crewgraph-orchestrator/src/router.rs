//! Per-run routing of typed payloads along graph channels.
//!
//! The edge table is fixed when the router is built; each edge owns its own
//! store behind its own lock, so publishers on different edges never contend.
//! A single atomic sequence orders payloads across edges.

use crate::graph::{Channel, Graph, GraphNode};
use crate::types::{MergePolicy, PublishBudget};
use crewgraph_agent::{CharTokenEstimator, TokenEstimator};
use crewgraph_core::{truncate_chars, CrewError, CrewResult, Kind};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// One published contribution, immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payload {
    pub channel: String,
    pub kind: Kind,
    pub content: Arc<str>,
    pub from_node: String,
    pub from_port: String,
    pub seq: u64,
    pub truncated: bool,
}

struct Edge {
    channel: Channel,
    store: Mutex<VecDeque<Arc<Payload>>>,
}

impl Edge {
    fn push(&self, payload: Arc<Payload>) {
        let mut store = self.store.lock();
        match self.channel.policy {
            MergePolicy::Auto | MergePolicy::Latest => {
                store.clear();
                store.push_back(payload);
            }
            MergePolicy::Append => store.push_back(payload),
            MergePolicy::AppendLast(n) => {
                store.push_back(payload);
                while store.len() > n.max(1) {
                    store.pop_front();
                }
            }
        }
    }
}

/// What one input port sees after merging every channel into it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedInput {
    pub node: String,
    pub port: String,
    pub policy: MergePolicy,
    /// Ordered by publish sequence.
    pub contributions: Vec<Arc<Payload>>,
    pub channels: Vec<String>,
    pub declared_kind: Kind,
    pub required: bool,
    pub priority: f64,
    pub max_tokens: Option<usize>,
}

impl ResolvedInput {
    pub fn is_empty(&self) -> bool {
        self.contributions.is_empty()
    }

    /// Merged text: raw content for `latest`, `[from.port] content` lines otherwise.
    pub fn text(&self) -> String {
        if !self.policy.is_append() {
            return self
                .contributions
                .last()
                .map(|p| p.content.to_string())
                .unwrap_or_default();
        }
        self.contributions
            .iter()
            .map(|p| format!("[{}.{}] {}", p.from_node, p.from_port, p.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Kind of the newest contribution, else the channel kind.
    pub fn kind(&self) -> Kind {
        self.contributions
            .last()
            .map_or(self.declared_kind, |p| p.kind)
    }

    /// Channel id when every contribution shares one channel, else `node.port`.
    pub fn label(&self) -> String {
        match self.contributions.first() {
            Some(first) if self.contributions.iter().all(|p| p.channel == first.channel) => {
                first.channel.clone()
            }
            _ => format!("{}.{}", self.node, self.port),
        }
    }

    pub fn from_node(&self, node: &str) -> Option<&Arc<Payload>> {
        self.contributions.iter().rev().find(|p| p.from_node == node)
    }

    pub fn truncated(&self) -> bool {
        self.contributions.iter().any(|p| p.truncated)
    }
}

pub struct ChannelRouter {
    edges: Vec<Edge>,
    outgoing: HashMap<(String, String), Vec<usize>>,
    incoming: HashMap<(String, String), Vec<usize>>,
    publish_budgets: HashMap<String, PublishBudget>,
    /// Resolved merge policy per `(node, input port)`.
    port_policies: HashMap<(String, String), MergePolicy>,
    estimator: Arc<dyn TokenEstimator>,
    seq: AtomicU64,
}

impl ChannelRouter {
    pub fn new(channels: impl IntoIterator<Item = Channel>) -> Self {
        let mut outgoing: HashMap<(String, String), Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<(String, String), Vec<usize>> = HashMap::new();
        let edges: Vec<Edge> = channels
            .into_iter()
            .enumerate()
            .map(|(i, channel)| {
                outgoing
                    .entry((channel.from_node.clone(), channel.from_port.clone()))
                    .or_default()
                    .push(i);
                incoming
                    .entry((channel.to_node.clone(), channel.to_port.clone()))
                    .or_default()
                    .push(i);
                Edge {
                    channel,
                    store: Mutex::new(VecDeque::new()),
                }
            })
            .collect();
        Self {
            edges,
            outgoing,
            incoming,
            publish_budgets: HashMap::new(),
            port_policies: HashMap::new(),
            estimator: Arc::new(CharTokenEstimator),
            seq: AtomicU64::new(0),
        }
    }

    /// Router over a graph's channels with each node's publish budget.
    pub fn for_graph<N: GraphNode>(graph: &Graph<N>) -> Self {
        let mut router = Self::new(graph.channels().iter().cloned());
        for (idx, node) in graph.nodes().iter().enumerate() {
            let budget = node.publish_budget();
            if budget != PublishBudget::default() {
                router.publish_budgets.insert(node.name().to_string(), budget);
            }
            for input in graph.inputs_of(idx) {
                router
                    .port_policies
                    .insert((node.name().to_string(), input.name.clone()), input.resolved_policy());
            }
        }
        router
    }

    pub fn with_publish_budget(mut self, node: impl Into<String>, budget: PublishBudget) -> Self {
        self.publish_budgets.insert(node.into(), budget);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.edges.iter().map(|e| &e.channel)
    }

    /// Publish `content` on `(node, port)`, typed by each channel. Returns the
    /// number of channels fed.
    pub fn publish(&self, node: &str, port: &str, content: &str) -> usize {
        // Untyped publishes cannot mismatch.
        self.publish_inner(node, port, None, content).unwrap_or(0)
    }

    /// Publish with an explicit kind, rejected if a selected channel cannot carry it.
    pub fn publish_typed(&self, node: &str, port: &str, kind: Kind, content: &str) -> CrewResult<usize> {
        self.publish_inner(node, port, Some(kind), content)
    }

    fn publish_inner(&self, node: &str, port: &str, kind: Option<Kind>, content: &str) -> CrewResult<usize> {
        let Some(edge_ids) = self.outgoing.get(&(node.to_string(), port.to_string())) else {
            return Ok(0);
        };
        if content.trim().is_empty() {
            return Ok(0);
        }

        let budget = self.publish_budgets.get(node).copied().unwrap_or_default();
        let mut selected = edge_ids.clone();
        selected.sort_by(|a, b| {
            self.edges[*b]
                .channel
                .priority
                .total_cmp(&self.edges[*a].channel.priority)
        });
        if budget.max_channels > 0 {
            selected.truncate(budget.max_channels);
        }

        if let Some(kind) = kind {
            if let Some(bad) = selected
                .iter()
                .map(|&e| &self.edges[e].channel)
                .find(|ch| !kind.satisfies(ch.kind))
            {
                return Err(CrewError::Channel(format!(
                    "kind '{kind}' cannot be published on channel {}",
                    bad.id
                )));
            }
        }

        let capped_tokens =
            budget.max_channel_tokens > 0 && self.estimator.estimate(content) > budget.max_channel_tokens;
        let body = if capped_tokens {
            self.estimator.truncate(content, budget.max_channel_tokens)
        } else {
            content.to_string()
        };

        for &e in &selected {
            let edge = &self.edges[e];
            let (text, cut) = truncate_chars(&body, edge.channel.max_chars);
            let payload = Arc::new(Payload {
                channel: edge.channel.id.clone(),
                kind: kind.unwrap_or(edge.channel.kind),
                content: Arc::from(text.as_ref()),
                from_node: node.to_string(),
                from_port: port.to_string(),
                seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
                truncated: cut || capped_tokens,
            });
            debug!(
                channel = %edge.channel.id,
                seq = payload.seq,
                truncated = payload.truncated,
                "Payload published"
            );
            edge.push(payload);
        }
        Ok(selected.len())
    }

    /// Merge every channel into `(node, port)` under the port's policy.
    ///
    /// Routers built with [`ChannelRouter::new`] know no port specs and fall
    /// back to the first channel's policy.
    pub fn resolve(&self, node: &str, port: &str) -> ResolvedInput {
        let key = (node.to_string(), port.to_string());
        let ids = self.incoming.get(&key).map(Vec::as_slice).unwrap_or_default();

        let mut contributions: Vec<Arc<Payload>> = ids
            .iter()
            .flat_map(|&e| self.edges[e].store.lock().iter().cloned().collect::<Vec<_>>())
            .collect();
        contributions.sort_by_key(|p| p.seq);

        let first = ids.first().map(|&e| &self.edges[e].channel);
        let policy = self
            .port_policies
            .get(&key)
            .copied()
            .or_else(|| first.map(|c| c.policy))
            .unwrap_or(MergePolicy::Latest);
        let keep = match policy {
            MergePolicy::Auto | MergePolicy::Latest => 1,
            MergePolicy::Append => contributions.len(),
            MergePolicy::AppendLast(n) => n.max(1),
        };
        if contributions.len() > keep {
            contributions.drain(..contributions.len() - keep);
        }

        ResolvedInput {
            node: node.to_string(),
            port: port.to_string(),
            policy,
            contributions,
            channels: ids.iter().map(|&e| self.edges[e].channel.id.clone()).collect(),
            declared_kind: first.map_or(Kind::MessageAgent, |c| c.kind),
            required: first.is_some_and(|c| c.required),
            priority: first.map_or(0.0, |c| c.priority),
            max_tokens: first.and_then(|c| c.max_tokens),
        }
    }

    /// Payloads currently held across all edges.
    pub fn payload_count(&self) -> usize {
        self.edges.iter().map(|e| e.store.lock().len()).sum()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::types::{InputPortSpec, NodeSpec, OutputPortSpec};
    use crewgraph_core::TRUNCATION_MARKER;

    fn fan_in(policy: MergePolicy) -> ChannelRouter {
        let graph = GraphBuilder::new()
            .nodes(vec![
                NodeSpec::new("a").with_output(OutputPortSpec::new("out", Kind::SummaryText)),
                NodeSpec::new("b").with_output(OutputPortSpec::new("out", Kind::SummaryText)),
                NodeSpec::new("c").depends_on(["a", "b"]).with_input(
                    InputPortSpec::new("in")
                        .accepting([Kind::SummaryText])
                        .with_policy(policy)
                        .with_max_chars(1000),
                ),
            ])
            .build()
            .unwrap();
        ChannelRouter::for_graph(&graph)
    }

    #[test]
    fn test_latest_keeps_newest_across_channels() {
        let router = fan_in(MergePolicy::Latest);
        assert_eq!(router.publish("a", "out", "first"), 1);
        router.publish("b", "out", "second");
        router.publish("a", "out", "third");
        let resolved = router.resolve("c", "in");
        assert_eq!(resolved.contributions.len(), 1);
        assert_eq!(resolved.text(), "third");
        assert_eq!(resolved.kind(), Kind::SummaryText);
    }

    #[test]
    fn test_append_tags_sources_in_publish_order() {
        let router = fan_in(MergePolicy::Append);
        router.publish("b", "out", "one");
        router.publish("a", "out", "two");
        router.publish("b", "out", "three");
        let resolved = router.resolve("c", "in");
        assert_eq!(resolved.text(), "[b.out] one\n[a.out] two\n[b.out] three");
        assert_eq!(resolved.label(), "c.in");
    }

    #[test]
    fn test_append_last_bounds_history() {
        let router = fan_in(MergePolicy::AppendLast(2));
        for text in ["1", "2", "3", "4"] {
            router.publish("a", "out", text);
        }
        let resolved = router.resolve("c", "in");
        let texts: Vec<_> = resolved.contributions.iter().map(|p| p.content.to_string()).collect();
        assert_eq!(texts, vec!["3", "4"]);
        assert_eq!(resolved.label(), "a.out->c.in#summary/text");
    }

    #[test]
    fn test_auto_policy_follows_port_not_first_channel() {
        let graph = GraphBuilder::new()
            .nodes(vec![
                NodeSpec::new("planner").with_output(OutputPortSpec::new("out", Kind::PlanTask)),
                NodeSpec::new("linter").with_output(OutputPortSpec::new("out", Kind::DiagnosticBuild)),
                NodeSpec::new("fixer").depends_on(["planner", "linter"]).with_input(
                    InputPortSpec::new("in").accepting([Kind::DiagnosticBuild, Kind::PlanTask]),
                ),
            ])
            .build()
            .unwrap();
        assert!(graph
            .channels()
            .iter()
            .all(|c| c.policy == MergePolicy::AppendLast(4)));

        let router = ChannelRouter::for_graph(&graph);
        router.publish("planner", "out", "step one");
        router.publish("linter", "out", "warning: unused");
        let resolved = router.resolve("fixer", "in");
        assert_eq!(resolved.policy, MergePolicy::AppendLast(4));
        assert_eq!(
            resolved.text(),
            "[planner.out] step one\n[linter.out] warning: unused"
        );
    }

    #[test]
    fn test_truncation_keeps_exact_prefix_and_marker() {
        let graph = GraphBuilder::new()
            .nodes(vec![
                NodeSpec::new("a"),
                NodeSpec::new("b")
                    .depends_on(["a"])
                    .with_input(InputPortSpec::new("in").with_policy(MergePolicy::Latest).with_max_chars(40)),
            ])
            .build()
            .unwrap();
        let router = ChannelRouter::for_graph(&graph);
        let long = "é".repeat(500);
        router.publish("a", "output", &long);
        let resolved = router.resolve("b", "in");
        let text = resolved.text();
        assert!(resolved.truncated());
        assert!(text.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            text.chars().count(),
            40 + TRUNCATION_MARKER.chars().count()
        );
    }

    #[test]
    fn test_publish_budget_limits_channels_by_priority() {
        let graph = GraphBuilder::new()
            .nodes(vec![
                NodeSpec::new("src").with_publish_budget(PublishBudget {
                    max_channels: 1,
                    max_channel_tokens: 5,
                }),
                NodeSpec::new("low").depends_on(["src"]),
                NodeSpec::new("high")
                    .depends_on(["src"])
                    .with_input(InputPortSpec::new("input").with_priority(2.0).with_max_chars(1000)),
            ])
            .build()
            .unwrap();
        let router = ChannelRouter::for_graph(&graph);
        let fed = router.publish("src", "output", &"word ".repeat(100));
        assert_eq!(fed, 1);
        assert!(router.resolve("low", "input").is_empty());
        let high = router.resolve("high", "input");
        assert!(high.truncated());
        assert!(high.contributions[0].content.chars().count() < 100);
    }

    #[test]
    fn test_publish_typed_rejects_mismatch() {
        let router = fan_in(MergePolicy::Latest);
        let err = router
            .publish_typed("a", "out", Kind::CodeRust, "fn main() {}")
            .unwrap_err();
        assert!(matches!(err, CrewError::Channel(_)));
        assert_eq!(router.payload_count(), 0);
        assert_eq!(
            router.publish_typed("a", "out", Kind::SummaryText, "ok").unwrap(),
            1
        );
    }

    #[test]
    fn test_empty_or_unrouted_publish_feeds_nothing() {
        let router = fan_in(MergePolicy::Latest);
        assert_eq!(router.publish("a", "out", "   "), 0);
        assert_eq!(router.publish("c", "output", "sink"), 0);
        assert!(router.resolve("c", "in").is_empty());
    }
}
