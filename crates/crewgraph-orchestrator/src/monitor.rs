use crate::scheduler::{NodeResult, RunReport};
use crate::types::NodeStatus;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

/// Hooks the scheduler calls during one run.
///
/// Observers are created per run and passed in; nothing here is global.
pub trait RunObserver: Send + Sync {
    fn on_stage_start(&self, _stage: usize, _nodes: &[&str]) {}

    fn on_node_status(&self, _node: &str, _status: &NodeStatus) {}

    fn on_node_finished(&self, _result: &NodeResult) {}

    fn on_run_end(&self, _report: &RunReport) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Counters for a single node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeMetrics {
    pub rounds: u32,
    pub tool_calls: u32,
    pub cache_hits: u32,
    pub dropped_units: u32,
    pub errors: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeState {
    pub node: String,
    pub stage: Option<usize>,
    pub status: NodeStatus,
    pub metrics: NodeMetrics,
}

/// Collects per-node state and metrics for one run.
pub struct RunMonitor {
    states: RwLock<HashMap<String, NodeState>>,
    stages_started: RwLock<Vec<usize>>,
    flushed: RwLock<Option<serde_json::Value>>,
}

impl RunMonitor {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            stages_started: RwLock::new(Vec::new()),
            flushed: RwLock::new(None),
        }
    }

    /// All node states, sorted by name.
    pub fn snapshot(&self) -> Vec<NodeState> {
        let mut states: Vec<_> = self.states.read().values().cloned().collect();
        states.sort_by(|a, b| a.node.cmp(&b.node));
        states
    }

    pub fn get_state(&self, node: &str) -> Option<NodeState> {
        self.states.read().get(node).cloned()
    }

    pub fn aggregate_metrics(&self) -> NodeMetrics {
        let states = self.states.read();
        let mut total = NodeMetrics::default();
        for state in states.values() {
            total.rounds += state.metrics.rounds;
            total.tool_calls += state.metrics.tool_calls;
            total.cache_hits += state.metrics.cache_hits;
            total.dropped_units += state.metrics.dropped_units;
            total.errors += state.metrics.errors;
            total.duration_ms += state.metrics.duration_ms;
        }
        total
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "stages_started": *self.stages_started.read(),
            "nodes": self.snapshot(),
            "aggregate": self.aggregate_metrics(),
        })
    }

    /// JSON captured when the run ended, if it has.
    pub fn flushed(&self) -> Option<serde_json::Value> {
        self.flushed.read().clone()
    }

    fn with_state(&self, node: &str, f: impl FnOnce(&mut NodeState)) {
        let mut states = self.states.write();
        let state = states.entry(node.to_string()).or_insert_with(|| NodeState {
            node: node.to_string(),
            stage: None,
            status: NodeStatus::Pending,
            metrics: NodeMetrics::default(),
        });
        f(state);
    }
}

impl Default for RunMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl RunObserver for RunMonitor {
    fn on_stage_start(&self, stage: usize, nodes: &[&str]) {
        self.stages_started.write().push(stage);
        for node in nodes {
            self.with_state(node, |s| s.stage = Some(stage));
        }
    }

    fn on_node_status(&self, node: &str, status: &NodeStatus) {
        self.with_state(node, |s| s.status = status.clone());
    }

    fn on_node_finished(&self, result: &NodeResult) {
        self.with_state(&result.node, |s| {
            s.stage = Some(result.stage);
            s.status = result.status.clone();
            s.metrics.rounds += result.rounds;
            s.metrics.tool_calls += u32::try_from(result.tool_traces.len()).unwrap_or(u32::MAX);
            s.metrics.cache_hits += result.cache_hits;
            s.metrics.dropped_units += u32::try_from(result.dropped.len()).unwrap_or(u32::MAX);
            s.metrics.duration_ms += result.duration_ms;
            if matches!(result.status, NodeStatus::Failed { .. }) {
                s.metrics.errors += 1;
            }
        });
    }

    fn on_run_end(&self, _report: &RunReport) {
        let json = self.to_json();
        *self.flushed.write() = Some(json);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn result(node: &str, status: NodeStatus, rounds: u32) -> NodeResult {
        NodeResult {
            rounds,
            duration_ms: 10,
            ..NodeResult::settled(node, 0, status)
        }
    }

    #[test]
    fn test_initial_state_is_empty() {
        let monitor = RunMonitor::new();
        assert!(monitor.snapshot().is_empty());
        assert!(monitor.flushed().is_none());
    }

    #[test]
    fn test_status_transitions_are_tracked() {
        let monitor = RunMonitor::new();
        monitor.on_stage_start(0, &["a"]);
        monitor.on_node_status("a", &NodeStatus::Running);
        assert_eq!(monitor.get_state("a").unwrap().status, NodeStatus::Running);
        monitor.on_node_finished(&result("a", NodeStatus::Completed, 2));
        let state = monitor.get_state("a").unwrap();
        assert_eq!(state.status, NodeStatus::Completed);
        assert_eq!(state.stage, Some(0));
        assert_eq!(state.metrics.rounds, 2);
    }

    #[test]
    fn test_aggregate_metrics() {
        let monitor = RunMonitor::new();
        monitor.on_node_finished(&result("a", NodeStatus::Completed, 1));
        monitor.on_node_finished(&result("b", NodeStatus::failed("boom"), 3));
        let total = monitor.aggregate_metrics();
        assert_eq!(total.rounds, 4);
        assert_eq!(total.errors, 1);
        assert_eq!(total.duration_ms, 20);
    }

    #[test]
    fn test_to_json_sorted_by_node() {
        let monitor = RunMonitor::new();
        monitor.on_node_status("b", &NodeStatus::Ready);
        monitor.on_node_status("a", &NodeStatus::Ready);
        let json = monitor.to_json();
        assert_eq!(json["nodes"][0]["node"], "a");
        assert_eq!(json["nodes"][1]["node"], "b");
        assert_eq!(json["nodes"][0]["status"], "ready");
    }
}
