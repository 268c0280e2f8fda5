//! Stage-by-stage execution of a built graph.
//!
//! Stages run in order with a barrier between them. Within a stage every
//! ready node runs concurrently, bounded by a semaphore, and each node races
//! the run cancellation token, the run deadline and its own timeout.

use crate::graph::{Graph, GraphNode};
use crate::monitor::{NoopObserver, RunObserver};
use crate::router::{ChannelRouter, ResolvedInput};
use crate::types::NodeStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crewgraph_agent::{DroppedUnit, RunOutcome, ToolTrace};
use crewgraph_core::CrewResult;
use crewgraph_skills::StageToolBudget;
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs one node. Implemented by the agent graph runner and the multiverse layer.
#[async_trait]
pub trait NodeExecutor<N: GraphNode>: Send + Sync {
    async fn execute(&self, node: &N, input: NodeInput) -> CrewResult<NodeOutput>;
}

/// Status of a dependency when the node became ready.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamStatus {
    pub node: String,
    pub status: NodeStatus,
}

/// Everything the executor gets for one node.
#[derive(Debug, Clone)]
pub struct NodeInput {
    pub stage: usize,
    /// One entry per input port, in declaration order.
    pub inputs: Vec<ResolvedInput>,
    pub upstream: Vec<UpstreamStatus>,
    pub stage_budget: Option<Arc<StageToolBudget>>,
    pub cancel: CancellationToken,
}

impl NodeInput {
    pub fn input(&self, port: &str) -> Option<&ResolvedInput> {
        self.inputs.iter().find(|i| i.port == port)
    }

    /// Dependencies that failed or were skipped.
    pub fn unsuccessful_upstream(&self) -> impl Iterator<Item = &UpstreamStatus> {
        self.upstream.iter().filter(|u| u.status.is_unsuccessful())
    }
}

/// What an executor hands back for a completed node.
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    pub content: String,
    pub warnings: Vec<String>,
    pub dropped: Vec<DroppedUnit>,
    pub tool_traces: Vec<ToolTrace>,
    pub rounds: u32,
    pub cache_hits: u32,
}

impl NodeOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

impl From<RunOutcome> for NodeOutput {
    fn from(outcome: RunOutcome) -> Self {
        let dropped = outcome
            .contexts
            .last()
            .map(|c| c.dropped.clone())
            .unwrap_or_default();
        Self {
            content: outcome.content,
            warnings: outcome.warnings,
            dropped,
            tool_traces: outcome.tool_traces,
            rounds: outcome.rounds,
            cache_hits: outcome.cache_hits,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeResult {
    pub node: String,
    pub stage: usize,
    pub status: NodeStatus,
    pub output: Option<String>,
    pub warnings: Vec<String>,
    pub dropped: Vec<DroppedUnit>,
    pub tool_traces: Vec<ToolTrace>,
    pub rounds: u32,
    pub cache_hits: u32,
    pub duration_ms: u64,
}

impl NodeResult {
    /// Result for a node that never produced output.
    pub fn settled(node: impl Into<String>, stage: usize, status: NodeStatus) -> Self {
        Self {
            node: node.into(),
            stage,
            status,
            output: None,
            warnings: Vec::new(),
            dropped: Vec::new(),
            tool_traces: Vec::new(),
            rounds: 0,
            cache_hits: 0,
            duration_ms: 0,
        }
    }
}

/// A dropped context unit attributed to its node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDrop {
    pub node: String,
    #[serde(flatten)]
    pub unit: DroppedUnit,
}

/// Outcome of a whole run; every node appears exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// In declaration order.
    pub results: Vec<NodeResult>,
    pub dropped: Vec<NodeDrop>,
    /// Nodes nothing depends on.
    pub sinks: Vec<String>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn result(&self, node: &str) -> Option<&NodeResult> {
        self.results.iter().find(|r| r.node == node)
    }

    pub fn status(&self, node: &str) -> Option<&NodeStatus> {
        self.result(node).map(|r| &r.status)
    }

    pub fn output(&self, node: &str) -> Option<&str> {
        self.result(node).and_then(|r| r.output.as_deref())
    }

    pub fn all_completed(&self) -> bool {
        self.results.iter().all(|r| r.status.is_completed())
    }

    /// `(sink, output)` for every completed sink.
    pub fn sink_outputs(&self) -> Vec<(&str, &str)> {
        self.sinks
            .iter()
            .filter_map(|s| self.result(s))
            .filter(|r| r.status.is_completed())
            .filter_map(|r| r.output.as_deref().map(|o| (r.node.as_str(), o)))
            .collect()
    }
}

pub struct Scheduler<N, E> {
    graph: Graph<N>,
    executor: E,
    concurrency_limit: usize,
    run_timeout: Option<Duration>,
    observer: Arc<dyn RunObserver>,
    cancel: CancellationToken,
}

impl<N: GraphNode, E: NodeExecutor<N>> Scheduler<N, E> {
    pub const DEFAULT_CONCURRENCY_LIMIT: usize = 4;

    pub fn new(graph: Graph<N>, executor: E) -> Self {
        Self {
            graph,
            executor,
            concurrency_limit: Self::DEFAULT_CONCURRENCY_LIMIT,
            run_timeout: None,
            observer: Arc::new(NoopObserver),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn graph(&self) -> &Graph<N> {
        &self.graph
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub async fn run(&self) -> RunReport {
        let started_at = Utc::now();
        let started = Instant::now();
        let deadline = self.run_timeout.map(|t| started + t);
        let router = ChannelRouter::for_graph(&self.graph);
        let mut statuses = vec![NodeStatus::Pending; self.graph.len()];
        let mut results: Vec<Option<NodeResult>> = vec![None; self.graph.len()];
        let mut cancelled = false;

        for (stage_idx, stage) in self.graph.stages().iter().enumerate() {
            let expired = deadline.is_some_and(|d| Instant::now() >= d);
            if self.cancel.is_cancelled() || expired {
                cancelled = true;
            }
            if cancelled {
                for &idx in stage {
                    let result =
                        NodeResult::settled(self.graph.node(idx).name(), stage_idx, NodeStatus::skipped("cancelled"));
                    self.settle(&mut statuses, &mut results, idx, result);
                }
                continue;
            }

            let names: Vec<&str> = stage.iter().map(|&i| self.graph.node(i).name()).collect();
            info!(stage = stage_idx, nodes = ?names, "Starting stage");
            self.observer.on_stage_start(stage_idx, &names);

            let stage_budget = self.stage_budget(stage_idx, stage);
            let mut ready = Vec::new();
            for &idx in stage {
                let name = self.graph.node(idx).name();
                match self.readiness(idx, &statuses, &router) {
                    Ok(inputs) => {
                        statuses[idx] = NodeStatus::Ready;
                        self.observer.on_node_status(name, &NodeStatus::Ready);
                        ready.push((idx, inputs));
                    }
                    Err(status) => {
                        warn!(node = %name, status = %status, "Node not runnable");
                        let result = NodeResult::settled(name, stage_idx, status);
                        self.settle(&mut statuses, &mut results, idx, result);
                    }
                }
            }

            let semaphore = Semaphore::new(self.concurrency_limit);
            let runs: Vec<_> = ready
                .into_iter()
                .map(|(idx, inputs)| {
                    let upstream = self
                        .graph
                        .deps(idx)
                        .iter()
                        .map(|&d| UpstreamStatus {
                            node: self.graph.node(d).name().to_string(),
                            status: statuses[d].clone(),
                        })
                        .collect();
                    let input = NodeInput {
                        stage: stage_idx,
                        inputs,
                        upstream,
                        stage_budget: stage_budget.clone(),
                        cancel: self.cancel.child_token(),
                    };
                    let semaphore = &semaphore;
                    let router = &router;
                    async move { (idx, self.run_node(idx, input, semaphore, router, deadline).await) }
                })
                .collect();

            for (idx, result) in join_all(runs).await {
                self.settle(&mut statuses, &mut results, idx, result);
            }
        }

        if self.cancel.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d) {
            cancelled = true;
        }

        let results: Vec<NodeResult> = results
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                r.unwrap_or_else(|| NodeResult::settled(self.graph.node(i).name(), 0, statuses[i].clone()))
            })
            .collect();
        let dropped = results
            .iter()
            .flat_map(|r| {
                r.dropped.iter().map(|unit| NodeDrop {
                    node: r.node.clone(),
                    unit: unit.clone(),
                })
            })
            .collect();
        let report = RunReport {
            started_at,
            duration_ms: millis(started.elapsed()),
            results,
            dropped,
            sinks: self
                .graph
                .sinks()
                .into_iter()
                .map(|i| self.graph.node(i).name().to_string())
                .collect(),
            cancelled,
        };
        info!(
            nodes = report.results.len(),
            completed = report.results.iter().filter(|r| r.status.is_completed()).count(),
            cancelled,
            duration_ms = report.duration_ms,
            "Run finished"
        );
        self.observer.on_run_end(&report);
        report
    }

    fn settle(
        &self,
        statuses: &mut [NodeStatus],
        results: &mut [Option<NodeResult>],
        idx: usize,
        result: NodeResult,
    ) {
        statuses[idx] = result.status.clone();
        self.observer.on_node_finished(&result);
        results[idx] = Some(result);
    }

    /// Resolved inputs, or the terminal status that keeps the node from running.
    fn readiness(
        &self,
        idx: usize,
        statuses: &[NodeStatus],
        router: &ChannelRouter,
    ) -> Result<Vec<ResolvedInput>, NodeStatus> {
        let deps = self.graph.deps(idx);
        if !deps.is_empty() && deps.iter().all(|&d| !statuses[d].is_completed()) {
            let names: Vec<&str> = deps.iter().map(|&d| self.graph.node(d).name()).collect();
            return Err(NodeStatus::skipped(format!("upstream-failed: {}", names.join(", "))));
        }

        let name = self.graph.node(idx).name();
        let mut inputs = Vec::new();
        for port in self.graph.inputs_of(idx) {
            let resolved = router.resolve(name, &port.name);
            if port.required && resolved.is_empty() {
                let failed_producer = self.graph.channels_into(name, &port.name).find(|ch| {
                    self.graph
                        .index_of(&ch.from_node)
                        .is_some_and(|p| statuses[p].is_unsuccessful())
                });
                return Err(match failed_producer {
                    Some(ch) => NodeStatus::skipped(format!(
                        "upstream-failed: {} <- {}",
                        port.name, ch.from_node
                    )),
                    None => NodeStatus::failed(format!("missing-required-input: {}", port.name)),
                });
            }
            inputs.push(resolved);
        }
        Ok(inputs)
    }

    /// Tightest positive caps requested by the stage's nodes.
    fn stage_budget(&self, stage_idx: usize, stage: &[usize]) -> Option<Arc<StageToolBudget>> {
        let mut calls: Option<u32> = None;
        let mut exec: Option<u64> = None;
        for &idx in stage {
            let (c, e) = self.graph.node(idx).stage_tool_budget();
            calls = min_positive(calls, c);
            exec = min_positive(exec, e);
        }
        StageToolBudget::new(stage_idx, calls, exec).map(Arc::new)
    }

    async fn run_node(
        &self,
        idx: usize,
        input: NodeInput,
        semaphore: &Semaphore,
        router: &ChannelRouter,
        deadline: Option<Instant>,
    ) -> NodeResult {
        let node = self.graph.node(idx);
        let name = node.name();
        let stage = input.stage;

        let Ok(_permit) = semaphore.acquire().await else {
            return NodeResult::settled(name, stage, NodeStatus::skipped("cancelled"));
        };
        if self.cancel.is_cancelled() {
            return NodeResult::settled(name, stage, NodeStatus::skipped("cancelled"));
        }

        self.observer.on_node_status(name, &NodeStatus::Running);
        let started = Instant::now();
        let node_cancel = input.cancel.clone();
        let timeout = node.timeout();
        let node_deadline = timeout.map(|t| started + t);

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(NodeStatus::failed("cancelled: run cancelled")),
            _ = sleep_until_opt(deadline) => Err(NodeStatus::failed("cancelled: run timeout")),
            _ = sleep_until_opt(node_deadline) => Err(NodeStatus::failed(format!(
                "cancelled: node timeout after {}ms",
                timeout.map_or(0, millis)
            ))),
            r = self.executor.execute(node, input) => r.map_err(|e| {
                if e.is_cancelled() {
                    NodeStatus::failed(format!("cancelled: {e}"))
                } else {
                    NodeStatus::failed(e.to_string())
                }
            }),
        };
        node_cancel.cancel();
        let duration_ms = millis(started.elapsed());

        match outcome {
            Ok(output) => {
                let mut fed = 0;
                for port in self.graph.outputs_of(idx) {
                    fed += router.publish(name, &port.name, &output.content);
                }
                info!(node = %name, stage, duration_ms, channels = fed, "Node completed");
                NodeResult {
                    node: name.to_string(),
                    stage,
                    status: NodeStatus::Completed,
                    output: Some(output.content),
                    warnings: output.warnings,
                    dropped: output.dropped,
                    tool_traces: output.tool_traces,
                    rounds: output.rounds,
                    cache_hits: output.cache_hits,
                    duration_ms,
                }
            }
            Err(status) => {
                warn!(node = %name, stage, status = %status, "Node failed");
                NodeResult {
                    duration_ms,
                    ..NodeResult::settled(name, stage, status)
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

fn min_positive<T: PartialOrd + Default + Copy>(current: Option<T>, next: Option<T>) -> Option<T> {
    match (current, next.filter(|v| *v > T::default())) {
        (Some(c), Some(n)) => Some(if n < c { n } else { c }),
        (c, n) => c.or(n),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::monitor::RunMonitor;
    use crate::types::{InputPortSpec, NodeSpec};
    use crewgraph_core::CrewError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes its inputs; fails nodes named `fail*`; sleeps in nodes named `slow*`.
    #[derive(Default)]
    struct Echo {
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl NodeExecutor<NodeSpec> for Echo {
        async fn execute(&self, node: &NodeSpec, input: NodeInput) -> CrewResult<NodeOutput> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if node.name.starts_with("slow") {
                tokio::time::sleep(Duration::from_millis(200)).await;
            } else {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            if node.name.starts_with("fail") {
                return Err(CrewError::Backend("boom".into()));
            }
            let seen: Vec<String> = input.inputs.iter().map(ResolvedInput::text).collect();
            Ok(NodeOutput::text(format!("{}({})", node.name, seen.join("|"))))
        }
    }

    fn scheduler(nodes: Vec<NodeSpec>) -> Scheduler<NodeSpec, Echo> {
        let graph = GraphBuilder::new().nodes(nodes).build().unwrap();
        Scheduler::new(graph, Echo::default())
    }

    #[tokio::test]
    async fn test_chain_passes_outputs_downstream() {
        let s = scheduler(vec![
            NodeSpec::new("a"),
            NodeSpec::new("b").depends_on(["a"]),
        ]);
        let report = s.run().await;
        assert!(report.all_completed());
        assert_eq!(report.output("b"), Some("b([a.output] a())"));
        assert_eq!(report.sinks, vec!["b"]);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependents() {
        let s = scheduler(vec![
            NodeSpec::new("fail_a"),
            NodeSpec::new("b").depends_on(["fail_a"]),
            NodeSpec::new("c").depends_on(["b"]),
        ]);
        let report = s.run().await;
        assert!(matches!(report.status("fail_a"), Some(NodeStatus::Failed { .. })));
        assert_eq!(
            report.status("b"),
            Some(&NodeStatus::skipped("upstream-failed: fail_a"))
        );
        assert!(matches!(report.status("c"), Some(NodeStatus::Skipped { .. })));
        assert_eq!(report.results.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_required_input_fails_node() {
        let s = scheduler(vec![
            NodeSpec::new("lonely").with_input(InputPortSpec::new("spec").required()),
            NodeSpec::new("after").depends_on(["lonely"]),
        ]);
        let report = s.run().await;
        assert_eq!(
            report.status("lonely"),
            Some(&NodeStatus::failed("missing-required-input: spec"))
        );
        assert!(matches!(report.status("after"), Some(NodeStatus::Skipped { .. })));
    }

    #[tokio::test]
    async fn test_required_port_from_failed_producer_is_skipped() {
        let s = scheduler(vec![
            NodeSpec::new("ok"),
            NodeSpec::new("fail_b"),
            NodeSpec::new("c")
                .depends_on(["ok"])
                .with_input(InputPortSpec::new("review").required())
                .with_port_selectors("review", ["fail_b"]),
        ]);
        let report = s.run().await;
        assert_eq!(
            report.status("c"),
            Some(&NodeStatus::skipped("upstream-failed: review <- fail_b"))
        );
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let nodes: Vec<_> = (0..6).map(|i| NodeSpec::new(format!("n{i}"))).collect();
        let graph = GraphBuilder::new().nodes(nodes).build().unwrap();
        let s = Scheduler::new(graph, Echo::default()).with_concurrency_limit(2);
        let report = s.run().await;
        assert!(report.all_completed());
        assert!(s.executor().max_active.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_node_timeout_fails_only_that_node() {
        let s = scheduler(vec![
            NodeSpec::new("slow").with_timeout_ms(20),
            NodeSpec::new("quick"),
        ]);
        let report = s.run().await;
        assert_eq!(
            report.status("slow"),
            Some(&NodeStatus::failed("cancelled: node timeout after 20ms"))
        );
        assert_eq!(report.status("quick"), Some(&NodeStatus::Completed));
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn test_cancellation_skips_later_stages() {
        let cancel = CancellationToken::new();
        let graph = GraphBuilder::new()
            .nodes(vec![NodeSpec::new("slow"), NodeSpec::new("next").depends_on(["slow"])])
            .build()
            .unwrap();
        let monitor = Arc::new(RunMonitor::new());
        let s = Scheduler::new(graph, Echo::default())
            .with_cancel(cancel.clone())
            .with_observer(monitor.clone());
        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
        let report = s.run().await;
        trigger.await.unwrap();
        assert!(report.cancelled);
        assert_eq!(
            report.status("slow"),
            Some(&NodeStatus::failed("cancelled: run cancelled"))
        );
        assert_eq!(report.status("next"), Some(&NodeStatus::skipped("cancelled")));
        assert!(monitor.flushed().is_some());
    }

    #[test]
    fn test_min_positive() {
        assert_eq!(min_positive(None, Some(3u32)), Some(3));
        assert_eq!(min_positive(Some(3u32), Some(0)), Some(3));
        assert_eq!(min_positive(Some(3u32), Some(2)), Some(2));
        assert_eq!(min_positive::<u64>(None, None), None);
    }
}
