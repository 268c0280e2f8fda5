//! Runs a graph of agent nodes end to end.
//!
//! [`GraphRunner`] plans the graph, then drives the [`Scheduler`] with an
//! [`AgentNodeExecutor`] that turns each node's resolved inputs into context
//! units and runs the tool loop through [`AgentRunner`].

use crate::config::RuntimeConfig;
use crate::graph::{select_nodes, Graph, GraphBuilder, GraphTrace};
use crate::monitor::{NoopObserver, RunObserver};
use crate::scheduler::{NodeExecutor, NodeInput, NodeOutput, RunReport, Scheduler};
use crate::types::{NodeSpec, NodeStatus};
use async_trait::async_trait;
use crewgraph_agent::{
    AgentRunner, ContextBudget, ContextCompiler, ContextUnit, LlmBackend, NodeInvocation,
};
use crewgraph_core::{CrewResult, Kind};
use crewgraph_skills::{SkillAllowlist, ToolBroker};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Picks the backend for a node.
pub type BackendFactory = Arc<dyn Fn(&NodeSpec) -> Arc<dyn LlmBackend> + Send + Sync>;

/// Channel name of the run input unit.
pub const INPUT_CHANNEL: &str = "input";

/// Base input with the node's prefix and suffix around it.
pub fn wrap_input(prefix: Option<&str>, input: &str, suffix: Option<&str>) -> String {
    [prefix, Some(input), suffix]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Diagnostic unit telling a node that a dependency did not complete.
pub fn failure_marker(node: &str, status: &NodeStatus) -> ContextUnit {
    let reason = status.reason().unwrap_or("did not complete");
    let state = match status {
        NodeStatus::Skipped { .. } => "skipped",
        _ => "failed",
    };
    ContextUnit::new(
        format!("upstream:{node}"),
        node,
        Kind::DiagnosticBuild,
        format!("upstream {node} {state}: {reason}"),
    )
    .required(true)
}

/// Executes [`NodeSpec`]s through the tool loop.
pub struct AgentNodeExecutor {
    factory: BackendFactory,
    broker: Arc<ToolBroker>,
    compiler: ContextCompiler,
    default_budget: ContextBudget,
    input: String,
}

impl AgentNodeExecutor {
    pub fn new(factory: BackendFactory, broker: Arc<ToolBroker>, input: impl Into<String>) -> Self {
        Self {
            factory,
            broker,
            compiler: ContextCompiler::default(),
            default_budget: ContextBudget::default(),
            input: input.into(),
        }
    }

    pub fn with_compiler(mut self, compiler: ContextCompiler) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn with_default_budget(mut self, budget: ContextBudget) -> Self {
        self.default_budget = budget;
        self
    }

    /// Units for one node: the run input, resolved ports, failure markers.
    pub fn units_for(&self, node: &NodeSpec, input: &NodeInput) -> Vec<ContextUnit> {
        let mut units = Vec::new();
        let base = wrap_input(
            node.input_prefix.as_deref(),
            &self.input,
            node.input_suffix.as_deref(),
        );
        if !base.is_empty() {
            units.push(
                ContextUnit::new(INPUT_CHANNEL, "user", Kind::MessageUser, base)
                    .required(true)
                    .with_priority(1.0),
            );
        }
        for resolved in input.inputs.iter().filter(|r| !r.is_empty()) {
            let source = resolved
                .contributions
                .last()
                .map(|p| p.from_node.clone())
                .unwrap_or_default();
            units.push(
                ContextUnit::new(resolved.label(), source, resolved.kind(), resolved.text())
                    .with_priority(resolved.priority)
                    .required(resolved.required)
                    .with_max_tokens(resolved.max_tokens),
            );
        }
        for upstream in input.unsuccessful_upstream() {
            units.push(failure_marker(&upstream.node, &upstream.status));
        }
        units
    }

    /// Run `node` through the tool loop over an explicit set of units.
    pub async fn run_units(
        &self,
        node: &NodeSpec,
        units: Vec<ContextUnit>,
        input: &NodeInput,
    ) -> CrewResult<NodeOutput> {
        let runner = AgentRunner::new((self.factory)(node), Arc::clone(&self.broker))
            .with_compiler(self.compiler.clone());

        let mut invocation = NodeInvocation::new(node.name.clone())
            .with_units(units)
            .with_moment(node.effective_moment())
            .with_budget(node.context.clone().unwrap_or_else(|| self.default_budget.clone()))
            .with_skills(SkillAllowlist::new(node.skills.iter().cloned()))
            .with_limits(node.tool_loop.clone())
            .with_startup_calls(node.startup_tool_calls())
            .with_stage_budget(input.stage_budget.clone())
            .with_cancel(input.cancel.clone());
        if let Some(prompt) = &node.system_prompt {
            invocation = invocation.with_system_prompt(prompt.clone());
        }

        let outcome = runner.run(invocation).await?;
        Ok(NodeOutput::from(outcome))
    }
}

#[async_trait]
impl NodeExecutor<NodeSpec> for AgentNodeExecutor {
    async fn execute(&self, node: &NodeSpec, input: NodeInput) -> CrewResult<NodeOutput> {
        let units = self.units_for(node, &input);
        self.run_units(node, units, &input).await
    }
}

/// Plans and runs graphs of agent nodes.
#[derive(Clone)]
pub struct GraphRunner {
    factory: BackendFactory,
    broker: Arc<ToolBroker>,
    compiler: ContextCompiler,
    runtime: RuntimeConfig,
    observer: Arc<dyn RunObserver>,
}

impl GraphRunner {
    pub fn new(factory: BackendFactory, broker: Arc<ToolBroker>) -> Self {
        Self {
            factory,
            broker,
            compiler: ContextCompiler::default(),
            runtime: RuntimeConfig::default(),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_compiler(mut self, compiler: ContextCompiler) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn factory(&self) -> &BackendFactory {
        &self.factory
    }

    /// Broker whose registry every run shares. Its own cache stays empty.
    pub fn broker(&self) -> &Arc<ToolBroker> {
        &self.broker
    }

    pub fn compiler(&self) -> &ContextCompiler {
        &self.compiler
    }

    /// Executor for agent nodes seeing `input` as the run input.
    ///
    /// Every executor gets a fresh broker, so cached tool results stay within
    /// one run.
    pub fn executor(&self, input: &str) -> AgentNodeExecutor {
        AgentNodeExecutor::new(Arc::clone(&self.factory), Arc::new(self.broker.for_run()), input)
            .with_compiler(self.compiler.clone())
            .with_default_budget(self.runtime.context.clone())
    }

    pub fn plan(&self, nodes: Vec<NodeSpec>) -> CrewResult<Graph<NodeSpec>> {
        GraphBuilder::new().nodes(nodes).build()
    }

    /// Trace of a staged expression over `agents` without running it.
    pub fn trace_spec(&self, agents: &[NodeSpec], expr: &str) -> CrewResult<GraphTrace> {
        Ok(self.plan(select_nodes(agents, expr)?)?.trace())
    }

    pub async fn run(
        &self,
        nodes: Vec<NodeSpec>,
        input: &str,
        cancel: CancellationToken,
    ) -> CrewResult<RunReport> {
        let graph = self.plan(nodes)?;
        info!(
            nodes = graph.len(),
            stages = graph.stages().len(),
            channels = graph.channels().len(),
            "Running graph"
        );
        let scheduler = Scheduler::new(graph, self.executor(input))
            .with_concurrency_limit(self.runtime.concurrency_limit)
            .with_run_timeout(self.runtime.run_timeout())
            .with_observer(Arc::clone(&self.observer))
            .with_cancel(cancel);
        Ok(scheduler.run().await)
    }

    /// Run the staged expression `expr` over `agents`.
    pub async fn run_spec(
        &self,
        agents: &[NodeSpec],
        expr: &str,
        input: &str,
        cancel: CancellationToken,
    ) -> CrewResult<RunReport> {
        let nodes = select_nodes(agents, expr)?;
        self.run(nodes, input, cancel).await
    }
}
