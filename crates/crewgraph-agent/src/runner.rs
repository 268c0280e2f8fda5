//! The bounded tool loop for one node.
//!
//! [`AgentRunner`] compiles the node's context, asks the backend for a reply,
//! executes requested tool calls through the [`ToolBroker`] and feeds their
//! results back as context units. Rounds, repeated calls and tool budgets are
//! capped; when a cap is hit the model gets one final synthesis pass.

use crate::backend::{LlmBackend, ModelRequest, ModelResponse};
use crate::config::ToolLoopLimits;
use crate::context::{CompiledContext, ContextBudget, ContextCompiler, ContextUnit, Moment};
use crewgraph_core::{CrewError, CrewResult, Kind, Message, ToolCall, ToolResult};
use crewgraph_skills::{
    BudgetExceeded, SkillAllowlist, SkillDescriptor, StageToolBudget, ToolBroker, ToolBudget,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything one node invocation needs besides the backend and the broker.
#[derive(Debug, Clone)]
pub struct NodeInvocation {
    pub node: String,
    pub system_prompt: Option<String>,
    /// Units from resolved inputs and upstream markers.
    pub units: Vec<ContextUnit>,
    pub moment: Moment,
    pub budget: ContextBudget,
    pub skills: SkillAllowlist,
    pub limits: ToolLoopLimits,
    /// Calls executed before the first model round.
    pub startup_calls: Vec<ToolCall>,
    pub stage_budget: Option<Arc<StageToolBudget>>,
    pub cancel: CancellationToken,
}

impl NodeInvocation {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            system_prompt: None,
            units: Vec::new(),
            moment: Moment::General,
            budget: ContextBudget::default(),
            skills: SkillAllowlist::default(),
            limits: ToolLoopLimits::default(),
            startup_calls: Vec::new(),
            stage_budget: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_units(mut self, units: Vec<ContextUnit>) -> Self {
        self.units = units;
        self
    }

    pub fn with_moment(mut self, moment: Moment) -> Self {
        self.moment = moment;
        self
    }

    pub fn with_budget(mut self, budget: ContextBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_skills(mut self, skills: SkillAllowlist) -> Self {
        self.skills = skills;
        self
    }

    pub fn with_limits(mut self, limits: ToolLoopLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_startup_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.startup_calls = calls;
        self
    }

    pub fn with_stage_budget(mut self, stage_budget: Option<Arc<StageToolBudget>>) -> Self {
        self.stage_budget = stage_budget;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// One tool call as the loop saw it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolTrace {
    pub round: u32,
    pub call_id: String,
    pub skill: String,
    pub kind: Kind,
    pub is_error: bool,
    pub cached: bool,
    pub elapsed_ms: u64,
    /// Set when the call was answered without executing it.
    pub refused: Option<String>,
}

/// Result of a completed tool loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub content: String,
    /// Model invocations, including the final synthesis pass.
    pub rounds: u32,
    pub tool_traces: Vec<ToolTrace>,
    pub cache_hits: u32,
    /// Set when a cap forced the final synthesis pass.
    pub exhausted: Option<BudgetExceeded>,
    pub warnings: Vec<String>,
    pub contexts: Vec<CompiledContext>,
}

impl RunOutcome {
    pub fn forced(&self) -> bool {
        self.exhausted.is_some()
    }
}

struct LoopState {
    units: Vec<ContextUnit>,
    transcript: Vec<Message>,
    budget: ToolBudget,
    seen: HashMap<String, u32>,
    traces: Vec<ToolTrace>,
    cache_hits: u32,
    contexts: Vec<CompiledContext>,
    rounds: u32,
}

/// Drives the bounded request/execute/respond cycle for one node.
pub struct AgentRunner {
    backend: Arc<dyn LlmBackend>,
    broker: Arc<ToolBroker>,
    compiler: ContextCompiler,
}

impl AgentRunner {
    pub fn new(backend: Arc<dyn LlmBackend>, broker: Arc<ToolBroker>) -> Self {
        Self {
            backend,
            broker,
            compiler: ContextCompiler::new(),
        }
    }

    pub fn with_compiler(mut self, compiler: ContextCompiler) -> Self {
        self.compiler = compiler;
        self
    }

    /// Run the tool loop to completion.
    ///
    /// Hitting a cap is not an error: the loop finishes with a synthesis pass
    /// and reports the cap in [`RunOutcome::exhausted`].
    pub async fn run(&self, inv: NodeInvocation) -> CrewResult<RunOutcome> {
        let tools = if inv.skills.is_empty() {
            Vec::new()
        } else {
            self.broker.registry().descriptors_for(&inv.skills)
        };
        let max_rounds = inv.limits.rounds();
        let mut state = LoopState {
            units: inv.units.clone(),
            transcript: Vec::new(),
            budget: ToolBudget::new(inv.limits.tool_max_calls, inv.limits.tool_max_exec_ms),
            seen: HashMap::new(),
            traces: Vec::new(),
            cache_hits: 0,
            contexts: Vec::new(),
            rounds: 0,
        };
        let mut exhausted: Option<BudgetExceeded> = None;

        info!(node = %inv.node, moment = %inv.moment, tools = tools.len(), "Starting tool loop");

        for call in inv.startup_calls.iter().cloned() {
            if let Some(cap) = self.dispatch(&inv, &mut state, call, 0, max_rounds).await? {
                exhausted = Some(cap);
                break;
            }
        }

        if exhausted.is_none() {
            for round in 0..max_rounds {
                let response = self
                    .invoke(&inv, &mut state, inv.moment, tools.clone(), round, false)
                    .await?;

                if !response.wants_tools() || tools.is_empty() {
                    info!(node = %inv.node, rounds = state.rounds, "Tool loop completed");
                    return Ok(finish(state, response.content, None));
                }

                state.transcript.push(Message::assistant_with_calls(
                    response.content.clone(),
                    response.tool_calls.clone(),
                ));
                for call in response.tool_calls {
                    if let Some(cap) = self.dispatch(&inv, &mut state, call, round, max_rounds).await? {
                        exhausted = Some(cap);
                        break;
                    }
                }
                if exhausted.is_some() {
                    break;
                }
            }
        }

        let cap = exhausted.unwrap_or(BudgetExceeded::MaxRounds { limit: max_rounds });
        warn!(node = %inv.node, cap = %cap, "Tool budget exhausted, forcing final synthesis");

        let round = state.rounds;
        let response = self
            .invoke(&inv, &mut state, Moment::Synthesis, Vec::new(), round, true)
            .await?;
        if response.wants_tools() {
            debug!(
                node = %inv.node,
                ignored = response.tool_calls.len(),
                "Ignoring tool calls on final pass"
            );
        }
        Ok(finish(state, response.content, Some(cap)))
    }

    async fn invoke(
        &self,
        inv: &NodeInvocation,
        state: &mut LoopState,
        moment: Moment,
        tools: Vec<SkillDescriptor>,
        round: u32,
        final_pass: bool,
    ) -> CrewResult<ModelResponse> {
        let context = self.compiler.compile(&state.units, moment, &inv.budget);
        let request = ModelRequest {
            node: inv.node.clone(),
            system_prompt: inv.system_prompt.clone(),
            context,
            transcript: state.transcript.clone(),
            tools,
            round,
            final_pass,
        };
        state.rounds += 1;

        let response = tokio::select! {
            biased;
            _ = inv.cancel.cancelled() => {
                return Err(CrewError::Cancelled(format!("node {} cancelled", inv.node)));
            }
            r = self.backend.invoke(&request) => r?,
        };
        state.contexts.push(request.context);
        Ok(response)
    }

    /// Execute one call. Returns the cap that stopped the loop, if any.
    async fn dispatch(
        &self,
        inv: &NodeInvocation,
        state: &mut LoopState,
        call: ToolCall,
        round: u32,
        max_rounds: u32,
    ) -> CrewResult<Option<BudgetExceeded>> {
        if inv.cancel.is_cancelled() {
            return Err(CrewError::Cancelled(format!("node {} cancelled", inv.node)));
        }

        let seen = state.seen.entry(call.fingerprint()).or_insert(0);
        *seen += 1;
        let max_repeats = inv.limits.max_repeated_tool_calls;
        if max_repeats > 0 && *seen > max_repeats {
            let times = *seen;
            warn!(node = %inv.node, skill = %call.name, times, "Refusing repeated tool call");
            let result = ToolResult::error(
                &call.id,
                format!(
                    "repeated tool call refused: {} was already called {} times with these arguments; use the earlier results",
                    call.name, max_repeats
                ),
            );
            record(state, &call, result, round, false, 0, Some("repeated".into()));
            return Ok(None);
        }

        if let Err(cap) = state.budget.before_call(&call.name) {
            return Ok(Some(cap));
        }
        if let Some(stage) = &inv.stage_budget {
            if let Err(cap) = stage.before_call(&call.name) {
                state.budget.rollback_call();
                return Ok(Some(cap));
            }
        }

        let budget_state = state.budget.state(round, max_rounds);
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = inv.cancel.cancelled() => {
                return Err(CrewError::Cancelled(format!("node {} cancelled", inv.node)));
            }
            r = self.broker.execute(call.clone(), &inv.skills, &budget_state) => r,
        };
        let elapsed = started.elapsed();

        let (result, cached) = match outcome {
            Ok(brokered) => (brokered.result, brokered.cached),
            Err(e) => {
                warn!(node = %inv.node, skill = %call.name, error = %e, "Tool call failed");
                (ToolResult::error(&call.id, e.to_string()), false)
            }
        };
        if cached {
            state.cache_hits += 1;
        }
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        record(state, &call, result, round, cached, elapsed_ms, None);

        if let Err(cap) = state.budget.after_call(elapsed, &call.name) {
            return Ok(Some(cap));
        }
        if let Some(stage) = &inv.stage_budget {
            if let Err(cap) = stage.after_call(elapsed, &call.name) {
                return Ok(Some(cap));
            }
        }
        Ok(None)
    }
}

fn record(
    state: &mut LoopState,
    call: &ToolCall,
    result: ToolResult,
    round: u32,
    cached: bool,
    elapsed_ms: u64,
    refused: Option<String>,
) {
    state.traces.push(ToolTrace {
        round,
        call_id: call.id.clone(),
        skill: call.name.clone(),
        kind: result.kind,
        is_error: result.is_error,
        cached,
        elapsed_ms,
        refused,
    });
    state.units.push(
        ContextUnit::new(format!("tool:{}", call.name), call.name.clone(), result.kind, result.content)
            .at_moment(Moment::ToolLoop),
    );
}

fn finish(state: LoopState, content: String, exhausted: Option<BudgetExceeded>) -> RunOutcome {
    let warnings = exhausted
        .iter()
        .map(|cap| format!("BudgetExhausted: {cap}"))
        .collect();
    RunOutcome {
        content,
        rounds: state.rounds,
        tool_traces: state.traces,
        cache_hits: state.cache_hits,
        exhausted,
        warnings,
        contexts: state.contexts,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crewgraph_skills::{BudgetState, Skill, SkillRegistry};
    use std::sync::Mutex;

    /// Replays a fixed list of responses and records every request.
    struct Script {
        responses: Mutex<Vec<ModelResponse>>,
        requests: Mutex<Vec<ModelRequest>>,
    }

    impl Script {
        fn new(responses: Vec<ModelResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<ModelRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmBackend for Script {
        async fn invoke(&self, request: &ModelRequest) -> CrewResult<ModelResponse> {
            self.requests.lock().unwrap().push(request.clone());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(ModelResponse::text("done"))
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    struct Echo {
        descriptor: SkillDescriptor,
    }

    #[async_trait]
    impl Skill for Echo {
        fn descriptor(&self) -> &SkillDescriptor {
            &self.descriptor
        }

        async fn execute(&self, call: ToolCall, _budget: &BudgetState) -> CrewResult<ToolResult> {
            Ok(ToolResult::success(&call.id, format!("echo {}", call.arguments)))
        }
    }

    fn broker() -> Arc<ToolBroker> {
        let mut reg = SkillRegistry::new();
        reg.register(Arc::new(Echo {
            descriptor: SkillDescriptor::new("echo", "echo args"),
        }));
        Arc::new(ToolBroker::new(Arc::new(reg)))
    }

    fn call(id: &str, n: u32) -> ToolCall {
        ToolCall::new(id, "echo", serde_json::json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_no_tool_calls_is_final() {
        let backend = Script::new(vec![ModelResponse::text("answer")]);
        let runner = AgentRunner::new(backend.clone(), broker());
        let out = runner
            .run(NodeInvocation::new("n").with_skills(SkillAllowlist::new(["echo"])))
            .await
            .unwrap();
        assert_eq!(out.content, "answer");
        assert_eq!(out.rounds, 1);
        assert!(!out.forced());
        assert_eq!(backend.requests()[0].tools.len(), 1);
    }

    #[tokio::test]
    async fn test_node_without_skills_ignores_tool_calls() {
        let backend = Script::new(vec![ModelResponse::with_calls("text", vec![call("1", 1)])]);
        let runner = AgentRunner::new(backend.clone(), broker());
        let out = runner.run(NodeInvocation::new("n")).await.unwrap();
        assert_eq!(out.content, "text");
        assert!(out.tool_traces.is_empty());
        assert!(backend.requests()[0].tools.is_empty());
    }

    #[tokio::test]
    async fn test_tool_results_feed_next_round() {
        let backend = Script::new(vec![
            ModelResponse::with_calls("", vec![call("1", 7)]),
            ModelResponse::text("final"),
        ]);
        let runner = AgentRunner::new(backend.clone(), broker());
        let out = runner
            .run(
                NodeInvocation::new("n")
                    .with_skills(SkillAllowlist::new(["echo"]))
                    .with_moment(Moment::ToolLoop),
            )
            .await
            .unwrap();
        assert_eq!(out.content, "final");
        assert_eq!(out.rounds, 2);
        assert_eq!(out.tool_traces.len(), 1);
        let second = &backend.requests()[1];
        assert!(second.context.contains_channel("tool:echo"));
        assert!(second.context.text.contains("echo {\"n\":7}"));
        assert_eq!(second.transcript.len(), 1);
    }

    #[tokio::test]
    async fn test_round_cap_forces_synthesis() {
        let responses = (0..10)
            .map(|i| ModelResponse::with_calls("", vec![call(&i.to_string(), i)]))
            .collect();
        let backend = Script::new(responses);
        let runner = AgentRunner::new(backend.clone(), broker());
        let limits = ToolLoopLimits {
            max_tool_rounds: 3,
            ..Default::default()
        };
        let out = runner
            .run(
                NodeInvocation::new("n")
                    .with_skills(SkillAllowlist::new(["echo"]))
                    .with_limits(limits),
            )
            .await
            .unwrap();
        assert_eq!(out.rounds, 4);
        assert_eq!(out.exhausted, Some(BudgetExceeded::MaxRounds { limit: 3 }));
        assert!(out.warnings[0].starts_with("BudgetExhausted"));
        let last = backend.requests().pop().unwrap();
        assert!(last.final_pass);
        assert!(last.tools.is_empty());
        assert_eq!(last.context.moment, Moment::Synthesis);
    }

    #[tokio::test]
    async fn test_call_cap_forces_synthesis() {
        let backend = Script::new(vec![ModelResponse::with_calls(
            "",
            vec![call("1", 1), call("2", 2), call("3", 3)],
        )]);
        let runner = AgentRunner::new(backend, broker());
        let limits = ToolLoopLimits {
            tool_max_calls: Some(2),
            ..Default::default()
        };
        let out = runner
            .run(
                NodeInvocation::new("n")
                    .with_skills(SkillAllowlist::new(["echo"]))
                    .with_limits(limits),
            )
            .await
            .unwrap();
        assert_eq!(out.tool_traces.len(), 2);
        assert!(matches!(out.exhausted, Some(BudgetExceeded::MaxCalls { limit: 2, .. })));
        assert_eq!(out.rounds, 2);
    }

    #[tokio::test]
    async fn test_repeated_calls_refused() {
        let backend = Script::new(vec![
            ModelResponse::with_calls("", vec![call("1", 1)]),
            ModelResponse::with_calls("", vec![call("2", 1)]),
            ModelResponse::with_calls("", vec![call("3", 1)]),
            ModelResponse::text("ok"),
        ]);
        let runner = AgentRunner::new(backend, broker());
        let out = runner
            .run(NodeInvocation::new("n").with_skills(SkillAllowlist::new(["echo"])))
            .await
            .unwrap();
        assert_eq!(out.tool_traces.len(), 3);
        let third = &out.tool_traces[2];
        assert_eq!(third.refused.as_deref(), Some("repeated"));
        assert_eq!(third.kind, Kind::ToolError);
        assert!(out.tool_traces[..2].iter().all(|t| t.refused.is_none()));
    }

    #[tokio::test]
    async fn test_unknown_skill_becomes_tool_error() {
        let backend = Script::new(vec![
            ModelResponse::with_calls("", vec![ToolCall::new("1", "ghost", serde_json::json!({}))]),
            ModelResponse::text("ok"),
        ]);
        let runner = AgentRunner::new(backend, broker());
        let out = runner
            .run(NodeInvocation::new("n").with_skills(SkillAllowlist::new(["echo"])))
            .await
            .unwrap();
        assert_eq!(out.content, "ok");
        assert!(out.tool_traces[0].is_error);
        assert_eq!(out.tool_traces[0].kind, Kind::ToolError);
    }

    #[tokio::test]
    async fn test_startup_calls_run_first() {
        let backend = Script::new(vec![ModelResponse::text("ok")]);
        let runner = AgentRunner::new(backend.clone(), broker());
        let out = runner
            .run(
                NodeInvocation::new("n")
                    .with_skills(SkillAllowlist::new(["echo"]))
                    .with_startup_calls(vec![call("s", 9)]),
            )
            .await
            .unwrap();
        assert_eq!(out.tool_traces[0].round, 0);
        assert!(backend.requests()[0].context.contains_channel("tool:echo"));
    }

    #[tokio::test]
    async fn test_stage_budget_shared_cap() {
        let stage = Arc::new(StageToolBudget::new(2, Some(1), None).unwrap());
        stage.before_call("other-node").unwrap();
        let backend = Script::new(vec![ModelResponse::with_calls("", vec![call("1", 1)])]);
        let runner = AgentRunner::new(backend, broker());
        let out = runner
            .run(
                NodeInvocation::new("n")
                    .with_skills(SkillAllowlist::new(["echo"]))
                    .with_stage_budget(Some(stage)),
            )
            .await
            .unwrap();
        assert!(matches!(
            out.exhausted,
            Some(BudgetExceeded::StageMaxCalls { stage: 2, .. })
        ));
        assert!(out.tool_traces.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_invoke() {
        let backend = Script::new(vec![ModelResponse::text("never")]);
        let runner = AgentRunner::new(backend, broker());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = runner
            .run(NodeInvocation::new("n").with_cancel(cancel))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
