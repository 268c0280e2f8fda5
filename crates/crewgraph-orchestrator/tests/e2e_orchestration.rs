#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end orchestration tests.
//!
//! Runs whole graphs and crews against mock backends and skills: typed
//! handoffs between stages, failure propagation, merge policies, budgets,
//! cancellation, multiverse judging and configuration loading.

use async_trait::async_trait;
use crewgraph_agent::{ContextBudget, LlmBackend, ModelRequest, ModelResponse, ToolLoopLimits};
use crewgraph_core::{CrewError, CrewResult, Kind, ToolCall, ToolResult, TRUNCATION_MARKER};
use crewgraph_orchestrator::*;
use crewgraph_skills::{BudgetState, Skill, SkillDescriptor, SkillRegistry, ToolBroker};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Mock backend: answers per node, records every request
// ---------------------------------------------------------------------------

type Log = Arc<Mutex<Vec<ModelRequest>>>;

/// Body of the first rendered block that is not the run input.
fn upstream_content(context: &str) -> Option<String> {
    context
        .split("\n\n[")
        .enumerate()
        .map(|(i, block)| if i == 0 { block.to_string() } else { format!("[{block}") })
        .find(|block| !block.starts_with("[input |"))
        .and_then(|block| block.split_once('\n').map(|(_, body)| body.to_string()))
}

struct Mock {
    node: String,
    log: Log,
}

#[async_trait]
impl LlmBackend for Mock {
    async fn invoke(&self, request: &ModelRequest) -> CrewResult<ModelResponse> {
        self.log.lock().unwrap().push(request.clone());
        let text = &request.context.text;
        let reply = match self.node.as_str() {
            "x" => "ok".to_string(),
            "producer" => "A".repeat(1000),
            "broken" => return Err(CrewError::Backend("model unavailable".into())),
            "slow" => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late".to_string()
            }
            "looper" if !request.final_pass => {
                let call = ToolCall::new(
                    format!("c{}", request.round),
                    "probe",
                    serde_json::json!({ "round": request.round }),
                );
                return Ok(ModelResponse::with_calls("probing", vec![call]));
            }
            "looper" => "final answer".to_string(),
            "judge" => r#"```json
{"winner": "u2", "reason": "only branch that finished", "risk": "low"}
```"#
                .to_string(),
            "a" => "A".to_string(),
            "b" if upstream_content(text).is_none() => "B".to_string(),
            "u1-agent" => "first".to_string(),
            "u2-agent" => "second".to_string(),
            other => match upstream_content(text) {
                Some(up) => format!("{up}+{other}"),
                None => format!("{other}:none"),
            },
        };
        Ok(ModelResponse::text(reply))
    }
}

struct Probe {
    descriptor: SkillDescriptor,
}

#[async_trait]
impl Skill for Probe {
    fn descriptor(&self) -> &SkillDescriptor {
        &self.descriptor
    }

    async fn execute(&self, call: ToolCall, _budget: &BudgetState) -> CrewResult<ToolResult> {
        Ok(ToolResult::success(&call.id, format!("probe {}", call.arguments)))
    }
}

fn setup() -> (GraphRunner, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let shared = Arc::clone(&log);
    let factory: BackendFactory = Arc::new(move |node: &NodeSpec| {
        Arc::new(Mock {
            node: node.name.clone(),
            log: Arc::clone(&shared),
        }) as Arc<dyn LlmBackend>
    });
    let mut registry = SkillRegistry::new();
    registry.register(Arc::new(Probe {
        descriptor: SkillDescriptor::new("probe", "Probe the environment"),
    }));
    let broker = Arc::new(ToolBroker::new(Arc::new(registry)));
    (GraphRunner::new(factory, broker), log)
}

/// Input port that shows only the newest payload, without source tags.
fn latest(name: &str) -> InputPortSpec {
    InputPortSpec::new(name).with_policy(MergePolicy::Latest)
}

fn requests_for(log: &Log, node: &str) -> Vec<ModelRequest> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|r| r.node == node)
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Scenario A: typed handoff through three stages
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scenario_a_typed_chain() {
    let (runner, log) = setup();
    let nodes = vec![
        NodeSpec::new("x").with_output(OutputPortSpec::new("out", Kind::SummaryText)),
        NodeSpec::new("y")
            .depends_on(["x"])
            .with_input(latest("in").accepting([Kind::SummaryText]))
            .with_output(OutputPortSpec::new("out", Kind::SummaryText)),
        NodeSpec::new("z")
            .depends_on(["y"])
            .with_input(latest("in").accepting([Kind::SummaryText])),
    ];
    let report = runner
        .run(nodes, "summarise the repo", CancellationToken::new())
        .await
        .unwrap();

    assert!(report.all_completed());
    assert_eq!(report.output("z"), Some("ok+y+z"));
    assert!(report.dropped.is_empty());
    assert_eq!(report.sinks, vec!["z"]);

    let z = requests_for(&log, "z");
    assert!(z[0].context.contains_channel("y.out->z.in#summary/text"));
    assert!(z[0].context.contains_channel("input"));
}

// ---------------------------------------------------------------------------
// Scenario B: missing required input fails, downstream is skipped
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scenario_b_missing_required_input() {
    let (runner, log) = setup();
    let nodes = vec![
        NodeSpec::new("needs").with_input(
            InputPortSpec::new("spec")
                .accepting([Kind::PlanTask])
                .required(),
        ),
        NodeSpec::new("after").depends_on(["needs"]),
    ];
    let report = runner.run(nodes, "go", CancellationToken::new()).await.unwrap();

    assert_eq!(
        report.status("needs"),
        Some(&NodeStatus::failed("missing-required-input: spec"))
    );
    assert_eq!(
        report.status("after"),
        Some(&NodeStatus::skipped("upstream-failed: needs"))
    );
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_partial_upstream_failure_adds_marker() {
    let (runner, log) = setup();
    let nodes = vec![
        NodeSpec::new("a"),
        NodeSpec::new("broken"),
        NodeSpec::new("c").depends_on(["a", "broken"]),
    ];
    let report = runner.run(nodes, "go", CancellationToken::new()).await.unwrap();

    assert!(report.status("broken").unwrap().is_unsuccessful());
    assert!(report.status("c").unwrap().is_completed());
    let c = requests_for(&log, "c");
    assert!(c[0].context.contains_channel("upstream:broken"));
    assert!(c[0].context.text.contains("upstream broken failed"));
}

// ---------------------------------------------------------------------------
// Scenario C: judge sees the surviving branch and a failure marker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scenario_c_judge_after_partial_failure() {
    let (runner, log) = setup();
    let agents = vec![
        NodeSpec::new("broken"),
        NodeSpec::new("u2-agent"),
        NodeSpec::new("judge"),
    ];
    let crew = CrewSpec::new("race")
        .with_universe(UniverseSpec::new("broken"))
        .with_universe(UniverseSpec::new("u2-agent"))
        .with_judge(JudgeSpec::new("judge"));
    let report = MultiverseOrchestrator::new(agents, runner)
        .run(&crew, "pick the best", CancellationToken::new())
        .await
        .unwrap();

    assert!(report.universe("u1").unwrap().status.is_unsuccessful());
    assert_eq!(report.universe("u2").unwrap().output.as_deref(), Some("second"));

    let judge = report.judge.as_ref().unwrap();
    assert!(judge.status.is_completed());
    assert_eq!(judge.winner.as_deref(), Some("u2"));

    let seen = requests_for(&log, "judge");
    let context = &seen[0].context;
    assert!(context.contains_channel("u2.result->judge.branches#summary/text"));
    assert!(!context.contains_channel("u1.result->judge.branches#summary/text"));
    assert!(context.contains_channel("upstream:u1"));
    assert!(context.contains_channel(multiverse::COMPARE_CHANNEL));
    assert!(context.text.contains("second"));
}

#[tokio::test]
async fn test_universe_handoff_block() {
    let (runner, log) = setup();
    let agents = vec![NodeSpec::new("u1-agent"), NodeSpec::new("reader")];
    let crew = CrewSpec::new("chain")
        .with_universe(UniverseSpec::new("u1-agent").with_label("Draft"))
        .with_universe(UniverseSpec::new("reader").depends_on(["draft"]));
    let report = MultiverseOrchestrator::new(agents, runner)
        .run(&crew, "write it", CancellationToken::new())
        .await
        .unwrap();

    assert!(report.judge.is_none());
    let fingerprint = report.universe("u1").unwrap().fingerprint.clone().unwrap();
    let reader = requests_for(&log, "reader");
    let text = &reader[0].context.text;
    assert!(text.contains("[multiverse_handoffs]"));
    assert!(text.contains("- channel: u1.result->u2.context#summary/text"));
    assert!(text.contains("from: \"Draft (u1)\""));
    assert!(text.contains("status: ok"));
    assert!(text.contains(&format!("sink_fingerprint: {fingerprint}")));
    assert!(text.contains("- agent: u1-agent"));
}

// ---------------------------------------------------------------------------
// Structure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cycle_is_named_before_running() {
    let (runner, log) = setup();
    let nodes = vec![
        NodeSpec::new("a").depends_on(["c"]),
        NodeSpec::new("b").depends_on(["a"]),
        NodeSpec::new("c").depends_on(["b"]),
    ];
    let err = runner.run(nodes, "go", CancellationToken::new()).await.unwrap_err();
    let CrewError::Structural(issues) = err else {
        panic!("expected a structural error");
    };
    let cycle = issues.iter().find(|i| i.starts_with("cycle:")).unwrap();
    for name in ["a", "b", "c"] {
        assert!(cycle.contains(name), "{cycle}");
    }
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_known_type_mismatch_fails_before_running() {
    let (runner, log) = setup();
    let nodes = vec![
        NodeSpec::new("coder").with_output(OutputPortSpec::new("code", Kind::CodeRust)),
        NodeSpec::new("planner")
            .depends_on(["coder"])
            .with_input(InputPortSpec::new("tasks").accepting([Kind::PlanTask]).required()),
    ];
    let err = runner.run(nodes, "go", CancellationToken::new()).await.unwrap_err();
    let CrewError::Structural(issues) = err else {
        panic!("expected a structural error");
    };
    assert_eq!(
        issues,
        vec!["port 'planner.tasks' cannot accept 'code/rust' from 'coder.code'".to_string()]
    );
    assert!(log.lock().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Tool results stay within one run
// ---------------------------------------------------------------------------

struct Snapshot {
    descriptor: SkillDescriptor,
    runs: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl Skill for Snapshot {
    fn descriptor(&self) -> &SkillDescriptor {
        &self.descriptor
    }

    async fn execute(&self, call: ToolCall, _budget: &BudgetState) -> CrewResult<ToolResult> {
        let n = self.runs.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        Ok(ToolResult::success(&call.id, format!("notes version {n}")))
    }
}

#[tokio::test]
async fn test_cached_tool_results_do_not_leak_across_runs() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let shared = Arc::clone(&log);
    let factory: BackendFactory = Arc::new(move |node: &NodeSpec| {
        Arc::new(Mock {
            node: node.name.clone(),
            log: Arc::clone(&shared),
        }) as Arc<dyn LlmBackend>
    });
    let skill = Arc::new(Snapshot {
        descriptor: SkillDescriptor::new("snapshot", "Read the notes file").cacheable(),
        runs: std::sync::atomic::AtomicUsize::new(0),
    });
    let mut registry = SkillRegistry::new();
    registry.register(Arc::clone(&skill) as Arc<dyn Skill>);
    let runner = GraphRunner::new(factory, Arc::new(ToolBroker::new(Arc::new(registry))));

    let node = NodeSpec::new("reader")
        .with_skills(["snapshot"])
        .with_startup_call(StartupCall::new("snapshot", serde_json::json!({"path": "notes.md"})));
    for _ in 0..2 {
        let report = runner
            .run(vec![node.clone()], "go", CancellationToken::new())
            .await
            .unwrap();
        assert!(report.all_completed());
        assert_eq!(report.result("reader").unwrap().cache_hits, 0);
    }

    assert_eq!(skill.runs.load(std::sync::atomic::Ordering::SeqCst), 2);
    let requests = requests_for(&log, "reader");
    assert!(requests[0].context.text.contains("notes version 1"));
    assert!(requests.last().unwrap().context.text.contains("notes version 2"));
    assert_eq!(runner.broker().cache_stats(), (0, 0));
}

#[tokio::test]
async fn test_port_selector_limits_channel() {
    let (runner, log) = setup();
    let nodes = vec![
        NodeSpec::new("a")
            .with_output(OutputPortSpec::new("plan", Kind::PlanTask))
            .with_output(OutputPortSpec::new("notes", Kind::SummaryText)),
        NodeSpec::new("reader")
            .with_input(latest("ctx").accepting([Kind::PlanTask, Kind::SummaryText]))
            .with_port_selectors("ctx", ["a.notes"]),
    ];
    let graph = runner.plan(nodes.clone()).unwrap();
    assert_eq!(graph.stage_names(), vec![vec!["a"], vec!["reader"]]);
    assert_eq!(graph.channels().len(), 1);
    assert_eq!(graph.channels()[0].id, "a.notes->reader.ctx#summary/text");

    let report = runner.run(nodes, "go", CancellationToken::new()).await.unwrap();
    assert_eq!(report.output("reader"), Some("A+reader"));
    assert!(requests_for(&log, "reader")[0]
        .context
        .contains_channel("a.notes->reader.ctx#summary/text"));
}

// ---------------------------------------------------------------------------
// Merge policies and truncation
// ---------------------------------------------------------------------------

fn merge_graph(policy: MergePolicy) -> Vec<NodeSpec> {
    vec![
        NodeSpec::new("a"),
        NodeSpec::new("b").depends_on(["a"]).with_input(latest("input")),
        NodeSpec::new("merge")
            .depends_on(["a", "b"])
            .with_input(InputPortSpec::new("input").with_policy(policy)),
    ]
}

#[tokio::test]
async fn test_latest_merge_keeps_newest() {
    let (runner, _) = setup();
    let report = runner
        .run(merge_graph(MergePolicy::Latest), "go", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.output("b"), Some("A+b"));
    assert_eq!(report.output("merge"), Some("A+b+merge"));
}

#[tokio::test]
async fn test_append_merge_keeps_publish_order() {
    let (runner, log) = setup();
    let report = runner
        .run(merge_graph(MergePolicy::Append), "go", CancellationToken::new())
        .await
        .unwrap();
    assert!(report.all_completed());
    let merge = requests_for(&log, "merge");
    assert!(merge[0]
        .context
        .text
        .contains("[a.output] A\n[b.output] A+b"));
    assert!(merge[0].context.contains_channel("merge.input"));
}

#[tokio::test]
async fn test_truncation_round_trip() {
    let (runner, _) = setup();
    let nodes = vec![
        NodeSpec::new("producer"),
        NodeSpec::new("consumer")
            .depends_on(["producer"])
            .with_input(latest("input").with_max_chars(50)),
    ];
    let report = runner.run(nodes, "go", CancellationToken::new()).await.unwrap();
    let expected = format!("{}{TRUNCATION_MARKER}+consumer", "A".repeat(50));
    assert_eq!(report.output("consumer"), Some(expected.as_str()));
}

// ---------------------------------------------------------------------------
// Budgets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_zero_context_budget_drops_everything() {
    let (runner, log) = setup();
    let runner = runner.with_runtime(RuntimeConfig {
        context: ContextBudget {
            max_input_tokens: 0,
            ..ContextBudget::default()
        },
        ..RuntimeConfig::default()
    });
    let report = runner
        .run(vec![NodeSpec::new("x"), NodeSpec::new("y").depends_on(["x"])], "go", CancellationToken::new())
        .await
        .unwrap();

    assert!(report.all_completed());
    assert!(requests_for(&log, "y")[0].context.is_empty());
    let y_drops: Vec<_> = report.dropped.iter().filter(|d| d.node == "y").collect();
    assert_eq!(y_drops.len(), 2);
}

#[tokio::test]
async fn test_publish_budget_prefers_high_priority_channel() {
    let (runner, _) = setup();
    let nodes = vec![
        NodeSpec::new("a").with_publish_budget(PublishBudget {
            max_channels: 1,
            max_channel_tokens: 0,
        }),
        NodeSpec::new("low").depends_on(["a"]),
        NodeSpec::new("high")
            .depends_on(["a"])
            .with_input(latest("input").with_priority(2.0)),
    ];
    let report = runner.run(nodes, "go", CancellationToken::new()).await.unwrap();
    assert_eq!(report.output("high"), Some("A+high"));
    assert_eq!(report.output("low"), Some("low:none"));
}

#[tokio::test]
async fn test_tool_loop_terminates_at_round_cap() {
    let (runner, log) = setup();
    let node = NodeSpec::new("looper")
        .with_skills(["probe"])
        .with_limits(ToolLoopLimits {
            max_tool_rounds: 3,
            ..ToolLoopLimits::default()
        });
    let report = runner.run(vec![node], "explore", CancellationToken::new()).await.unwrap();

    let result = report.result("looper").unwrap();
    assert!(result.status.is_completed());
    assert_eq!(result.output.as_deref(), Some("final answer"));
    assert_eq!(result.rounds, 4);
    assert_eq!(result.tool_traces.len(), 3);
    assert!(result.warnings[0].starts_with("BudgetExhausted"));
    let last = requests_for(&log, "looper").pop().unwrap();
    assert!(last.final_pass);
    assert!(last.tools.is_empty());
}

// ---------------------------------------------------------------------------
// Determinism and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_runs_are_deterministic() {
    let nodes = vec![
        NodeSpec::new("a"),
        NodeSpec::new("b"),
        NodeSpec::new("merge").depends_on(["a", "b"]),
    ];
    let mut contexts = Vec::new();
    for _ in 0..2 {
        let (runner, log) = setup();
        runner.run(nodes.clone(), "go", CancellationToken::new()).await.unwrap();
        contexts.push(requests_for(&log, "merge")[0].context.clone());
    }
    assert_eq!(contexts[0], contexts[1]);
}

#[tokio::test]
async fn test_cancellation_fails_in_flight_and_skips_rest() {
    let (runner, _) = setup();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let nodes = vec![NodeSpec::new("slow"), NodeSpec::new("after").depends_on(["slow"])];
    let report = runner.run(nodes, "go", cancel).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(
        report.status("slow"),
        Some(&NodeStatus::failed("cancelled: run cancelled"))
    );
    assert_eq!(report.status("after"), Some(&NodeStatus::skipped("cancelled")));
}

#[tokio::test]
async fn test_node_timeout() {
    let (runner, _) = setup();
    let report = runner
        .run(vec![NodeSpec::new("slow").with_timeout_ms(20)], "go", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        report.status("slow"),
        Some(&NodeStatus::failed("cancelled: node timeout after 20ms"))
    );
    assert!(!report.cancelled);
}

#[tokio::test]
async fn test_monitor_observes_run() {
    let (runner, _) = setup();
    let monitor = Arc::new(RunMonitor::new());
    let runner = runner.with_observer(monitor.clone());
    runner
        .run_spec(
            &[NodeSpec::new("a"), NodeSpec::new("broken"), NodeSpec::new("c")],
            "a+broken>c",
            "go",
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let flushed = monitor.flushed().unwrap();
    assert_eq!(flushed["stages_started"], serde_json::json!([0, 1]));
    assert_eq!(monitor.get_state("c").unwrap().status, NodeStatus::Completed);
    assert_eq!(monitor.aggregate_metrics().errors, 1);
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const CONFIG: &str = r#"
[runtime]
concurrency_limit = 2

[[agents]]
name = "u1-agent"

[[agents]]
name = "u2-agent"

[[agents]]
name = "judge"

[[crews]]
name = "pair"
input = "choose one"

[[crews.universes]]
label = "First"
spec = "u1-agent"

[[crews.universes]]
label = "Second"
spec = "u2-agent"

[crews.judge]
agent = "judge"
max_chars_per_branch = 100
"#;

#[tokio::test]
async fn test_crew_from_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crewgraph.toml");
    std::fs::write(&path, CONFIG).unwrap();
    let config = CrewgraphConfig::load(&path).unwrap();

    let (runner, log) = setup();
    let orchestrator =
        MultiverseOrchestrator::new(config.agents.clone(), runner.with_runtime(config.runtime.clone()));
    let crew = config.crew("pair").unwrap();

    let trace = orchestrator.trace(crew).unwrap();
    assert_eq!(trace.outer.stages.len(), 2);

    let report = orchestrator.run(crew, "", CancellationToken::new()).await.unwrap();
    assert_eq!(report.succeeded().count(), 2);
    assert_eq!(report.winner().unwrap().display_name(), "Second (u2)");

    let judge = requests_for(&log, "judge");
    assert!(judge[0].context.text.contains("goal:\nchoose one"));
    assert!(report.to_string().contains("winner: u2"));
}
