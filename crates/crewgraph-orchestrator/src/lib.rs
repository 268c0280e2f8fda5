//! Typed agent graphs: building, routing, scheduling, and multiverse runs.
//!
//! Nodes declare typed input and output ports; the builder infers channels
//! between them, the scheduler runs the graph stage by stage, and the router
//! merges what producers publish into what consumers see.
//!
//! # Main types
//!
//! - [`GraphBuilder`] — Validates nodes and infers stages and channels.
//! - [`ChannelRouter`] — Stores published payloads per channel and applies merge policies.
//! - [`Scheduler`] — Runs a [`Graph`] stage by stage with bounded concurrency.
//! - [`GraphRunner`] — Runs graphs of agent nodes through the tool loop.
//! - [`MultiverseOrchestrator`] — Runs several universes side by side, with an optional judge.
//! - [`CrewgraphConfig`] — Declarative TOML configuration.

/// Declarative configuration.
pub mod config;
/// Agent node execution.
pub mod engine;
/// Graph building and validation.
pub mod graph;
/// Judge verdict parsing.
pub mod judge;
/// Run observers and metrics.
pub mod monitor;
/// Universes, crews and the judge.
pub mod multiverse;
/// Channel storage and merge policies.
pub mod router;
/// Stage-by-stage execution.
pub mod scheduler;
/// Node, port and status types.
pub mod types;

pub use config::{CrewgraphConfig, RuntimeConfig};
pub use engine::{failure_marker, wrap_input, AgentNodeExecutor, BackendFactory, GraphRunner};
pub use graph::{
    parse_spec_expression, select_nodes, Channel, Graph, GraphBuilder, GraphNode, GraphTrace,
    PortSelector, StructuralIssue,
};
pub use judge::JudgeDecision;
pub use monitor::{NodeMetrics, NodeState, NoopObserver, RunMonitor, RunObserver};
pub use multiverse::{
    sink_fingerprint, CrewNode, CrewSpec, JudgeNode, JudgeReport, JudgeSpec, MultiverseOrchestrator,
    MultiverseReport, MultiverseTrace, SinkOutput, UniverseNode, UniverseReport, UniverseSpec,
    UniverseTrace,
};
pub use router::{ChannelRouter, Payload, ResolvedInput};
pub use scheduler::{
    NodeDrop, NodeExecutor, NodeInput, NodeOutput, NodeResult, RunReport, Scheduler, UpstreamStatus,
};
pub use types::{
    InputPortSpec, MergePolicy, NodeSpec, NodeStatus, OutputPortSpec, PublishBudget, StartupCall,
};
