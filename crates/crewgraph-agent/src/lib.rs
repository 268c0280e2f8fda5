//! Model-facing side of a node: the backend trait, failover, the context
//! compiler and the bounded tool loop.

/// Model-calling collaborator and its request/response types.
pub mod backend;
/// Tool-loop limits.
pub mod config;
/// Context compiler.
pub mod context;
/// Failover across backends with retries.
pub mod failover;
/// The tool loop.
pub mod runner;

pub use backend::{LlmBackend, ModelRequest, ModelResponse};
pub use config::ToolLoopLimits;
pub use context::{
    AdmittedUnit, CharTokenEstimator, CompiledContext, ContextBudget, ContextCompiler,
    ContextUnit, DropReason, DroppedUnit, Moment, TokenEstimator, WeightProfile,
    WordTokenEstimator,
};
pub use failover::{is_retryable, FailoverBackend, RetryPolicy};
pub use runner::{AgentRunner, NodeInvocation, RunOutcome, ToolTrace};
