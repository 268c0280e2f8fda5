//! Skill registry, tool-call budgets and the run-scoped tool broker.

/// Shared tool-call cache and resource locks.
pub mod broker;
/// Per-node and per-stage tool budgets.
pub mod budget;
/// Skill lookup and allowlist enforcement.
pub mod registry;
/// The skill trait and its descriptor.
pub mod skill;

pub use broker::{BrokeredResult, ToolBroker};
pub use budget::{BudgetExceeded, BudgetState, StageToolBudget, ToolBudget};
pub use registry::{SkillAllowlist, SkillRegistry};
pub use skill::{Skill, SkillDescriptor};
