use crate::budget::BudgetState;
use crate::skill::{Skill, SkillDescriptor};
use crewgraph_core::{CrewError, CrewResult, ToolCall, ToolResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Skills a node is allowed to call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkillAllowlist {
    names: BTreeSet<String>,
}

impl SkillAllowlist {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names
                .into_iter()
                .map(|n| {
                    let n: String = n.into();
                    n.trim().to_string()
                })
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    pub fn allows(&self, skill: &str) -> bool {
        self.names.contains(skill)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// Central registry for all available skills.
pub struct SkillRegistry {
    skills: HashMap<String, Arc<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self {
            skills: HashMap::new(),
        }
    }

    pub fn register(&mut self, skill: Arc<dyn Skill>) {
        let name = skill.descriptor().name.clone();
        info!(skill = %name, "Registered skill");
        self.skills.insert(name, skill);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Skill>> {
        self.skills.get(name)
    }

    /// Descriptors of every registered skill, sorted by name.
    pub fn list_descriptors(&self) -> Vec<&SkillDescriptor> {
        let mut out: Vec<_> = self.skills.values().map(|s| s.descriptor()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Descriptors of the registered skills a node may call, sorted by name.
    pub fn descriptors_for(&self, allowlist: &SkillAllowlist) -> Vec<SkillDescriptor> {
        allowlist
            .names()
            .filter_map(|name| self.skills.get(name))
            .map(|s| s.descriptor().clone())
            .collect()
    }

    /// Resolve a call to its skill, checking the node's allowlist first.
    ///
    /// A denied call is not an error: the returned `ToolResult` carries the
    /// denial so the model can react to it.
    pub fn authorize(
        &self,
        call: &ToolCall,
        allowlist: &SkillAllowlist,
    ) -> CrewResult<Result<Arc<dyn Skill>, ToolResult>> {
        let skill = self
            .skills
            .get(&call.name)
            .ok_or_else(|| CrewError::Skill(format!("Unknown skill: {}", call.name)))?;

        if !allowlist.allows(&call.name) {
            warn!(skill = %call.name, "Skill not allowed for node");
            return Ok(Err(ToolResult::error(
                &call.id,
                format!("Permission denied: skill '{}' is not allowed for this node", call.name),
            )));
        }
        Ok(Ok(Arc::clone(skill)))
    }

    /// Execute a tool call, checking the allowlist first.
    pub async fn execute(
        &self,
        call: ToolCall,
        allowlist: &SkillAllowlist,
        budget: &BudgetState,
    ) -> CrewResult<ToolResult> {
        match self.authorize(&call, allowlist)? {
            Ok(skill) => skill.execute(call, budget).await,
            Err(denied) => Ok(denied),
        }
    }

    pub fn skill_count(&self) -> usize {
        self.skills.len()
    }
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::new()
    }
}
