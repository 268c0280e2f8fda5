use crate::graph::select_nodes;
use crate::multiverse::CrewSpec;
use crate::types::NodeSpec;
use crewgraph_agent::{ContextBudget, FailoverBackend, LlmBackend, RetryPolicy};
use crewgraph_core::{CrewError, CrewResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// `[runtime]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub concurrency_limit: usize,
    pub run_timeout_ms: Option<u64>,
    pub retry: RetryPolicy,
    /// Budget for nodes that do not override it.
    pub context: ContextBudget,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            run_timeout_ms: None,
            retry: RetryPolicy::default(),
            context: ContextBudget::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    /// Wrap `backends` in a [`FailoverBackend`] using this retry policy.
    pub fn failover(&self, backends: Vec<Arc<dyn LlmBackend>>) -> CrewResult<Arc<dyn LlmBackend>> {
        Ok(Arc::new(FailoverBackend::new(backends, self.retry.clone())?))
    }
}

/// Top-level declarative configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrewgraphConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub agents: Vec<NodeSpec>,
    #[serde(default)]
    pub crews: Vec<CrewSpec>,
}

impl CrewgraphConfig {
    pub fn from_toml_str(s: &str) -> CrewResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| CrewError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> CrewResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!(
            path = %path.display(),
            agents = config.agents.len(),
            crews = config.crews.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> CrewResult<()> {
        let mut names = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return Err(CrewError::Config("agent with empty name".into()));
            }
            if !names.insert(agent.name.as_str()) {
                return Err(CrewError::Config(format!("duplicate agent '{}'", agent.name)));
            }
        }

        let mut crews = HashSet::new();
        for crew in &self.crews {
            if !crews.insert(crew.name.as_str()) {
                return Err(CrewError::Config(format!("duplicate crew '{}'", crew.name)));
            }
            if crew.universes.is_empty() {
                return Err(CrewError::Config(format!("crew '{}' has no universes", crew.name)));
            }
            for universe in &crew.universes {
                select_nodes(&self.agents, &universe.spec).map_err(|e| {
                    CrewError::Config(format!("crew '{}': {e}", crew.name))
                })?;
            }
            if let Some(judge) = &crew.judge {
                if !names.contains(judge.agent.as_str()) {
                    return Err(CrewError::Config(format!(
                        "crew '{}' judge references unknown agent '{}'",
                        crew.name, judge.agent
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn agent(&self, name: &str) -> Option<&NodeSpec> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn crew(&self, name: &str) -> Option<&CrewSpec> {
        self.crews.iter().find(|c| c.name == name)
    }
}
