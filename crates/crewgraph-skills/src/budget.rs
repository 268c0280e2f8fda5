//! Tool-call budgets for a single node and for a whole stage.
//!
//! A budget is checked before each call (call count) and after each call
//! (accumulated execution time). Exceeding a budget is not an error: the tool
//! loop stops issuing calls and moves to its final synthesis pass.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why a budget stopped the tool loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "cap")]
pub enum BudgetExceeded {
    /// `max_tool_rounds` reached.
    MaxRounds { limit: u32 },
    /// `tool_max_calls` reached before `skill`.
    MaxCalls { limit: u32, skill: String },
    /// `tool_max_exec_ms` exceeded after `skill`.
    MaxExec { limit_ms: u64, skill: String },
    /// `stage_tool_max_calls` reached before `skill`.
    StageMaxCalls {
        stage: usize,
        limit: u32,
        skill: String,
    },
    /// `stage_tool_max_exec_ms` exceeded after `skill`.
    StageMaxExec {
        stage: usize,
        limit_ms: u64,
        skill: String,
    },
}

impl fmt::Display for BudgetExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetExceeded::MaxRounds { limit } => {
                write!(f, "max_tool_rounds exhausted ({limit})")
            }
            BudgetExceeded::MaxCalls { limit, skill } => {
                write!(f, "tool_max_calls exceeded ({limit}) before {skill}")
            }
            BudgetExceeded::MaxExec { limit_ms, skill } => {
                write!(f, "tool_max_exec_ms exceeded ({limit_ms}ms) after {skill}")
            }
            BudgetExceeded::StageMaxCalls {
                stage,
                limit,
                skill,
            } => write!(
                f,
                "stage_tool_max_calls exceeded ({limit}) on stage={stage} before {skill}"
            ),
            BudgetExceeded::StageMaxExec {
                stage,
                limit_ms,
                skill,
            } => write!(
                f,
                "stage_tool_max_exec_ms exceeded ({limit_ms}ms) on stage={stage} after {skill}"
            ),
        }
    }
}

/// Snapshot of a node's budget handed to skills with every call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetState {
    pub round: u32,
    pub max_rounds: u32,
    pub calls_used: u32,
    pub max_calls: Option<u32>,
    pub exec_used_ms: u64,
    pub max_exec_ms: Option<u64>,
}

impl BudgetState {
    /// Calls left before `tool_max_calls` stops the loop, if capped.
    pub fn calls_remaining(&self) -> Option<u32> {
        self.max_calls.map(|max| max.saturating_sub(self.calls_used))
    }
}

/// Per-node tool budget. Owned by one tool loop; not shared.
#[derive(Debug, Clone, Default)]
pub struct ToolBudget {
    max_calls: Option<u32>,
    max_exec: Option<Duration>,
    calls_used: u32,
    exec_used: Duration,
}

impl ToolBudget {
    /// Zero limits are treated as "no limit".
    pub fn new(max_calls: Option<u32>, max_exec_ms: Option<u64>) -> Self {
        Self {
            max_calls: max_calls.filter(|v| *v > 0),
            max_exec: max_exec_ms.filter(|v| *v > 0).map(Duration::from_millis),
            calls_used: 0,
            exec_used: Duration::ZERO,
        }
    }

    /// Reserve one call.
    pub fn before_call(&mut self, skill: &str) -> Result<(), BudgetExceeded> {
        if let Some(max) = self.max_calls {
            if self.calls_used >= max {
                return Err(BudgetExceeded::MaxCalls {
                    limit: max,
                    skill: skill.trim().to_string(),
                });
            }
        }
        self.calls_used += 1;
        Ok(())
    }

    /// Give back a reservation for a call that was never issued.
    pub fn rollback_call(&mut self) {
        self.calls_used = self.calls_used.saturating_sub(1);
    }

    /// Record elapsed time and check the execution cap.
    pub fn after_call(&mut self, elapsed: Duration, skill: &str) -> Result<(), BudgetExceeded> {
        self.exec_used += elapsed;
        match self.max_exec {
            Some(max) if self.exec_used > max => Err(BudgetExceeded::MaxExec {
                limit_ms: max.as_millis() as u64,
                skill: skill.trim().to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn calls_used(&self) -> u32 {
        self.calls_used
    }

    /// Snapshot for skills.
    pub fn state(&self, round: u32, max_rounds: u32) -> BudgetState {
        BudgetState {
            round,
            max_rounds,
            calls_used: self.calls_used,
            max_calls: self.max_calls,
            exec_used_ms: self.exec_used.as_millis() as u64,
            max_exec_ms: self.max_exec.map(|d| d.as_millis() as u64),
        }
    }
}

#[derive(Debug, Default)]
struct StageUsage {
    calls_used: u32,
    exec_used: Duration,
}

/// Tool budget shared by every node of one stage.
#[derive(Debug)]
pub struct StageToolBudget {
    stage: usize,
    max_calls: Option<u32>,
    max_exec: Option<Duration>,
    usage: Mutex<StageUsage>,
}

impl StageToolBudget {
    /// Returns `None` when neither limit is set.
    pub fn new(stage: usize, max_calls: Option<u32>, max_exec_ms: Option<u64>) -> Option<Self> {
        let max_calls = max_calls.filter(|v| *v > 0);
        let max_exec = max_exec_ms.filter(|v| *v > 0).map(Duration::from_millis);
        if max_calls.is_none() && max_exec.is_none() {
            return None;
        }
        Some(Self {
            stage,
            max_calls,
            max_exec,
            usage: Mutex::new(StageUsage::default()),
        })
    }

    pub fn before_call(&self, skill: &str) -> Result<(), BudgetExceeded> {
        let mut usage = self.usage.lock();
        if let Some(max) = self.max_calls {
            if usage.calls_used >= max {
                return Err(BudgetExceeded::StageMaxCalls {
                    stage: self.stage,
                    limit: max,
                    skill: skill.trim().to_string(),
                });
            }
        }
        usage.calls_used += 1;
        Ok(())
    }

    pub fn rollback_call(&self) {
        let mut usage = self.usage.lock();
        usage.calls_used = usage.calls_used.saturating_sub(1);
    }

    pub fn after_call(&self, elapsed: Duration, skill: &str) -> Result<(), BudgetExceeded> {
        let mut usage = self.usage.lock();
        usage.exec_used += elapsed;
        match self.max_exec {
            Some(max) if usage.exec_used > max => Err(BudgetExceeded::StageMaxExec {
                stage: self.stage,
                limit_ms: max.as_millis() as u64,
                skill: skill.trim().to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// `(calls_used, exec_used)` so far.
    pub fn usage(&self) -> (u32, Duration) {
        let usage = self.usage.lock();
        (usage.calls_used, usage.exec_used)
    }
}
