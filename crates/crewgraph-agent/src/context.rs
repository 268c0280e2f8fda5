//! Context compilation for one model invocation.
//!
//! The compiler takes the typed units a node can see (resolved channel
//! inputs, tool results, failure markers), scores them for the current
//! [`Moment`] and admits them greedily into a bounded token budget. Everything
//! that does not fit is recorded in the drop report rather than discarded
//! silently.

use crewgraph_core::{truncate_chars, CrewError, Kind, TRUNCATION_MARKER};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Phase of work a node is in; shifts which kinds of context matter most.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Moment {
    #[default]
    General,
    Plan,
    Discovery,
    #[serde(alias = "tools")]
    ToolLoop,
    #[serde(alias = "answer")]
    Synthesis,
    #[serde(alias = "validation")]
    Validate,
}

impl Moment {
    pub fn as_str(self) -> &'static str {
        match self {
            Moment::General => "general",
            Moment::Plan => "plan",
            Moment::Discovery => "discovery",
            Moment::ToolLoop => "tool_loop",
            Moment::Synthesis => "synthesis",
            Moment::Validate => "validate",
        }
    }
}

impl fmt::Display for Moment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Moment {
    type Err = CrewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "" | "general" => Ok(Moment::General),
            "plan" => Ok(Moment::Plan),
            "discovery" => Ok(Moment::Discovery),
            "tool_loop" | "tools" => Ok(Moment::ToolLoop),
            "synthesis" | "answer" => Ok(Moment::Synthesis),
            "validate" | "validation" => Ok(Moment::Validate),
            other => Err(CrewError::Config(format!("unknown moment: {other}"))),
        }
    }
}

/// Token limits for one compiled context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextBudget {
    pub max_input_tokens: usize,
    pub safety_margin: usize,
    /// Distinct channels admitted. `0` means no limit.
    pub max_channels: usize,
    /// Per-unit token cap. `0` means no cap.
    pub max_channel_tokens: usize,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_input_tokens: 1200,
            safety_margin: 80,
            max_channels: 12,
            max_channel_tokens: 400,
        }
    }
}

impl ContextBudget {
    /// Tokens available for context text.
    ///
    /// The safety margin is only reserved when at least 128 tokens remain
    /// after it; small budgets are used in full.
    pub fn limit(&self) -> usize {
        match self.max_input_tokens.checked_sub(self.safety_margin) {
            Some(limit) if limit >= 128 => limit,
            _ => self.max_input_tokens,
        }
    }
}

/// Estimates how many model tokens a text costs.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;

    /// Longest prefix of `text` that, with the truncation marker, fits in
    /// `max_tokens`. When the cap cannot hold the marker itself the prefix is
    /// cut bare, so the result never exceeds the cap.
    fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if self.estimate(text) <= max_tokens {
            return text.to_string();
        }
        let total = text.chars().count();
        if self.estimate(TRUNCATION_MARKER) > max_tokens {
            let keep = longest_prefix(total, |n| {
                self.estimate(&text.chars().take(n).collect::<String>()) <= max_tokens
            });
            return text.chars().take(keep).collect();
        }
        // `total - 1` keeps at least one char out, so the marker is always appended.
        let keep = longest_prefix(total.saturating_sub(1), |n| {
            self.estimate(&truncate_chars(text, n).0) <= max_tokens
        });
        truncate_chars(text, keep).0.into_owned()
    }
}

/// Largest `n` in `0..=max` with `fits(n)`, assuming `fits` is monotone.
fn longest_prefix(max: usize, fits: impl Fn(usize) -> bool) -> usize {
    let (mut lo, mut hi) = (0usize, max);
    while lo < hi {
        let mid = (lo + hi).div_ceil(2);
        if fits(mid) {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    lo
}

/// Roughly four characters per token.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharTokenEstimator;

impl TokenEstimator for CharTokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        let chars = text.trim().chars().count();
        if chars == 0 {
            0
        } else {
            (chars + 3) / 4
        }
    }
}

/// Four tokens for every three words, rounded up.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordTokenEstimator;

impl TokenEstimator for WordTokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        let words = text.split_whitespace().count();
        (words * 4).div_ceil(3)
    }
}

/// One piece of candidate context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextUnit {
    /// Channel id, or `tool:{name}` for tool results.
    pub channel: String,
    pub source: String,
    pub kind: Kind,
    pub content: String,
    #[serde(default)]
    pub priority: f64,
    #[serde(default)]
    pub required: bool,
    /// Moment the unit was produced in; `None` counts as general.
    #[serde(default)]
    pub moment: Option<Moment>,
    /// Port-level token cap, applied before the budget's per-channel cap.
    #[serde(default)]
    pub max_tokens: Option<usize>,
}

impl ContextUnit {
    pub fn new(
        channel: impl Into<String>,
        source: impl Into<String>,
        kind: Kind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            source: source.into(),
            kind,
            content: content.into(),
            priority: 0.0,
            required: false,
            moment: None,
            max_tokens: None,
        }
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn at_moment(mut self, moment: Moment) -> Self {
        self.moment = Some(moment);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<usize>) -> Self {
        self.max_tokens = max_tokens.filter(|t| *t > 0);
        self
    }

    /// `max(0.5, 1 + priority + 1 if required)`.
    pub fn channel_priority(&self) -> f64 {
        let required = if self.required { 1.0 } else { 0.0 };
        (1.0 + self.priority + required).max(0.5)
    }

    fn render(&self, content: &str) -> String {
        format!("[{} | {}]\n{}", self.channel, self.kind, content)
    }
}

/// What a moment boost applies to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoostTarget {
    Category(&'static str),
    Kind(Kind),
}

/// Per-kind weights and per-moment boosts used for scoring.
#[derive(Debug, Clone)]
pub struct WeightProfile {
    pub category_weights: HashMap<&'static str, f64>,
    pub kind_weights: HashMap<Kind, f64>,
    pub moment_boosts: HashMap<Moment, Vec<(BoostTarget, f64)>>,
    pub match_moment_boost: f64,
    pub general_unit_boost: f64,
    pub floor: f64,
}

impl Default for WeightProfile {
    fn default() -> Self {
        use BoostTarget::{Category as C, Kind as K};

        let category_weights = HashMap::from([
            ("primitive", 0.2),
            ("text", 0.8),
            ("code", 0.5),
            ("json", 0.9),
            ("data", 0.8),
            ("artifact", 1.0),
            ("tool", 1.8),
            ("capability", 0.2),
            ("plan", 1.1),
            ("diagnostic", 1.9),
            ("memory", 2.2),
            ("message", 1.1),
            ("summary", 2.0),
            ("context", 0.4),
            ("contract", 1.2),
            ("db", 0.9),
            ("backend", 0.7),
            ("frontend", 0.7),
            ("test", 1.0),
        ]);
        let kind_weights = HashMap::from([
            (Kind::MemoryFact, 3.0),
            (Kind::MemoryQuestion, 2.8),
            (Kind::MemorySummary, 2.6),
            (Kind::SummaryCode, 2.8),
            (Kind::SummaryText, 2.4),
            (Kind::DiagnosticBuild, 3.1),
            (Kind::DiagnosticTest, 3.0),
            (Kind::DiagnosticLint, 2.7),
            (Kind::ToolError, 3.6),
            (Kind::ToolResult, 2.0),
            (Kind::ArtifactRef, 1.8),
            (Kind::ArtifactSummary, 2.2),
            (Kind::CodeGo, 0.9),
            (Kind::CodeTs, 0.9),
            (Kind::CodeTsx, 0.8),
            (Kind::CodeJs, 0.8),
            (Kind::CodePython, 0.9),
            (Kind::CodeRust, 0.9),
            (Kind::TextMarkdown, 1.1),
            (Kind::TextPrompt, 1.6),
            (Kind::MessageSystem, 2.0),
            (Kind::MessageAgent, 1.4),
            (Kind::MessageAssistant, 1.2),
            (Kind::MessageTool, 1.3),
        ]);
        let moment_boosts = HashMap::from([
            (
                Moment::Plan,
                vec![
                    (C("plan"), 1.8),
                    (C("memory"), 1.0),
                    (C("message"), 0.8),
                    (C("tool"), -0.4),
                    (C("artifact"), -0.3),
                ],
            ),
            (
                Moment::Discovery,
                vec![
                    (C("memory"), 1.4),
                    (C("artifact"), 1.2),
                    (C("summary"), 1.3),
                    (C("tool"), 0.7),
                    (C("code"), 0.4),
                ],
            ),
            (
                Moment::ToolLoop,
                vec![
                    (C("tool"), 2.4),
                    (K(Kind::ToolError), 1.4),
                    (C("artifact"), 1.2),
                    (K(Kind::ArtifactRef), 0.8),
                    (C("diagnostic"), 1.2),
                    (C("summary"), 0.9),
                    (C("memory"), 0.5),
                    (K(Kind::MessageAssistant), -0.4),
                ],
            ),
            (
                Moment::Synthesis,
                vec![
                    (C("summary"), 2.0),
                    (C("memory"), 1.6),
                    (C("artifact"), 0.8),
                    (C("diagnostic"), 1.0),
                    (C("tool"), 0.4),
                    (C("code"), -0.3),
                ],
            ),
            (
                Moment::Validate,
                vec![
                    (C("diagnostic"), 2.5),
                    (C("tool"), 1.2),
                    (C("summary"), 1.0),
                    (C("memory"), 0.6),
                ],
            ),
        ]);

        Self {
            category_weights,
            kind_weights,
            moment_boosts,
            match_moment_boost: 1.0,
            general_unit_boost: 0.3,
            floor: 0.05,
        }
    }
}

impl WeightProfile {
    /// Weight of `kind` in `current`, for a unit produced in `unit_moment`.
    pub fn type_weight(&self, kind: Kind, current: Moment, unit_moment: Option<Moment>) -> f64 {
        let category = kind.category();
        let mut weight = self
            .kind_weights
            .get(&kind)
            .or_else(|| self.category_weights.get(category))
            .copied()
            .unwrap_or(1.0);

        let unit_moment = unit_moment.unwrap_or_default();
        if unit_moment == current {
            weight += self.match_moment_boost;
        }
        if unit_moment == Moment::General {
            weight += self.general_unit_boost;
        }
        if let Some(boosts) = self.moment_boosts.get(&current) {
            for (target, boost) in boosts {
                let hit = match target {
                    BoostTarget::Category(c) => *c == category,
                    BoostTarget::Kind(k) => *k == kind,
                };
                if hit {
                    weight += boost;
                }
            }
        }
        weight.max(self.floor)
    }
}

/// Why a unit was left out of a compiled context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Empty,
    OverChannelCount,
    OverTokenBudget,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DropReason::Empty => "empty",
            DropReason::OverChannelCount => "over_channel_count",
            DropReason::OverTokenBudget => "over_token_budget",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedUnit {
    pub channel: String,
    pub source: String,
    pub kind: Kind,
    pub tokens: usize,
    pub reason: DropReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmittedUnit {
    pub channel: String,
    pub source: String,
    pub kind: Kind,
    pub score: f64,
    pub tokens: usize,
    pub truncated: bool,
}

/// The bounded context handed to one model invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledContext {
    pub moment: Moment,
    pub text: String,
    pub admitted: Vec<AdmittedUnit>,
    pub dropped: Vec<DroppedUnit>,
    /// Channels whose unit was cut to fit a per-unit cap.
    pub truncated: Vec<String>,
    pub tokens_used: usize,
    pub token_limit: usize,
}

impl CompiledContext {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Whether any admitted unit came from `channel`.
    pub fn contains_channel(&self, channel: &str) -> bool {
        self.admitted.iter().any(|u| u.channel == channel)
    }
}

const BLOCK_SEPARATOR: &str = "\n\n";

/// Scores, admits and renders [`ContextUnit`]s.
#[derive(Clone)]
pub struct ContextCompiler {
    estimator: Arc<dyn TokenEstimator>,
    weights: Arc<WeightProfile>,
}

impl Default for ContextCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextCompiler {
    pub fn new() -> Self {
        Self {
            estimator: Arc::new(CharTokenEstimator),
            weights: Arc::new(WeightProfile::default()),
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_weights(mut self, weights: WeightProfile) -> Self {
        self.weights = Arc::new(weights);
        self
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    pub fn score(&self, unit: &ContextUnit, moment: Moment) -> f64 {
        self.weights.type_weight(unit.kind, moment, unit.moment) * unit.channel_priority()
    }

    /// Compile `units` for `moment` under `budget`. Deterministic for equal inputs.
    pub fn compile(
        &self,
        units: &[ContextUnit],
        moment: Moment,
        budget: &ContextBudget,
    ) -> CompiledContext {
        let limit = budget.limit();
        let separator_tokens = self.estimator.estimate(BLOCK_SEPARATOR);

        let mut ranked: Vec<(f64, &ContextUnit)> =
            units.iter().map(|u| (self.score(u, moment), u)).collect();
        // Stable: equal scores keep input order.
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut out = CompiledContext {
            moment,
            token_limit: limit,
            ..Default::default()
        };
        let mut blocks: Vec<String> = Vec::new();
        let mut channels: HashSet<&str> = HashSet::new();
        let mut used = 0usize;

        for (score, unit) in ranked {
            let content = unit.content.trim();
            let raw_tokens = self.estimator.estimate(content);
            let drop = |reason| DroppedUnit {
                channel: unit.channel.clone(),
                source: unit.source.clone(),
                kind: unit.kind,
                tokens: raw_tokens,
                reason,
            };

            if content.is_empty() {
                out.dropped.push(drop(DropReason::Empty));
                continue;
            }
            if budget.max_channels > 0
                && !channels.contains(unit.channel.as_str())
                && channels.len() >= budget.max_channels
            {
                out.dropped.push(drop(DropReason::OverChannelCount));
                continue;
            }

            let cap = [unit.max_tokens, Some(budget.max_channel_tokens).filter(|c| *c > 0)]
                .into_iter()
                .flatten()
                .min();
            let (content, truncated) = match cap {
                Some(cap) if raw_tokens > cap => (self.estimator.truncate(content, cap), true),
                _ => (content.to_string(), false),
            };
            if content.trim().is_empty() {
                out.dropped.push(drop(DropReason::Empty));
                continue;
            }

            let block = unit.render(&content);
            let block_tokens = self.estimator.estimate(&block);
            let cost = if blocks.is_empty() {
                block_tokens
            } else {
                block_tokens + separator_tokens
            };
            if used + cost > limit {
                out.dropped.push(drop(DropReason::OverTokenBudget));
                continue;
            }

            used += cost;
            channels.insert(unit.channel.as_str());
            if truncated {
                out.truncated.push(unit.channel.clone());
            }
            blocks.push(block);
            out.admitted.push(AdmittedUnit {
                channel: unit.channel.clone(),
                source: unit.source.clone(),
                kind: unit.kind,
                score,
                tokens: block_tokens,
                truncated,
            });
        }

        // Estimators need not be additive; re-check the joined text.
        let mut text = blocks.join(BLOCK_SEPARATOR);
        while !blocks.is_empty() && self.estimator.estimate(&text) > limit {
            blocks.pop();
            if let Some(evicted) = out.admitted.pop() {
                if evicted.truncated {
                    out.truncated.retain(|c| c != &evicted.channel);
                }
                out.dropped.push(DroppedUnit {
                    channel: evicted.channel,
                    source: evicted.source,
                    kind: evicted.kind,
                    tokens: evicted.tokens,
                    reason: DropReason::OverTokenBudget,
                });
            }
            text = blocks.join(BLOCK_SEPARATOR);
        }

        out.tokens_used = self.estimator.estimate(&text);
        out.text = text;
        out
    }
}
