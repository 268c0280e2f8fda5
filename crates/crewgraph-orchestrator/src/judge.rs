//! Parsing of the judge's verdict.

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Decision extracted from a judge response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JudgeDecision {
    /// Branch id, label, or number as the judge wrote it.
    pub winner: Option<String>,
    pub reason: Option<String>,
    pub diffs: Vec<String>,
    pub risk: Option<String>,
    pub followups: Vec<String>,
}

const WINNER_KEYS: &[&str] = &["winner", "winner_id", "selected_branch", "selected", "best_branch", "branch"];
const REASON_KEYS: &[&str] = &["reason", "why"];
const DIFF_KEYS: &[&str] = &["diffs", "tradeoffs"];
const RISK_KEYS: &[&str] = &["risk"];
const FOLLOWUP_KEYS: &[&str] = &["followup", "next_steps", "followups"];

#[allow(clippy::expect_used)]
static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").expect("fenced JSON pattern is valid")
});

#[allow(clippy::expect_used)]
static SECTION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:#{1,6}\s*)?(?:\*\*)?([A-Za-z][A-Za-z _-]*?)(?:\*\*)?\s*(?::\s*(.*))?$")
        .expect("section pattern is valid")
});

impl JudgeDecision {
    /// Read a decision from fenced JSON, raw JSON, any embedded object, or
    /// finally headed sections and `key: value` lines.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let fenced = FENCED_JSON
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| object(m.as_str()));
        let raw = || object(text);
        let embedded = || match (text.find('{'), text.rfind('}')) {
            (Some(start), Some(end)) if start < end => object(&text[start..=end]),
            _ => None,
        };
        if let Some(map) = fenced.or_else(raw).or_else(embedded) {
            let decision = Self::from_map(&map);
            if decision.is_meaningful() {
                return Some(decision);
            }
        }
        Self::from_sections(text)
    }

    fn is_meaningful(&self) -> bool {
        self.winner.is_some() || self.reason.is_some()
    }

    fn from_map(map: &Map<String, Value>) -> Self {
        let lookup = |keys: &[&str]| {
            map.iter()
                .find(|(k, _)| keys.contains(&normalize_key(k).as_str()))
                .map(|(_, v)| v)
        };
        Self {
            winner: lookup(WINNER_KEYS).and_then(scalar),
            reason: lookup(REASON_KEYS).and_then(scalar),
            diffs: lookup(DIFF_KEYS).map(list).unwrap_or_default(),
            risk: lookup(RISK_KEYS).and_then(scalar),
            followups: lookup(FOLLOWUP_KEYS).map(list).unwrap_or_default(),
        }
    }

    fn from_sections(text: &str) -> Option<Self> {
        let mut decision = Self::default();
        let mut current: Option<&'static [&'static str]> = None;
        let mut body: Vec<String> = Vec::new();

        let flush = |section: Option<&'static [&'static str]>, body: &mut Vec<String>, d: &mut Self| {
            let taken = std::mem::take(body);
            if let Some(keys) = section {
                assign(d, keys, taken);
            }
        };

        for line in text.lines() {
            let heading = SECTION_LINE.captures(line).and_then(|c| {
                let key = normalize_key(c.get(1)?.as_str());
                let keys = key_group(&key)?;
                Some((keys, c.get(2).map(|v| v.as_str().trim().to_string())))
            });
            match heading {
                Some((keys, value)) => {
                    flush(current, &mut body, &mut decision);
                    current = Some(keys);
                    if let Some(value) = value.filter(|v| !v.is_empty()) {
                        body.push(value);
                    }
                }
                None => {
                    let line = line.trim();
                    if current.is_some() && !line.is_empty() {
                        body.push(line.to_string());
                    }
                }
            }
        }
        flush(current, &mut body, &mut decision);

        decision.is_meaningful().then_some(decision)
    }

    /// Match the winner against branch ids and labels.
    ///
    /// Tries an exact (case-insensitive) id or label, then a 1-based branch
    /// number, then the first id mentioned anywhere in the winner text.
    pub fn resolve_winner<'a>(&self, branches: &'a [(String, String)]) -> Option<&'a str> {
        let winner = self.winner.as_deref()?.trim();
        let lower = winner.to_lowercase();
        if let Some((id, _)) = branches
            .iter()
            .find(|(id, label)| id.to_lowercase() == lower || label.to_lowercase() == lower)
        {
            return Some(id);
        }
        if let Ok(n) = lower.trim_start_matches('#').parse::<usize>() {
            if let Some((id, _)) = n.checked_sub(1).and_then(|i| branches.get(i)) {
                return Some(id);
            }
        }
        let tokens: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
            .filter(|t| !t.is_empty())
            .collect();
        branches
            .iter()
            .find(|(id, _)| tokens.contains(&id.to_lowercase().as_str()))
            .map(|(id, _)| id.as_str())
    }
}

fn object(s: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(s.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace([' ', '-'], "_")
}

fn key_group(key: &str) -> Option<&'static [&'static str]> {
    [WINNER_KEYS, REASON_KEYS, DIFF_KEYS, RISK_KEYS, FOLLOWUP_KEYS]
        .into_iter()
        .find(|group| group.contains(&key))
}

fn scalar(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => return None,
        other => other.to_string(),
    };
    (!s.is_empty()).then_some(s)
}

fn list(v: &Value) -> Vec<String> {
    match v {
        Value::Array(items) => items.iter().filter_map(scalar).collect(),
        other => scalar(other).into_iter().collect(),
    }
}

fn assign(d: &mut JudgeDecision, keys: &[&str], body: Vec<String>) {
    let joined = body.join(" ").trim().to_string();
    let items: Vec<String> = body
        .iter()
        .map(|l| l.trim_start_matches(['-', '*', ' ']).trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    if keys == WINNER_KEYS {
        d.winner = (!joined.is_empty()).then_some(joined);
    } else if keys == REASON_KEYS {
        d.reason = (!joined.is_empty()).then_some(joined);
    } else if keys == RISK_KEYS {
        d.risk = (!joined.is_empty()).then_some(joined);
    } else if keys == DIFF_KEYS {
        d.diffs = items;
    } else {
        d.followups = items;
    }
}
