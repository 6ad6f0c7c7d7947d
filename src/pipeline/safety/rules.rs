//! Rule set data: per-metric threshold rules, metric aliases,
//! contraindications and dangerous-advice patterns, loaded from JSON.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::models::*;

const BUILTIN_RULES: &str = include_str!("../../../resources/rules/default_rules.json");

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Cannot read rule file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Rule file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Rule {rule_id}: {reason}")]
    Malformed { rule_id: String, reason: String },

    #[error("Rule {rule_id}: threshold has {expected} components, value has {actual}")]
    ComponentMismatch {
        rule_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// A threshold written as a number (`40`) or a string (`"140/90"`).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawThreshold {
    Number(f64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawRule {
    id: String,
    low: Option<RawThreshold>,
    high: Option<RawThreshold>,
    #[serde(default = "default_inclusive")]
    inclusive: bool,
    severity: Option<String>,
    message: Option<String>,
    condition: Option<String>,
}

fn default_inclusive() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawRuleFile {
    version: String,
    #[serde(default)]
    rules: BTreeMap<String, Vec<serde_json::Value>>,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
    #[serde(default)]
    contraindications: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    dangerous_patterns: Vec<String>,
}

fn parse_raw_threshold(rule_id: &str, raw: &RawThreshold) -> Result<Vec<f64>, RuleError> {
    let malformed = |reason: String| RuleError::Malformed {
        rule_id: rule_id.to_string(),
        reason,
    };
    match raw {
        RawThreshold::Number(n) if n.is_finite() => Ok(vec![*n]),
        RawThreshold::Number(n) => Err(malformed(format!("non-finite threshold {n}"))),
        RawThreshold::Text(s) => parse_threshold(s).map_err(|e| malformed(e.to_string())),
    }
}

fn format_threshold(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Which side of a rule a value crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossing {
    Above,
    Below,
}

/// A compiled threshold rule for one metric.
///
/// Fires when any component of the value reaches `high` or drops to `low`
/// (strictly when `inclusive` is false).
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRule {
    pub id: String,
    pub metric: String,
    pub low: Option<Vec<f64>>,
    pub high: Option<Vec<f64>>,
    pub inclusive: bool,
    pub severity: Severity,
    pub message: String,
    pub condition: Option<String>,
}

impl ThresholdRule {
    fn compile(metric: &str, raw: RawRule) -> Result<Self, RuleError> {
        let malformed = |reason: &str| RuleError::Malformed {
            rule_id: raw.id.clone(),
            reason: reason.to_string(),
        };

        let message = raw
            .message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| malformed("missing message template"))?
            .to_string();
        let severity_raw = raw
            .severity
            .as_deref()
            .ok_or_else(|| malformed("missing severity"))?;
        let severity = Severity::from_str(severity_raw)
            .map_err(|_| malformed(&format!("unknown severity '{severity_raw}'")))?;

        let low = raw
            .low
            .as_ref()
            .map(|t| parse_raw_threshold(&raw.id, t))
            .transpose()?;
        let high = raw
            .high
            .as_ref()
            .map(|t| parse_raw_threshold(&raw.id, t))
            .transpose()?;
        if low.is_none() && high.is_none() {
            return Err(malformed("neither low nor high threshold"));
        }

        Ok(Self {
            id: raw.id,
            metric: metric.to_string(),
            low,
            high,
            inclusive: raw.inclusive,
            severity,
            message,
            condition: raw.condition.map(|c| metric_key(&c)),
        })
    }

    fn check_side(&self, threshold: &[f64], values: &[f64], above: bool) -> Result<bool, RuleError> {
        if threshold.len() != values.len() {
            return Err(RuleError::ComponentMismatch {
                rule_id: self.id.clone(),
                expected: threshold.len(),
                actual: values.len(),
            });
        }
        Ok(values.iter().zip(threshold).any(|(v, t)| match (above, self.inclusive) {
            (true, true) => v >= t,
            (true, false) => v > t,
            (false, true) => v <= t,
            (false, false) => v < t,
        }))
    }

    /// Whether `values` cross this rule, and on which side.
    pub fn crossing(&self, values: &[f64]) -> Result<Option<Crossing>, RuleError> {
        if let Some(high) = &self.high {
            if self.check_side(high, values, true)? {
                return Ok(Some(Crossing::Above));
            }
        }
        if let Some(low) = &self.low {
            if self.check_side(low, values, false)? {
                return Ok(Some(Crossing::Below));
            }
        }
        Ok(None)
    }

    /// Fill the message template for a crossing finding.
    pub fn render_message(&self, finding: &Finding, crossing: Crossing) -> String {
        let threshold = match crossing {
            Crossing::Above => self.high.as_deref(),
            Crossing::Below => self.low.as_deref(),
        }
        .map(format_threshold)
        .unwrap_or_default();
        let rendered = self
            .message
            .replace("{metric}", &finding.display_name())
            .replace("{value}", &finding.value)
            .replace("{unit}", finding.unit.as_deref().unwrap_or(""))
            .replace("{threshold}", &threshold)
            .replace("{range}", finding.reference_range.as_deref().unwrap_or("n/a"));
        rendered.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// An immutable, fully validated rule set. Readers hold it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub version: String,
    rules: BTreeMap<String, Vec<ThresholdRule>>,
    aliases: BTreeMap<String, String>,
    contraindications: BTreeMap<String, Vec<String>>,
    dangerous_patterns: Vec<Regex>,
    /// Rules and patterns dropped while loading.
    pub skipped: usize,
}

impl RuleSet {
    /// Parse a rule file. Malformed rules and patterns are logged and skipped;
    /// only a file that is not valid JSON fails.
    pub fn from_json(json: &str) -> Result<Self, RuleError> {
        let raw: RawRuleFile = serde_json::from_str(json)?;
        let mut skipped = 0;

        let mut rules: BTreeMap<String, Vec<ThresholdRule>> = BTreeMap::new();
        for (metric, entries) in raw.rules {
            let metric = metric_key(&metric);
            for entry in entries {
                let compiled = serde_json::from_value::<RawRule>(entry)
                    .map_err(|e| RuleError::Malformed {
                        rule_id: format!("{metric}[?]"),
                        reason: e.to_string(),
                    })
                    .and_then(|r| ThresholdRule::compile(&metric, r));
                match compiled {
                    Ok(rule) => rules.entry(metric.clone()).or_default().push(rule),
                    Err(e) => {
                        tracing::warn!(metric = %metric, error = %e, "Skipping malformed rule");
                        skipped += 1;
                    }
                }
            }
        }
        for list in rules.values_mut() {
            list.sort_by(|a, b| a.id.cmp(&b.id));
        }

        let aliases = raw
            .aliases
            .into_iter()
            .map(|(alias, target)| (metric_key(&alias), metric_key(&target)))
            .collect();

        let contraindications = raw
            .contraindications
            .into_iter()
            .map(|(condition, terms)| {
                let terms = terms
                    .into_iter()
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect();
                (metric_key(&condition), terms)
            })
            .collect();

        let mut dangerous_patterns = Vec::with_capacity(raw.dangerous_patterns.len());
        for pattern in raw.dangerous_patterns {
            match Regex::new(&pattern) {
                Ok(re) => dangerous_patterns.push(re),
                Err(e) => {
                    let err = RuleError::InvalidPattern {
                        pattern,
                        reason: e.to_string(),
                    };
                    tracing::warn!(error = %err, "Skipping malformed dangerous pattern");
                    skipped += 1;
                }
            }
        }

        let set = Self {
            version: raw.version,
            rules,
            aliases,
            contraindications,
            dangerous_patterns,
            skipped,
        };
        tracing::info!(
            version = %set.version,
            rules = set.rule_count(),
            skipped = set.skipped,
            "Rule set loaded"
        );
        Ok(set)
    }

    pub fn load(path: &Path) -> Result<Self, RuleError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// The rule set bundled with the crate.
    pub fn builtin() -> Result<Self, RuleError> {
        Self::from_json(BUILTIN_RULES)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    /// Resolve a metric key through the alias table.
    pub fn canonical_metric(&self, key: &str) -> String {
        self.aliases
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }

    pub fn rules_for(&self, key: &str) -> &[ThresholdRule] {
        self.rules
            .get(&self.canonical_metric(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Lowercased names a finding may go by in free text: its own metric,
    /// the canonical metric and every alias of it.
    pub fn names_for(&self, finding: &Finding) -> Vec<String> {
        let key = finding.metric_key();
        let canonical = self.canonical_metric(&key);
        let mut names = vec![
            finding.metric.to_lowercase(),
            finding.display_name(),
            canonical.replace('_', " "),
        ];
        names.extend(
            self.aliases
                .iter()
                .filter(|(_, target)| **target == canonical)
                .map(|(alias, _)| alias.replace('_', " ")),
        );
        names.retain(|n| !n.trim().is_empty());
        names.sort();
        names.dedup();
        names
    }

    pub fn contraindicated_terms(&self, condition: &str) -> &[String] {
        self.contraindications
            .get(condition)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn dangerous_patterns(&self) -> &[Regex] {
        &self.dangerous_patterns
    }

    /// Conditions any rule of this metric can indicate.
    pub fn conditions_for(&self, key: &str) -> Vec<&str> {
        self.rules_for(key)
            .iter()
            .filter_map(|r| r.condition.as_deref())
            .collect()
    }
}
