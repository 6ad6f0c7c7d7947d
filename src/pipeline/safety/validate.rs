//! Post-generation validation of the model's draft against the findings,
//! the pre-generation flags and the rule set.

use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use super::rules::RuleSet;
use crate::models::*;

/// Appended by the guard whenever any flag is critical.
pub const CONSULT_NOTICE: &str = "Important: at least one finding reached a critical threshold. Please consult a physician promptly to review these results.";

static NORMAL_CLAIM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:normal|healthy|within\s+(?:the\s+)?(?:normal\s+|reference\s+|healthy\s+)?range|nothing\s+to\s+worry\s+about|no\s+cause\s+for\s+concern)\b|正常|健康|范围内").unwrap()
});

static NEGATED_CLAIM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:not|never|no\s+longer|isn't|aren't|wasn't|weren't)\s+(?:\w+\s+){0,2}?(?:normal|healthy|within)\b|不正常|不健康|不在.*范围内").unwrap()
});

static GLOBAL_CLAIM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:all|every|everything|overall|results)\b|所有|全部|一切|各项").unwrap()
});

static QUOTED_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:(?:is|was|of|at|reads|reading|measured|came\s+in|level|value|:|=|为|是)\s*){0,3}(-?\d+(?:\.\d+)?(?:\s*/\s*-?\d+(?:\.\d+)?)*)").unwrap()
});

/// Phrases placing a value outside a normal range. Removed before looking
/// for normal claims, so "above normal" is not read as "normal".
static OUT_OF_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:above|below|higher\s+than|lower\s+than|outside(?:\s+of)?|beyond|out\s+of|exceed\w*)\s+(?:(?:the|a|your)\s+)?(?:normal|healthy|reference)\b|(?:高于|低于|超出|超过|偏离)(?:正常|健康|参考)|正常(?:范围|值)?(?:以外|之外)").unwrap()
});

/// Wording that presents a quoted number as a cut-off rather than a reading.
static THRESHOLD_CONTEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:threshold|cut-?off|limit|target|reference|range|above|below|over|under|exceed\w*|or\s+(?:more|higher|above|less|lower|below)|indicates?|defined)\b|[<>≥≤]|阈值|以上|以下|超过|参考").unwrap()
});

static PAST_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:was|were|previously|last|earlier|before|ago|prior)\b|上次|之前|去年|以前").unwrap()
});

/// An avoidance verb governing whatever follows within a few words.
static GOVERNED_BY_AVOIDANCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\b(?:avoid|avoiding|limit|limiting|reduce|reducing|stop|stopping|quit|cut\s+(?:down|back)\s+on|refrain\s+from|no\s+more)|避免|不要|禁止|减少|限制|忌|戒)\W*(?:\w+\W*){0,3}$").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContradictionKind {
    /// A flagged or out-of-range finding described as normal.
    NormalClaim,
    /// A value quoted differently from the finding.
    Misquote,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contradiction {
    pub sentence: String,
    /// `None` for blanket claims about all results.
    pub finding_id: Option<Uuid>,
    pub kind: ContradictionKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StripReason {
    Contradiction,
    DangerousAdvice,
    UnanchoredContraindication,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrippedSentence {
    pub sentence: String,
    pub reason: StripReason,
}

/// Result of validating one draft. `text` is the draft with every offending
/// sentence removed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub text: String,
    pub validation_failed: bool,
    pub contradictions: Vec<Contradiction>,
    /// Warning flags raised by contraindicated recommendations.
    pub added_flags: Vec<RiskFlag>,
    pub stripped: Vec<StrippedSentence>,
}

impl ValidationReport {
    pub fn has_contradictions(&self) -> bool {
        !self.contradictions.is_empty()
    }

    /// One line per contradiction, fed back to the model on regeneration.
    pub fn correction_summary(&self) -> String {
        self.contradictions
            .iter()
            .map(|c| format!("- \"{}\" ({})", c.sentence, c.detail))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Split text into sentences, keeping each sentence's original slice so the
/// kept ones can be concatenated back verbatim. A `.` only ends a sentence
/// when followed by whitespace or the end of text, so decimals survive.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let ends = match c {
            '!' | '?' | '。' | '！' | '？' | '\n' => true,
            '.' => chars.peek().map_or(true, |(_, next)| next.is_whitespace()),
            _ => false,
        };
        if ends {
            let end = i + c.len_utf8();
            sentences.push(&text[start..end]);
            start = end;
        }
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

/// End offsets of `needle` in `text` where it is not glued to ASCII
/// letters or digits (`alt` does not match inside `salt`).
fn bounded_matches<'a>(text: &'a str, needle: &'a str) -> impl Iterator<Item = usize> + 'a {
    text.match_indices(needle).filter_map(move |(start, m)| {
        let end = start + m.len();
        let glued_before = text[..start].chars().next_back().is_some_and(|c| c.is_ascii_alphanumeric());
        let glued_after = text[end..].chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
        (!glued_before && !glued_after).then_some(end)
    })
}

fn values_match(quoted: &[f64], actual: &[f64]) -> bool {
    quoted.len() == actual.len() && quoted.iter().zip(actual).all(|(q, a)| (q - a).abs() < 1e-6)
}

struct FindingView<'a> {
    finding: &'a Finding,
    names: Vec<String>,
    abnormal: bool,
    /// Rule thresholds and reference bounds a sentence may cite.
    thresholds: Vec<Vec<f64>>,
    /// Readings of the same metric from earlier snapshots.
    history_values: Vec<Vec<f64>>,
}

impl FindingView<'_> {
    /// Byte offsets just past each mention of the finding in `lowered`.
    fn mention_ends(&self, lowered: &str) -> Vec<usize> {
        self.names
            .iter()
            .flat_map(|name| bounded_matches(lowered, name))
            .collect()
    }

    /// A differing quote is legitimate when the sentence frames it as a
    /// cut-off or as a past reading that actually exists.
    fn explains_quote(&self, quoted: &[f64], lowered: &str) -> bool {
        let cites_threshold = THRESHOLD_CONTEXT.is_match(lowered)
            && self.thresholds.iter().any(|t| values_match(quoted, t));
        cites_threshold
            || (PAST_MARKER.is_match(lowered)
                && self.history_values.iter().any(|h| values_match(quoted, h)))
    }
}

impl RuleSet {
    /// Check a generated draft sentence by sentence.
    ///
    /// `conditions` are the user's known condition tags (from the profile and
    /// the current flags) used for contraindication checks.
    pub fn validate(
        &self,
        draft: &str,
        findings: &[Finding],
        flags: &[RiskFlag],
        conditions: &BTreeSet<String>,
    ) -> ValidationReport {
        self.validate_with_history(draft, findings, flags, conditions, &[])
    }

    /// Like [`RuleSet::validate`], also accepting values quoted from the
    /// user's earlier snapshots.
    pub fn validate_with_history(
        &self,
        draft: &str,
        findings: &[Finding],
        flags: &[RiskFlag],
        conditions: &BTreeSet<String>,
        history: &[ProfileSnapshot],
    ) -> ValidationReport {
        let flagged: HashSet<Uuid> = flags.iter().map(|f| f.finding_id).collect();
        let views: Vec<FindingView> = findings
            .iter()
            .map(|finding| FindingView {
                finding,
                names: self.names_for(finding),
                abnormal: flagged.contains(&finding.id) || finding.is_out_of_reference() == Some(true),
                thresholds: self.threshold_values(finding),
                history_values: self.history_values(finding, history),
            })
            .collect();

        let mut kept = String::with_capacity(draft.len());
        let mut contradictions = Vec::new();
        let mut added_flags: Vec<RiskFlag> = Vec::new();
        let mut stripped = Vec::new();

        for raw in split_sentences(draft) {
            let sentence = raw.trim();
            if sentence.is_empty() {
                kept.push_str(raw);
                continue;
            }
            let lowered = sentence.to_lowercase();

            if self.dangerous_patterns().iter().any(|p| p.is_match(sentence)) {
                tracing::warn!("Dangerous recommendation stripped from analysis");
                stripped.push(StrippedSentence {
                    sentence: sentence.to_string(),
                    reason: StripReason::DangerousAdvice,
                });
                continue;
            }

            let found = self.sentence_contradictions(sentence, &lowered, &views);
            if !found.is_empty() {
                stripped.push(StrippedSentence {
                    sentence: sentence.to_string(),
                    reason: StripReason::Contradiction,
                });
                contradictions.extend(found);
                continue;
            }

            match self.contraindication_flags(&lowered, &views, flags, conditions) {
                Some(new_flags) => {
                    for flag in new_flags {
                        let exists = added_flags
                            .iter()
                            .any(|f| f.finding_id == flag.finding_id && f.rule_id == flag.rule_id);
                        if !exists {
                            added_flags.push(flag);
                        }
                    }
                }
                None => {
                    stripped.push(StrippedSentence {
                        sentence: sentence.to_string(),
                        reason: StripReason::UnanchoredContraindication,
                    });
                    continue;
                }
            }

            kept.push_str(raw);
        }

        let validation_failed = !contradictions.is_empty() || !stripped.is_empty();
        if validation_failed {
            tracing::warn!(
                contradictions = contradictions.len(),
                stripped = stripped.len(),
                "Generated analysis failed validation"
            );
        }

        ValidationReport {
            text: kept.trim().to_string(),
            validation_failed,
            contradictions,
            added_flags,
            stripped,
        }
    }

    fn threshold_values(&self, finding: &Finding) -> Vec<Vec<f64>> {
        let mut values: Vec<Vec<f64>> = self
            .rules_for(&finding.metric_key())
            .iter()
            .flat_map(|rule| [rule.low.clone(), rule.high.clone()])
            .flatten()
            .collect();
        if let Some(range) = finding.parsed_reference() {
            let bounds = range.bounds();
            values.extend(bounds.iter().map(|b| vec![*b]));
            values.push(bounds);
        }
        values
    }

    fn history_values(&self, finding: &Finding, history: &[ProfileSnapshot]) -> Vec<Vec<f64>> {
        let canonical = self.canonical_metric(&finding.metric_key());
        history
            .iter()
            .flat_map(|snapshot| &snapshot.findings)
            .filter(|past| self.canonical_metric(&past.metric_key()) == canonical)
            .filter_map(Finding::measured_values)
            .collect()
    }

    fn sentence_contradictions(
        &self,
        sentence: &str,
        lowered: &str,
        views: &[FindingView],
    ) -> Vec<Contradiction> {
        let mut found = Vec::new();
        let claim_text = OUT_OF_RANGE.replace_all(lowered, " ");
        let normal_claim = NORMAL_CLAIM.is_match(&claim_text) && !NEGATED_CLAIM.is_match(lowered);
        let mut mentioned_any = false;

        for view in views {
            let ends = view.mention_ends(lowered);
            if ends.is_empty() {
                continue;
            }
            mentioned_any = true;

            if normal_claim && view.abnormal {
                found.push(Contradiction {
                    sentence: sentence.to_string(),
                    finding_id: Some(view.finding.id),
                    kind: ContradictionKind::NormalClaim,
                    detail: format!("{} is flagged but described as normal", view.finding.display_name()),
                });
            }

            let Some(actual) = view.finding.measured_values() else {
                continue;
            };
            for end in ends {
                let Some(caps) = QUOTED_VALUE.captures(&lowered[end..]) else {
                    continue;
                };
                let Some(quoted) = caps.get(1).and_then(|m| parse_measured(m.as_str())) else {
                    continue;
                };
                if !values_match(&quoted, &actual) && !view.explains_quote(&quoted, lowered) {
                    found.push(Contradiction {
                        sentence: sentence.to_string(),
                        finding_id: Some(view.finding.id),
                        kind: ContradictionKind::Misquote,
                        detail: format!(
                            "{} quoted as {} but measured {}",
                            view.finding.display_name(),
                            caps[1].trim(),
                            view.finding.value
                        ),
                    });
                    break;
                }
            }
        }

        if normal_claim && !mentioned_any && GLOBAL_CLAIM.is_match(lowered) && views.iter().any(|v| v.abnormal) {
            found.push(Contradiction {
                sentence: sentence.to_string(),
                finding_id: None,
                kind: ContradictionKind::NormalClaim,
                detail: "results described as normal while findings are flagged".into(),
            });
        }
        found
    }

    /// `Some(flags)` to keep the sentence (possibly annotated), `None` when it
    /// recommends a contraindicated term no current finding can anchor.
    fn contraindication_flags(
        &self,
        lowered: &str,
        views: &[FindingView],
        flags: &[RiskFlag],
        conditions: &BTreeSet<String>,
    ) -> Option<Vec<RiskFlag>> {
        let mut raised = Vec::new();
        for condition in conditions {
            // Only a mention that no avoidance verb governs counts as advice.
            let Some(term) = self.contraindicated_terms(condition).iter().find(|term| {
                bounded_matches(lowered, term)
                    .any(|end| !GOVERNED_BY_AVOIDANCE.is_match(&lowered[..end - term.len()]))
            }) else {
                continue;
            };

            let anchor = flags
                .iter()
                .find(|f| f.condition.as_deref() == Some(condition.as_str()))
                .map(|f| f.finding_id)
                .or_else(|| {
                    views
                        .iter()
                        .find(|v| {
                            self.conditions_for(&v.finding.metric_key())
                                .contains(&condition.as_str())
                        })
                        .map(|v| v.finding.id)
                });
            let anchored = anchor.and_then(|id| views.iter().find(|v| v.finding.id == id));

            match anchored {
                Some(view) => raised.push(RiskFlag {
                    finding_id: view.finding.id,
                    metric: view.finding.metric_key(),
                    rule_id: format!("contraindication_{condition}"),
                    severity: Severity::Warning,
                    message: format!(
                        "Analysis mentions {term}, which is contraindicated with {}",
                        condition.replace('_', " ")
                    ),
                    condition: Some(condition.clone()),
                }),
                None => {
                    tracing::warn!(condition = %condition, "Contraindicated suggestion has no finding to anchor it");
                    return None;
                }
            }
        }
        Some(raised)
    }
}

/// Append the consult notice when any flag is critical. The notice is added
/// after validation, so nothing the model writes can remove it.
pub fn append_consult_notice(text: &str, flags: &[RiskFlag]) -> String {
    let critical = flags.iter().any(|f| f.severity == Severity::Critical);
    if !critical || text.trim_end().ends_with(CONSULT_NOTICE) {
        return text.to_string();
    }
    if text.trim().is_empty() {
        return CONSULT_NOTICE.to_string();
    }
    format!("{}\n\n{CONSULT_NOTICE}", text.trim_end())
}
