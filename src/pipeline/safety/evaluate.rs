use std::cmp::Reverse;
use std::collections::HashMap;

use super::rules::RuleSet;
use crate::models::*;

/// Rule id of flags raised from the report's own reference range when no
/// threshold rule fired.
pub const REFERENCE_RANGE_RULE: &str = "reference_range";

fn reference_range_flag(finding: &Finding) -> RiskFlag {
    RiskFlag {
        finding_id: finding.id,
        metric: finding.metric_key(),
        rule_id: REFERENCE_RANGE_RULE.to_string(),
        severity: Severity::Informational,
        message: format!(
            "{} {} is outside the report reference range {}",
            finding.display_name(),
            finding.value,
            finding.reference_range.as_deref().unwrap_or("")
        ),
        condition: None,
    }
}

impl RuleSet {
    /// Pre-generation check of every finding against the threshold rules.
    ///
    /// Pure and deterministic: flags come out in finding order, then by
    /// severity (highest first), then by rule id, whatever the rule order.
    pub fn evaluate(&self, findings: &[Finding]) -> Vec<RiskFlag> {
        let mut flags = Vec::new();

        for finding in findings {
            let Some(values) = finding.measured_values() else {
                tracing::debug!(metric = %finding.metric_key(), "Non-numeric finding, no rule check");
                continue;
            };

            let key = finding.metric_key();
            let mut fired = false;
            for rule in self.rules_for(&key) {
                match rule.crossing(&values) {
                    Ok(Some(crossing)) => {
                        fired = true;
                        flags.push(RiskFlag {
                            finding_id: finding.id,
                            metric: key.clone(),
                            rule_id: rule.id.clone(),
                            severity: rule.severity,
                            message: rule.render_message(finding, crossing),
                            condition: rule.condition.clone(),
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(metric = %key, error = %e, "Rule evaluation failed, rule skipped");
                    }
                }
            }

            if !fired && finding.is_out_of_reference() == Some(true) {
                flags.push(reference_range_flag(finding));
            }
        }

        let position: HashMap<_, _> = findings.iter().enumerate().map(|(i, f)| (f.id, i)).collect();
        flags.sort_by(|a, b| {
            let pa = position.get(&a.finding_id);
            let pb = position.get(&b.finding_id);
            pa.cmp(&pb)
                .then_with(|| Reverse(a.severity).cmp(&Reverse(b.severity)))
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        flags.dedup_by(|a, b| a.finding_id == b.finding_id && a.rule_id == b.rule_id);

        tracing::debug!(findings = findings.len(), flags = flags.len(), "Pre-generation rule check");
        flags
    }
}
