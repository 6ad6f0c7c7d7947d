use crate::models::*;

use super::context::AssembledContext;

pub const ANALYSIS_SYSTEM_PROMPT: &str = r#"You are a checkup report analysis assistant. You explain a person's checkup findings in plain language. You are NOT a doctor.

RULES:
1. Ground every statement in the findings, the risk flags and the context sections provided.
2. Never describe a flagged finding as normal, healthy or within range.
3. Quote measured values exactly as they appear in the findings.
4. Never tell the person to stop treatment, skip seeing a doctor or ignore symptoms.
5. Cite context with its bracketed tag, e.g. [knowledge:guide.md#...] or [profile:...].
6. When history shows a trend, mention it.

OUTPUT:
1. Abnormal findings and what they may indicate.
2. Overall health risk.
3. Concrete follow-up suggestions."#;

fn format_finding(finding: &Finding) -> String {
    let mut line = format!("- {}: {}", finding.display_name(), finding.value);
    if let Some(unit) = &finding.unit {
        line.push(' ');
        line.push_str(unit);
    }
    if let Some(range) = &finding.reference_range {
        line.push_str(&format!(" (reference {range})"));
    }
    line
}

fn format_profile_summary(tags: &DerivedRiskTags) -> Option<String> {
    if tags.total_snapshots == 0 {
        return None;
    }
    let mut lines = vec![format!("Previous reports: {}", tags.total_snapshots)];
    if let Some(highest) = tags.highest_recent {
        lines.push(format!("Highest recent severity: {highest}"));
    }
    if !tags.conditions.is_empty() {
        let conditions: Vec<&str> = tags.conditions.iter().map(String::as_str).collect();
        lines.push(format!("Known conditions: {}", conditions.join(", ")));
    }
    for (metric, trend) in &tags.trends {
        lines.push(format!("Trend {}: {trend}", metric.replace('_', " ")));
    }
    Some(lines.join("\n"))
}

/// Build the full prompt for report analysis. `correction` carries the
/// guard's objections when regenerating after a contradiction.
pub fn build_analysis_prompt(
    findings: &[Finding],
    flags: &[RiskFlag],
    context: &AssembledContext,
    profile_tags: Option<&DerivedRiskTags>,
    correction: Option<&str>,
) -> String {
    let mut prompt = String::new();

    prompt.push_str("<FINDINGS>\n");
    for finding in findings {
        prompt.push_str(&format_finding(finding));
        prompt.push('\n');
    }
    prompt.push_str("</FINDINGS>\n\n");

    if !flags.is_empty() {
        prompt.push_str("<RISK_FLAGS>\n");
        for flag in flags {
            prompt.push_str(&format!("- [{}] {}: {}\n", flag.severity, flag.rule_id, flag.message));
        }
        prompt.push_str("</RISK_FLAGS>\n\n");
    }

    if let Some(summary) = profile_tags.and_then(format_profile_summary) {
        prompt.push_str("<PROFILE_SUMMARY>\n");
        prompt.push_str(&summary);
        prompt.push_str("\n</PROFILE_SUMMARY>\n\n");
    }

    if !context.text.is_empty() {
        prompt.push_str(&context.text);
        prompt.push_str("\n\n");
    }

    if let Some(correction) = correction {
        prompt.push_str("<CORRECTION>\nYour previous answer contradicted the findings:\n");
        prompt.push_str(correction);
        prompt.push_str("\nDo not repeat these statements.\n</CORRECTION>\n\n");
    }

    prompt.push_str("Analyze the findings above. Respond based ONLY on the sections above.");
    prompt
}

/// Deterministic analysis used when the generative model is unavailable.
pub fn fallback_analysis(findings: &[Finding], flags: &[RiskFlag]) -> String {
    if flags.is_empty() {
        return format!(
            "{} findings were reviewed. No values outside the configured thresholds were detected.",
            findings.len()
        );
    }
    let mut text = String::from("The following findings need attention:");
    for flag in flags {
        text.push_str(&format!("\n- {} ({}): {}", flag.metric.replace('_', " "), flag.severity, flag.message));
    }
    text
}
