use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::GuardError;
use crate::models::*;
use crate::pipeline::rag::LlmGenerate;

/// Rule id of flags raised by the secondary reviewer.
pub const SECONDARY_REVIEW_RULE: &str = "secondary_review";

/// Optional review stage run after deterministic validation. It can only add
/// informational flags; the guard discards anything else it returns.
#[async_trait]
pub trait SecondaryValidator: Send + Sync {
    async fn review(
        &self,
        findings: &[Finding],
        flags: &[RiskFlag],
        analysis: &str,
    ) -> Result<Vec<RiskFlag>, GuardError>;
}

const REVIEW_SYSTEM_PROMPT: &str = "You are a medical data validation assistant. You review checkup findings for values that deserve attention but were not flagged. Reply with JSON only.";

#[derive(Deserialize)]
struct ReviewReply {
    #[serde(default)]
    suspicious: Vec<SuspiciousMetric>,
}

#[derive(Deserialize)]
struct SuspiciousMetric {
    metric: String,
    #[serde(default)]
    reason: String,
}

fn build_review_prompt(findings: &[Finding], flags: &[RiskFlag], analysis: &str) -> String {
    let mut prompt = String::from("<FINDINGS>\n");
    for finding in findings {
        prompt.push_str(&format!("- {}\n", finding.description()));
    }
    prompt.push_str("</FINDINGS>\n\n<FLAGGED>\n");
    for flag in flags {
        prompt.push_str(&format!("- {} ({})\n", flag.metric, flag.rule_id));
    }
    prompt.push_str("</FLAGGED>\n\n<ANALYSIS>\n");
    prompt.push_str(analysis);
    prompt.push_str("\n</ANALYSIS>\n\n");
    prompt.push_str(
        "List findings that look clinically suspicious but are not flagged.\n\
         Return: {\"suspicious\": [{\"metric\": \"<metric name>\", \"reason\": \"<short reason>\"}]}",
    );
    prompt
}

/// Extract the outermost JSON object from a model reply that may wrap it in
/// prose or code fences.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Secondary reviewer backed by the generative model.
pub struct LlmSecondaryValidator {
    llm: Arc<dyn LlmGenerate>,
}

impl LlmSecondaryValidator {
    pub fn new(llm: Arc<dyn LlmGenerate>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl SecondaryValidator for LlmSecondaryValidator {
    async fn review(
        &self,
        findings: &[Finding],
        flags: &[RiskFlag],
        analysis: &str,
    ) -> Result<Vec<RiskFlag>, GuardError> {
        let prompt = build_review_prompt(findings, flags, analysis);
        let reply = self.llm.generate(REVIEW_SYSTEM_PROMPT, &prompt).await?;

        let json = extract_json_object(&reply)
            .ok_or_else(|| GuardError::SecondaryReply("no JSON object in reply".into()))?;
        let parsed: ReviewReply =
            serde_json::from_str(json).map_err(|e| GuardError::SecondaryReply(e.to_string()))?;

        let mut added = Vec::new();
        for item in parsed.suspicious {
            let key = metric_key(&item.metric);
            let Some(finding) = findings.iter().find(|f| f.metric_key() == key) else {
                tracing::debug!(metric = %key, "Secondary review named an unknown metric, ignored");
                continue;
            };
            if added.iter().any(|f: &RiskFlag| f.finding_id == finding.id) {
                continue;
            }
            let reason = item.reason.trim();
            added.push(RiskFlag {
                finding_id: finding.id,
                metric: key,
                rule_id: SECONDARY_REVIEW_RULE.to_string(),
                severity: Severity::Informational,
                message: if reason.is_empty() {
                    format!("{} marked for review", finding.display_name())
                } else {
                    format!("{} marked for review: {reason}", finding.display_name())
                },
                condition: None,
            });
        }
        Ok(added)
    }
}
