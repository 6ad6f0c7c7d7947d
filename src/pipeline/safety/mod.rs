pub mod rules;
pub mod evaluate;
pub mod validate;
pub mod registry;
pub mod secondary;

pub use evaluate::REFERENCE_RANGE_RULE;
pub use registry::{RuleRegistry, RuleWatcher};
pub use rules::{Crossing, RuleError, RuleSet, ThresholdRule};
pub use secondary::{LlmSecondaryValidator, SecondaryValidator, SECONDARY_REVIEW_RULE};
pub use validate::{
    append_consult_notice, split_sentences, Contradiction, ContradictionKind, StripReason,
    StrippedSentence, ValidationReport, CONSULT_NOTICE,
};

use std::sync::Arc;

use thiserror::Error;

use crate::models::*;
use crate::pipeline::rag::GenerationError;

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Rule error: {0}")]
    Rules(#[from] RuleError),

    #[error("Secondary validator generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("Secondary validator reply unusable: {0}")]
    SecondaryReply(String),
}

/// The deterministic safety gate: active rules plus the optional secondary
/// review stage.
pub struct RiskGuard {
    registry: Arc<RuleRegistry>,
    secondary: Option<Arc<dyn SecondaryValidator>>,
}

impl RiskGuard {
    pub fn new(registry: Arc<RuleRegistry>) -> Self {
        Self {
            registry,
            secondary: None,
        }
    }

    pub fn with_secondary_validator(mut self, validator: Arc<dyn SecondaryValidator>) -> Self {
        self.secondary = Some(validator);
        self
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    /// Snapshot of the active rules, held for one request.
    pub fn rules(&self) -> Arc<RuleSet> {
        self.registry.snapshot()
    }

    /// Run the secondary stage if configured. Only new informational flags on
    /// findings of this request are accepted; failures add nothing.
    pub async fn secondary_review(
        &self,
        findings: &[Finding],
        flags: &[RiskFlag],
        analysis: &str,
    ) -> Vec<RiskFlag> {
        let Some(validator) = &self.secondary else {
            return Vec::new();
        };
        match validator.review(findings, flags, analysis).await {
            Ok(candidates) => {
                let accepted: Vec<RiskFlag> = candidates
                    .into_iter()
                    .filter(|c| c.severity == Severity::Informational)
                    .filter(|c| findings.iter().any(|f| f.id == c.finding_id))
                    .filter(|c| {
                        !flags
                            .iter()
                            .any(|f| f.finding_id == c.finding_id && f.rule_id == c.rule_id)
                    })
                    .collect();
                tracing::debug!(added = accepted.len(), "Secondary review complete");
                accepted
            }
            Err(e) => {
                tracing::warn!(error = %e, "Secondary review failed, no flags added");
                Vec::new()
            }
        }
    }
}

/// Request-level risk roll-up.
pub fn assess(flags: &[RiskFlag]) -> RiskAssessment {
    RiskAssessment::from_flags(flags)
}
