use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{OverallRisk, Severity};

/// A deterministic risk signal tied to one finding of the current request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFlag {
    pub finding_id: Uuid,
    pub metric: String,
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    /// Condition tag the rule indicates (`hypertension`), if any.
    pub condition: Option<String>,
}

/// Request-level roll-up of the flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub overall: OverallRisk,
    /// Critical flags, in flag order.
    pub urgent: Vec<RiskFlag>,
    pub critical_count: usize,
    pub warning_count: usize,
    pub informational_count: usize,
}

impl RiskAssessment {
    /// Any critical flag makes the report high risk, any warning medium.
    pub fn from_flags(flags: &[RiskFlag]) -> Self {
        let count = |s: Severity| flags.iter().filter(|f| f.severity == s).count();
        let critical_count = count(Severity::Critical);
        let warning_count = count(Severity::Warning);

        let overall = if critical_count > 0 {
            OverallRisk::High
        } else if warning_count > 0 {
            OverallRisk::Medium
        } else {
            OverallRisk::Low
        };

        Self {
            overall,
            urgent: flags
                .iter()
                .filter(|f| f.severity == Severity::Critical)
                .cloned()
                .collect(),
            critical_count,
            warning_count,
            informational_count: count(Severity::Informational),
        }
    }
}
