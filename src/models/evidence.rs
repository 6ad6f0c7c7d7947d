use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::EvidenceOrigin;

/// One ranked piece of evidence. Scores are only comparable within the
/// request that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub origin: EvidenceOrigin,
    pub content: String,
    /// Weighted score after merging both paths.
    pub score: f64,
    /// `knowledge:<source>#<chunk id>` or `profile:<timestamp>#<metric>`.
    pub provenance_id: String,
    /// Reference-range deviation of the finding this item answers; tie-breaker.
    pub deviation: f64,
    /// Recording time for profile items; tie-breaker, newer first.
    pub recorded_at: Option<DateTime<Utc>>,
    /// Metric keys this item relates to.
    pub metrics: Vec<String>,
}
