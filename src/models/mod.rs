pub mod enums;
pub mod evidence;
pub mod finding;
pub mod knowledge;
pub mod profile;
pub mod risk;

pub use enums::*;
pub use evidence::EvidenceItem;
pub use finding::{
    metric_key, parse_measured, parse_threshold, Bound, Finding, FindingParseError, Interval,
    ReferenceRange, SourceSpan,
};
pub use knowledge::{KnowledgeChunk, KnowledgeHit};
pub use profile::{DerivedRiskTags, ProfileRecord, ProfileSnapshot};
pub use risk::{RiskAssessment, RiskFlag};
