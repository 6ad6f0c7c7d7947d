use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{Severity, Trend};
use super::finding::Finding;
use super::risk::RiskFlag;

/// One immutable entry of a user's history: the findings and flags of a
/// single analyzed report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub id: Uuid,
    pub user_id: String,
    pub recorded_at: DateTime<Utc>,
    pub findings: Vec<Finding>,
    pub flags: Vec<RiskFlag>,
}

impl ProfileSnapshot {
    pub fn provenance_tag(&self, metric: &str) -> String {
        format!("profile:{}#{}", self.recorded_at.to_rfc3339(), metric)
    }

    /// Highest flag severity recorded in this snapshot.
    pub fn max_severity(&self) -> Option<Severity> {
        self.flags.iter().map(|f| f.severity).max()
    }
}

/// Rolling summary of recent history. Overwritten after each append and
/// always recomputable from the history alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedRiskTags {
    pub total_snapshots: usize,
    pub first_recorded: Option<DateTime<Utc>>,
    pub last_recorded: Option<DateTime<Utc>>,
    /// Number of snapshots the counts below cover.
    pub window: usize,
    pub severity_counts: BTreeMap<Severity, usize>,
    pub highest_recent: Option<Severity>,
    /// Per metric key, direction over the most recent values.
    pub trends: BTreeMap<String, Trend>,
    /// Conditions indicated by flags inside the window.
    pub conditions: BTreeSet<String>,
}

/// A user's longitudinal profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub user_id: String,
    /// Oldest first, non-decreasing `recorded_at`.
    pub history: Vec<ProfileSnapshot>,
    pub derived_tags: DerivedRiskTags,
}

impl ProfileRecord {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            history: Vec::new(),
            derived_tags: DerivedRiskTags::default(),
        }
    }

    pub fn last_recorded(&self) -> Option<DateTime<Utc>> {
        self.history.last().map(|s| s.recorded_at)
    }

    pub fn contains_snapshot(&self, id: &Uuid) -> bool {
        self.history.iter().any(|s| &s.id == id)
    }
}
