use std::collections::BTreeMap;

use crate::models::*;

/// Relative change over the trend window below which a metric is stable.
const TREND_TOLERANCE: f64 = 0.05;
/// Most recent values considered per metric.
const TREND_POINTS: usize = 3;

fn trend_of(values: &[f64]) -> Option<Trend> {
    let recent = &values[values.len().saturating_sub(TREND_POINTS)..];
    let (first, last) = match recent {
        [first, .., last] => (*first, *last),
        _ => return None,
    };
    let change = if first.abs() > f64::EPSILON {
        (last - first) / first.abs()
    } else {
        last - first
    };
    Some(if change > TREND_TOLERANCE {
        Trend::Rising
    } else if change < -TREND_TOLERANCE {
        Trend::Falling
    } else {
        Trend::Stable
    })
}

/// Recompute the rolling summary from history alone.
///
/// `window` is the number of most recent snapshots that severity counts and
/// conditions cover. Trends use each metric's last few numeric values
/// (first component for compound values).
pub fn derive_tags(history: &[ProfileSnapshot], window: usize) -> DerivedRiskTags {
    let recent = &history[history.len().saturating_sub(window.max(1))..];

    let mut severity_counts = BTreeMap::new();
    let mut conditions = std::collections::BTreeSet::new();
    for flag in recent.iter().flat_map(|s| &s.flags) {
        *severity_counts.entry(flag.severity).or_insert(0) += 1;
        if let Some(condition) = &flag.condition {
            conditions.insert(condition.clone());
        }
    }

    let mut series: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for finding in history.iter().flat_map(|s| &s.findings) {
        if let Some(first) = finding.measured_values().and_then(|v| v.first().copied()) {
            series.entry(finding.metric_key()).or_default().push(first);
        }
    }
    let trends = series
        .into_iter()
        .filter_map(|(metric, values)| trend_of(&values).map(|t| (metric, t)))
        .collect();

    DerivedRiskTags {
        total_snapshots: history.len(),
        first_recorded: history.first().map(|s| s.recorded_at),
        last_recorded: history.last().map(|s| s.recorded_at),
        window: recent.len(),
        severity_counts,
        highest_recent: recent.iter().filter_map(ProfileSnapshot::max_severity).max(),
        trends,
        conditions,
    }
}
