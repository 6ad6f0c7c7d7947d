use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Leading measured value: a number or a slash-separated compound (`140/90`).
/// An optional comparator prefix (`<0.5`) is tolerated and ignored.
static MEASURED_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[<>]=?\s*)?(-?\d+(?:[.,]\d+)?(?:\s*/\s*-?\d+(?:[.,]\d+)?)*)").unwrap()
});

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FindingParseError {
    #[error("Invalid reference range: {0}")]
    InvalidRange(String),

    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),
}

/// Location of the finding in the extracted report text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    pub start: usize,
    pub end: usize,
}

/// A single structured measurement extracted from a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    pub metric: String,
    /// Raw measured value as printed on the report (`6.8`, `140/90`).
    pub value: String,
    pub unit: Option<String>,
    /// Raw reference range as printed (`3.9-6.1`, `<120/80`).
    pub reference_range: Option<String>,
    pub source_span: Option<SourceSpan>,
}

impl Finding {
    pub fn new(metric: &str, value: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            metric: metric.trim().to_string(),
            value: value.trim().to_string(),
            unit: None,
            reference_range: None,
            source_span: None,
        }
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.trim().to_string());
        self
    }

    pub fn with_reference_range(mut self, range: &str) -> Self {
        self.reference_range = Some(range.trim().to_string());
        self
    }

    pub fn with_source_span(mut self, start: usize, end: usize) -> Self {
        self.source_span = Some(SourceSpan { start, end });
        self
    }

    /// Normalized metric identifier used for rule and history lookups.
    pub fn metric_key(&self) -> String {
        metric_key(&self.metric)
    }

    /// Human-readable metric name (`blood pressure`).
    pub fn display_name(&self) -> String {
        self.metric_key().replace('_', " ")
    }

    /// Numeric components of the measured value, `None` for non-numeric results.
    pub fn measured_values(&self) -> Option<Vec<f64>> {
        parse_measured(&self.value)
    }

    /// Parsed reference range; `None` when absent or unparseable.
    pub fn parsed_reference(&self) -> Option<ReferenceRange> {
        let raw = self.reference_range.as_deref()?;
        match raw.parse::<ReferenceRange>() {
            Ok(range) => Some(range),
            Err(e) => {
                tracing::debug!(metric = %self.metric_key(), error = %e, "Unparseable reference range");
                None
            }
        }
    }

    /// How far the value lies outside its reference range (relative, 0 when
    /// inside or unknown). Used to order evidence of equal score.
    pub fn deviation(&self) -> f64 {
        match (self.measured_values(), self.parsed_reference()) {
            (Some(values), Some(range)) => range.deviation(&values).unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// Whether the value lies outside the report's own reference range.
    pub fn is_out_of_reference(&self) -> Option<bool> {
        let values = self.measured_values()?;
        let range = self.parsed_reference()?;
        range.contains(&values).map(|inside| !inside)
    }

    /// Text used to embed the finding for knowledge retrieval.
    pub fn description(&self) -> String {
        let mut text = format!("{} {}", self.display_name(), self.value);
        if let Some(unit) = &self.unit {
            text.push(' ');
            text.push_str(unit);
        }
        if let Some(range) = &self.reference_range {
            text.push_str(&format!(" (reference {range})"));
        }
        match self.is_out_of_reference() {
            Some(true) => text.push_str(" abnormal out of range"),
            Some(false) => text.push_str(" within range"),
            None => {}
        }
        text
    }
}

/// Normalize a metric name: lowercase, non-alphanumeric runs become `_`.
pub fn metric_key(raw: &str) -> String {
    let mut key = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for c in raw.trim().chars() {
        if c.is_alphanumeric() {
            if pending_sep && !key.is_empty() {
                key.push('_');
            }
            pending_sep = false;
            key.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    key
}

/// Parse the leading numeric value(s) of a measurement.
pub fn parse_measured(raw: &str) -> Option<Vec<f64>> {
    let caps = MEASURED_VALUE.captures(raw)?;
    let nums = caps.get(1)?.as_str();
    nums.split('/')
        .map(|part| part.trim().replace(',', ".").parse::<f64>().ok())
        .collect()
}

/// Parse a threshold that may be scalar (`40`) or compound (`140/90`).
pub fn parse_threshold(raw: &str) -> Result<Vec<f64>, FindingParseError> {
    let trimmed = raw.trim();
    let parts: Option<Vec<f64>> = trimmed
        .split('/')
        .map(|p| p.trim().replace(',', ".").parse::<f64>().ok())
        .collect();
    match parts {
        Some(values) if !values.is_empty() && values.iter().all(|v| v.is_finite()) => Ok(values),
        _ => Err(FindingParseError::InvalidThreshold(raw.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub value: f64,
    pub inclusive: bool,
}

/// Accepted interval for one component of a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub low: Option<Bound>,
    pub high: Option<Bound>,
}

impl Interval {
    pub fn contains(&self, v: f64) -> bool {
        let above_low = match self.low {
            Some(b) if b.inclusive => v >= b.value,
            Some(b) => v > b.value,
            None => true,
        };
        let below_high = match self.high {
            Some(b) if b.inclusive => v <= b.value,
            Some(b) => v < b.value,
            None => true,
        };
        above_low && below_high
    }

    /// Relative distance outside the interval; 0 inside.
    pub fn deviation(&self, v: f64) -> f64 {
        if self.contains(v) {
            return 0.0;
        }
        let distance = |bound: f64| {
            let gap = (v - bound).abs();
            if bound.abs() > f64::EPSILON {
                gap / bound.abs()
            } else {
                gap
            }
        };
        match (self.low, self.high) {
            (Some(low), _) if v <= low.value => distance(low.value),
            (_, Some(high)) => distance(high.value),
            (Some(low), None) => distance(low.value),
            (None, None) => 0.0,
        }
    }
}

/// A parsed reference range, one interval per value component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRange {
    pub intervals: Vec<Interval>,
}

impl ReferenceRange {
    /// `None` when the component counts differ.
    pub fn contains(&self, values: &[f64]) -> Option<bool> {
        if values.len() != self.intervals.len() {
            return None;
        }
        Some(
            self.intervals
                .iter()
                .zip(values)
                .all(|(interval, v)| interval.contains(*v)),
        )
    }

    pub fn deviation(&self, values: &[f64]) -> Option<f64> {
        if values.len() != self.intervals.len() {
            return None;
        }
        Some(
            self.intervals
                .iter()
                .zip(values)
                .map(|(interval, v)| interval.deviation(*v))
                .fold(0.0, f64::max),
        )
    }

    /// All finite bounds, used to tell quoted thresholds from quoted values.
    pub fn bounds(&self) -> Vec<f64> {
        self.intervals
            .iter()
            .flat_map(|i| [i.low.map(|b| b.value), i.high.map(|b| b.value)])
            .flatten()
            .collect()
    }
}

impl FromStr for ReferenceRange {
    type Err = FindingParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .trim()
            .replace('≤', "<=")
            .replace('≥', ">=")
            .replace(['–', '—', '~'], "-");
        let invalid = || FindingParseError::InvalidRange(s.to_string());

        if normalized.is_empty() {
            return Err(invalid());
        }

        let (op, rest) = if let Some(rest) = normalized.strip_prefix("<=") {
            (Some(("<", true)), rest)
        } else if let Some(rest) = normalized.strip_prefix(">=") {
            (Some((">", true)), rest)
        } else if let Some(rest) = normalized.strip_prefix('<') {
            (Some(("<", false)), rest)
        } else if let Some(rest) = normalized.strip_prefix('>') {
            (Some((">", false)), rest)
        } else {
            (None, normalized.as_str())
        };

        let mut intervals = Vec::new();
        for part in rest.split('/') {
            let part = part.trim();
            let interval = match op {
                Some((direction, inclusive)) => {
                    let value = parse_number(part).ok_or_else(invalid)?;
                    let bound = Some(Bound { value, inclusive });
                    if direction == "<" {
                        Interval { low: None, high: bound }
                    } else {
                        Interval { low: bound, high: None }
                    }
                }
                None => {
                    // Skip the first char so a leading minus sign is not taken as the separator.
                    let split_at = part
                        .char_indices()
                        .skip(1)
                        .find(|(_, c)| *c == '-')
                        .map(|(i, _)| i)
                        .ok_or_else(invalid)?;
                    let low = parse_number(&part[..split_at]).ok_or_else(invalid)?;
                    let high = parse_number(&part[split_at + 1..]).ok_or_else(invalid)?;
                    if low > high {
                        return Err(invalid());
                    }
                    Interval {
                        low: Some(Bound { value: low, inclusive: true }),
                        high: Some(Bound { value: high, inclusive: true }),
                    }
                }
            };
            intervals.push(interval);
        }

        Ok(Self { intervals })
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim()
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}
