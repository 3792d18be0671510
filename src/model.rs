//! Core data types shared across the query, ingestion and compaction paths

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The instantaneous-power unit used for default metric selection.
pub const POWER_UNIT: &str = "kW";

/// The integrated-energy unit that power metrics are relabeled to once
/// bucketed resampling applies its duration multiplier.
pub const ENERGY_UNIT: &str = "kWh";

/// Metric names containing this marker are internal qualifiers and are
/// excluded from `all` selections and unit defaults.
pub const QUALIFIER_MARKER: char = '@';

/// Normalize a path-like source name into a storage-safe key.
///
/// Deterministic and stable: `:` becomes `_`, `/` becomes `-`. Everything
/// else passes through so two distinct sources never collide.
pub fn source_key(source: &str) -> String {
    source.replace(':', "_").replace('/', "-")
}

/// Key of the per-source metadata table.
pub fn meta_key(source: &str) -> String {
    format!("meta_{}", source_key(source))
}

/// One stored document: a timestamp plus a closed metric-name → value map.
///
/// `id` is the storage row id; it is only populated by raw scans so that
/// compaction can delete the exact rows it condensed.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: Option<i64>,
    /// Epoch milliseconds.
    pub time: i64,
    pub values: BTreeMap<String, f64>,
}

impl Record {
    pub fn new(time: i64, values: BTreeMap<String, f64>) -> Self {
        Self {
            id: None,
            time,
            values,
        }
    }
}

/// Per-metric metadata: device handle, display name, unit label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaEntry {
    pub handle: String,
    pub name: String,
    pub unit: Option<String>,
}

/// One chart point; `x` is epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: f64,
}

/// A named series of points, ordered by `x` ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointSeries {
    pub name: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub data: Vec<Point>,
}

/// Which metrics a request wants.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricSelection {
    /// No explicit list: default to metrics whose unit is [`POWER_UNIT`].
    Default,
    /// Every metadata entry without a qualifier marker, full records.
    All,
    /// An explicit field-name list.
    Named(Vec<String>),
}

impl MetricSelection {
    /// Parse the query-string convention: unset, `all`, or a comma list.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None => MetricSelection::Default,
            Some("all") => MetricSelection::All,
            Some(list) => {
                let names: Vec<String> = list
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if names.is_empty() {
                    MetricSelection::Default
                } else {
                    MetricSelection::Named(names)
                }
            }
        }
    }
}

/// Output shape of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultFormat {
    /// Point series per metric, resampled to the window.
    Series,
    /// Time-ascending flat table (CSV backing).
    Table,
    /// Raw records, untouched.
    Raw,
    /// Scalar difference last − first per metric.
    Diff,
}

/// Result of a query, one variant per [`ResultFormat`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Series(Vec<PointSeries>),
    Table(Vec<Record>),
    Raw(Vec<Record>),
    Diff(BTreeMap<String, f64>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_key_normalization() {
        assert_eq!(
            source_key("x-pml:/diagrams/ud/main.dgm"),
            "x-pml_-diagrams-ud-main.dgm"
        );
        assert_eq!(source_key("plain"), "plain");
        // deterministic
        assert_eq!(source_key("a:/b"), source_key("a:/b"));
    }

    #[test]
    fn test_meta_key_prefix() {
        assert_eq!(meta_key("a:/b"), "meta_a_-b");
    }

    #[test]
    fn test_metric_selection_parse() {
        assert_eq!(MetricSelection::parse(None), MetricSelection::Default);
        assert_eq!(MetricSelection::parse(Some("all")), MetricSelection::All);
        assert_eq!(
            MetricSelection::parse(Some("Total KW, SRV1PKW")),
            MetricSelection::Named(vec!["Total KW".to_string(), "SRV1PKW".to_string()])
        );
        assert_eq!(MetricSelection::parse(Some("")), MetricSelection::Default);
    }
}
