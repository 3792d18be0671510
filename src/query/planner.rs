//! Query planning: metric projection, unit table, aggregation strategy
//!
//! Per request the planner resolves the desired metric set against the
//! source's metadata, then decides whether the store streams raw rows or
//! pre-aggregates. Raw per-minute data over a long window is too large to
//! stream and resample here, so windows beyond six hours are grouped
//! store-side by calendar hour (or minute, for windows up to a week).

use crate::error::QueryError;
use crate::model::{MetricSelection, Record, POWER_UNIT, QUALIFIER_MARKER};
use crate::store::MeterStore;
use std::collections::BTreeMap;

/// Windows longer than this get store-side pre-aggregation when the consumer
/// is the resampler.
pub const AGGREGATE_THRESHOLD_MS: i64 = 6 * 60 * 60 * 1000;

/// Up to one week the grouped stream keeps minute resolution; beyond that,
/// hour resolution.
pub const MINUTE_GROUP_MAX_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Resolved field projection and unit table for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    /// `None` means no projection: full records (the `all` selection).
    pub fields: Option<Vec<String>>,
    pub units: BTreeMap<String, String>,
}

/// Who consumes the stream. Only the resampler benefits from store-side
/// grouping; tables, raw dumps and diffs always see raw rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumer {
    Resample,
    Table,
    Raw,
    Diff,
}

/// The requested time window. `end_ms` is open for "everything since start".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeWindow {
    pub start_ms: i64,
    pub end_ms: Option<i64>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub source: String,
    pub window: TimeWindow,
    pub projection: Projection,
    pub grouped: bool,
    pub with_minute: bool,
}

/// Resolve the desired metric set to a projection and unit map.
pub fn resolve_projection(
    store: &MeterStore,
    source: &str,
    selection: &MetricSelection,
) -> Result<Projection, QueryError> {
    match selection {
        MetricSelection::All => {
            let entries = store.meta_entries(source)?;
            if entries.is_empty() {
                return Err(QueryError::SourceNotFound(source.to_string()));
            }
            let units = entries
                .iter()
                .filter(|e| !e.name.contains(QUALIFIER_MARKER))
                .filter_map(|e| e.unit.clone().map(|u| (e.name.clone(), u)))
                .collect();
            Ok(Projection {
                fields: None,
                units,
            })
        }
        MetricSelection::Named(names) => {
            let entries = store.meta_by_names(source, names)?;
            if entries.is_empty() {
                return Err(QueryError::SourceNotFound(source.to_string()));
            }
            let fields: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
            let units = entries
                .iter()
                .filter_map(|e| e.unit.clone().map(|u| (e.name.clone(), u)))
                .collect();
            Ok(Projection {
                fields: Some(fields),
                units,
            })
        }
        MetricSelection::Default => {
            let entries = store.meta_by_unit(source, POWER_UNIT)?;
            let fields: Vec<String> = entries
                .iter()
                .filter(|e| !e.name.contains(QUALIFIER_MARKER))
                .map(|e| e.name.clone())
                .collect();
            if fields.is_empty() {
                return Err(QueryError::SourceNotFound(source.to_string()));
            }
            let units = fields
                .iter()
                .map(|name| (name.clone(), POWER_UNIT.to_string()))
                .collect();
            Ok(Projection {
                fields: Some(fields),
                units,
            })
        }
    }
}

/// Build the plan for one request.
pub fn plan(
    store: &MeterStore,
    source: &str,
    window: TimeWindow,
    selection: &MetricSelection,
    consumer: Consumer,
) -> Result<QueryPlan, QueryError> {
    if source.is_empty() {
        return Err(QueryError::SourceNotFound(String::new()));
    }

    let projection = resolve_projection(store, source, selection)?;

    // Full records cannot be grouped store-side: the column set is unknown
    // until rows are read, so `all` streams raw regardless of span.
    let grouped = consumer == Consumer::Resample
        && window.duration_ms > AGGREGATE_THRESHOLD_MS
        && projection.fields.is_some();
    let with_minute = window.duration_ms <= MINUTE_GROUP_MAX_MS;

    Ok(QueryPlan {
        source: source.to_string(),
        window,
        projection,
        grouped,
        with_minute,
    })
}

/// Stream stage: materialize the plan as a time-ascending record list.
pub fn execute(store: &MeterStore, plan: &QueryPlan) -> Result<Vec<Record>, QueryError> {
    let records = if plan.grouped {
        let fields = plan
            .projection
            .fields
            .as_deref()
            .unwrap_or(&[]);
        store.scan_grouped(
            &plan.source,
            plan.window.start_ms,
            plan.window.end_ms,
            fields,
            plan.with_minute,
        )?
    } else {
        store.scan(
            &plan.source,
            plan.window.start_ms,
            plan.window.end_ms,
            plan.projection.fields.as_deref(),
        )?
    };
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetaEntry;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn store_with_meta() -> (tempfile::TempDir, MeterStore) {
        let dir = tempdir().unwrap();
        let store = MeterStore::open(dir.path().join("test.db")).unwrap();
        store
            .upsert_meta(
                "meter",
                &[
                    MetaEntry {
                        handle: "h1".to_string(),
                        name: "Total KW".to_string(),
                        unit: Some("kW".to_string()),
                    },
                    MetaEntry {
                        handle: "h2".to_string(),
                        name: "Aux@Internal".to_string(),
                        unit: Some("kW".to_string()),
                    },
                    MetaEntry {
                        handle: "h3".to_string(),
                        name: "Gas".to_string(),
                        unit: Some("CCF".to_string()),
                    },
                ],
            )
            .unwrap();
        (dir, store)
    }

    fn window(duration_ms: i64) -> TimeWindow {
        TimeWindow {
            start_ms: 0,
            end_ms: Some(duration_ms),
            duration_ms,
        }
    }

    #[test]
    fn test_default_selection_picks_power_metrics() {
        let (_dir, store) = store_with_meta();
        let projection =
            resolve_projection(&store, "meter", &MetricSelection::Default).unwrap();
        // qualifier-marked names are excluded
        assert_eq!(projection.fields.as_deref(), Some(&["Total KW".to_string()][..]));
        assert_eq!(projection.units.get("Total KW").map(String::as_str), Some("kW"));
    }

    #[test]
    fn test_named_selection() {
        let (_dir, store) = store_with_meta();
        let projection = resolve_projection(
            &store,
            "meter",
            &MetricSelection::Named(vec!["Gas".to_string()]),
        )
        .unwrap();
        assert_eq!(projection.fields.as_deref(), Some(&["Gas".to_string()][..]));
        assert_eq!(projection.units.get("Gas").map(String::as_str), Some("CCF"));
    }

    #[test]
    fn test_all_selection_has_no_projection() {
        let (_dir, store) = store_with_meta();
        let projection = resolve_projection(&store, "meter", &MetricSelection::All).unwrap();
        assert!(projection.fields.is_none());
        assert!(projection.units.contains_key("Total KW"));
        assert!(!projection.units.contains_key("Aux@Internal"));
    }

    #[test]
    fn test_unknown_source_fails() {
        let (_dir, store) = store_with_meta();
        let err = resolve_projection(&store, "ghost", &MetricSelection::Default).unwrap_err();
        assert!(matches!(err, QueryError::SourceNotFound(_)));

        let err = resolve_projection(
            &store,
            "meter",
            &MetricSelection::Named(vec!["Missing".to_string()]),
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::SourceNotFound(_)));
    }

    #[test]
    fn test_grouping_decision() {
        let (_dir, store) = store_with_meta();
        let hour = 60 * 60 * 1000i64;

        // short window: raw even for the resampler
        let p = plan(
            &store,
            "meter",
            window(2 * hour),
            &MetricSelection::Default,
            Consumer::Resample,
        )
        .unwrap();
        assert!(!p.grouped);

        // long window + resampler: grouped, minute resolution under a week
        let p = plan(
            &store,
            "meter",
            window(24 * hour),
            &MetricSelection::Default,
            Consumer::Resample,
        )
        .unwrap();
        assert!(p.grouped);
        assert!(p.with_minute);

        // beyond a week: hour resolution
        let p = plan(
            &store,
            "meter",
            window(14 * 24 * hour),
            &MetricSelection::Default,
            Consumer::Resample,
        )
        .unwrap();
        assert!(p.grouped);
        assert!(!p.with_minute);

        // long window but table consumer: raw
        let p = plan(
            &store,
            "meter",
            window(24 * hour),
            &MetricSelection::Default,
            Consumer::Table,
        )
        .unwrap();
        assert!(!p.grouped);

        // `all` never groups: no closed column set to average
        let p = plan(
            &store,
            "meter",
            window(24 * hour),
            &MetricSelection::All,
            Consumer::Resample,
        )
        .unwrap();
        assert!(!p.grouped);
    }

    #[test]
    fn test_execute_applies_projection() {
        let (_dir, store) = store_with_meta();
        let mut values = BTreeMap::new();
        values.insert("Total KW".to_string(), 5.0);
        values.insert("Gas".to_string(), 7.0);
        store.upsert_record("meter", 1000, &values).unwrap();

        let p = plan(
            &store,
            "meter",
            TimeWindow {
                start_ms: 0,
                end_ms: None,
                duration_ms: 60_000,
            },
            &MetricSelection::Default,
            Consumer::Raw,
        )
        .unwrap();
        let records = execute(&store, &p).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].values.get("Total KW"), Some(&5.0));
        assert!(records[0].values.get("Gas").is_none());
    }
}
