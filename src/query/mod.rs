//! Query surface: recent/range/latest/diff plus CSV export
//!
//! Every request runs the same three stages — plan (projection + aggregation
//! strategy), stream (time-ascending records from the store), reduce (series,
//! table, raw or scalar difference) — as sequential typed calls.

pub mod csv;
pub mod merge;
pub mod planner;
pub mod resample;

use crate::error::QueryError;
use crate::model::{MetricSelection, QueryResult, Record, ResultFormat};
use crate::store::MeterStore;
use chrono_tz::Tz;
use planner::{Consumer, TimeWindow};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Window selector for CSV export.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CsvWindow {
    Recent { elapsed_ms: i64 },
    Range { start_ms: i64, end_ms: i64 },
}

pub struct QueryApi {
    store: Arc<MeterStore>,
    zone: Tz,
    labels: HashMap<String, String>,
}

impl QueryApi {
    pub fn new(store: Arc<MeterStore>, zone: Tz, labels: HashMap<String, String>) -> Self {
        Self {
            store,
            zone,
            labels,
        }
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }

    /// Everything newer than `latest − elapsed_ms`, anchored to the newest
    /// stored record rather than the wall clock.
    pub fn get_recent(
        &self,
        source: &str,
        elapsed_ms: i64,
        selection: &MetricSelection,
        format: ResultFormat,
    ) -> Result<QueryResult, QueryError> {
        if elapsed_ms <= 0 {
            return Err(QueryError::InvalidWindow(format!(
                "elapsed must be positive, got {}",
                elapsed_ms
            )));
        }

        let latest = self
            .store
            .latest(source)?
            .ok_or(QueryError::EmptyResult)?;
        let window = TimeWindow {
            start_ms: latest.time - elapsed_ms,
            end_ms: None,
            duration_ms: elapsed_ms,
        };
        self.run(source, window, selection, format)
    }

    /// Records with `start < time <= end`.
    pub fn get_range(
        &self,
        source: &str,
        start_ms: i64,
        end_ms: i64,
        selection: &MetricSelection,
        format: ResultFormat,
    ) -> Result<QueryResult, QueryError> {
        if start_ms >= end_ms {
            return Err(QueryError::InvalidWindow(format!(
                "start {} is not before end {}",
                start_ms, end_ms
            )));
        }

        let window = TimeWindow {
            start_ms,
            end_ms: Some(end_ms),
            duration_ms: end_ms - start_ms,
        };
        self.run(source, window, selection, format)
    }

    /// The newest stored record for a source, if any.
    pub fn get_latest(&self, source: &str) -> Result<Option<Record>, QueryError> {
        Ok(self.store.latest(source)?)
    }

    /// Scalar difference last − first per metric over a recent window.
    /// Includes a `time` entry holding the elapsed milliseconds between the
    /// first and last records seen.
    pub fn diff(
        &self,
        source: &str,
        elapsed_ms: i64,
        selection: &MetricSelection,
    ) -> Result<BTreeMap<String, f64>, QueryError> {
        match self.get_recent(source, elapsed_ms, selection, ResultFormat::Diff)? {
            QueryResult::Diff(map) => Ok(map),
            _ => unreachable!("diff format returns a diff"),
        }
    }

    /// CSV export for one or more sources over a shared window.
    pub fn export_csv(
        &self,
        sources: &[String],
        selection: &MetricSelection,
        window: CsvWindow,
    ) -> Result<String, QueryError> {
        csv::generate_csv(sources, selection, &self.labels, self.zone, |source| {
            let result = match window {
                CsvWindow::Recent { elapsed_ms } => {
                    self.get_recent(source, elapsed_ms, selection, ResultFormat::Raw)?
                }
                CsvWindow::Range { start_ms, end_ms } => {
                    self.get_range(source, start_ms, end_ms, selection, ResultFormat::Raw)?
                }
            };
            match result {
                QueryResult::Raw(records) => Ok(records),
                _ => unreachable!("raw format returns raw records"),
            }
        })
    }

    fn run(
        &self,
        source: &str,
        window: TimeWindow,
        selection: &MetricSelection,
        format: ResultFormat,
    ) -> Result<QueryResult, QueryError> {
        let consumer = match format {
            ResultFormat::Series => Consumer::Resample,
            ResultFormat::Table => Consumer::Table,
            ResultFormat::Raw => Consumer::Raw,
            ResultFormat::Diff => Consumer::Diff,
        };

        let plan = planner::plan(&self.store, source, window, selection, consumer)?;
        let records = planner::execute(&self.store, &plan)?;

        match format {
            ResultFormat::Series => Ok(QueryResult::Series(resample::to_series(
                &records,
                window.duration_ms,
                &plan.projection.units,
                &self.labels,
                self.zone,
            ))),
            ResultFormat::Table => Ok(QueryResult::Table(records)),
            ResultFormat::Raw => Ok(QueryResult::Raw(records)),
            ResultFormat::Diff => Ok(QueryResult::Diff(reduce_diff(&records)?)),
        }
    }
}

/// Last record minus first record, per metric present in the last record.
fn reduce_diff(records: &[Record]) -> Result<BTreeMap<String, f64>, QueryError> {
    let first = records.first().ok_or(QueryError::EmptyResult)?;
    let last = records.last().ok_or(QueryError::EmptyResult)?;

    let mut diff = BTreeMap::new();
    diff.insert("time".to_string(), (last.time - first.time) as f64);
    for (name, value) in &last.values {
        if let Some(base) = first.values.get(name) {
            diff.insert(name.clone(), value - base);
        }
    }
    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetaEntry, PointSeries};
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, QueryApi) {
        let dir = tempdir().unwrap();
        let store = Arc::new(MeterStore::open(dir.path().join("test.db")).unwrap());
        store
            .upsert_meta(
                "meter",
                &[MetaEntry {
                    handle: "h1".to_string(),
                    name: "Total KW".to_string(),
                    unit: Some("kW".to_string()),
                }],
            )
            .unwrap();
        let api = QueryApi::new(store, chrono_tz::America::New_York, HashMap::new());
        (dir, api)
    }

    fn put(api: &QueryApi, time: i64, value: f64) {
        let mut values = BTreeMap::new();
        values.insert("Total KW".to_string(), value);
        api.store.upsert_record("meter", time, &values).unwrap();
    }

    fn as_series(result: QueryResult) -> Vec<PointSeries> {
        match result {
            QueryResult::Series(list) => list,
            other => panic!("expected series, got {:?}", other),
        }
    }

    #[test]
    fn test_get_recent_anchors_to_latest_record() {
        let (_dir, api) = setup();
        put(&api, 1_000_000, 1.0);
        put(&api, 2_000_000, 2.0);
        put(&api, 3_000_000, 3.0);

        // window of 1.5e6 ms from the latest record at 3e6: records > 1.5e6
        let list = as_series(
            api.get_recent("meter", 1_500_000, &MetricSelection::Default, ResultFormat::Series)
                .unwrap(),
        );
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].data.len(), 2);
        assert_eq!(list[0].id, "Total KW");
    }

    #[test]
    fn test_get_range_validates_window() {
        let (_dir, api) = setup();
        let err = api
            .get_range("meter", 500, 500, &MetricSelection::Default, ResultFormat::Raw)
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidWindow(_)));

        let err = api
            .get_recent("meter", 0, &MetricSelection::Default, ResultFormat::Raw)
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidWindow(_)));
    }

    #[test]
    fn test_diff_last_minus_first() {
        let (_dir, api) = setup();
        put(&api, 1_000_000, 10.0);
        put(&api, 2_000_000, 25.0);

        let diff = api
            .diff("meter", 10_000_000, &MetricSelection::Default)
            .unwrap();
        assert_eq!(diff.get("Total KW"), Some(&15.0));
        assert_eq!(diff.get("time"), Some(&1_000_000.0));
    }

    #[test]
    fn test_diff_empty_window_is_empty_result() {
        let (_dir, api) = setup();
        let err = api
            .diff("meter", 1_000, &MetricSelection::Default)
            .unwrap_err();
        // no records at all: nothing to anchor the window to
        assert!(matches!(err, QueryError::EmptyResult));
    }

    #[test]
    fn test_export_csv_single_source() {
        let (_dir, api) = setup();
        put(&api, 1_000_000, 10.0);
        put(&api, 2_000_000, 25.0);

        let csv = api
            .export_csv(
                &["meter".to_string()],
                &MetricSelection::Default,
                CsvWindow::Range {
                    start_ms: 0,
                    end_ms: 3_000_000,
                },
            )
            .unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "time,Total KW");
        assert_eq!(lines.len(), 3);
    }
}
