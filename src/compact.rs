//! Background compaction of raw history into minute averages
//!
//! High-frequency sources accumulate records far denser than any query needs
//! once the data is old. Compaction replaces every raw record inside a minute
//! with one averaged record at the minute boundary. The condensed record is
//! inserted before its raw inputs are deleted, inside one transaction, so a
//! crash mid-batch never loses a minute of history.

use crate::error::QueryError;
use crate::store::MeterStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Minute buckets condensed per store transaction.
pub const CONDENSE_BATCH_SIZE: usize = 60;
/// Concurrent batches in flight.
const MAX_IN_FLIGHT: usize = 4;
const MINUTE_MS: i64 = 60_000;

#[derive(Debug, Default, PartialEq)]
pub struct CompactionReport {
    /// Distinct minute buckets written.
    pub buckets: usize,
    /// Raw records consumed.
    pub raw_records: usize,
    /// Batches that failed and left their raw records in place.
    pub failed_batches: usize,
}

struct CondenseOp {
    bucket_ms: i64,
    values: BTreeMap<String, f64>,
    ids: Vec<i64>,
}

/// Condense every raw record with `start_ms <= time < end_ms` into minute
/// averages. Batch failures are logged and counted; the affected raw records
/// stay untouched for a later run.
pub async fn compact_range(
    store: Arc<MeterStore>,
    source: &str,
    start_ms: i64,
    end_ms: i64,
) -> Result<CompactionReport, QueryError> {
    if start_ms >= end_ms {
        return Err(QueryError::InvalidWindow(format!(
            "start {} is not before end {}",
            start_ms, end_ms
        )));
    }

    let records = store.scan_range_raw(source, start_ms, end_ms)?;
    if records.is_empty() {
        return Ok(CompactionReport::default());
    }

    // the first record fixes the column set for the whole run
    let columns: Vec<String> = records[0].values.keys().cloned().collect();

    let mut ops: Vec<CondenseOp> = Vec::new();
    let mut raw_records = 0usize;
    for record in &records {
        let bucket_ms = record.time - record.time % MINUTE_MS;
        if ops.last().map(|op| op.bucket_ms) != Some(bucket_ms) {
            ops.push(CondenseOp {
                bucket_ms,
                values: BTreeMap::new(),
                ids: Vec::new(),
            });
        }
        let op = ops.last_mut().unwrap();

        let id = match record.id {
            Some(id) => id,
            None => continue,
        };
        op.ids.push(id);
        raw_records += 1;
        for col in &columns {
            match record.values.get(col) {
                Some(value) if value.is_finite() => {
                    let slot = op.values.entry(col.clone()).or_insert(0.0);
                    *slot += value;
                }
                Some(value) => {
                    log::warn!("{}: non-finite {} at {}, skipped", source, value, record.time);
                }
                None => {}
            }
        }
    }

    // average over every record in the bucket
    for op in &mut ops {
        let count = op.ids.len() as f64;
        for value in op.values.values_mut() {
            *value /= count;
        }
    }

    let bucket_total = ops.len();
    log::info!(
        "compacting {}: {} raw records into {} minute buckets",
        source,
        raw_records,
        bucket_total
    );

    let semaphore = Arc::new(Semaphore::new(MAX_IN_FLIGHT));
    let mut tasks: JoinSet<usize> = JoinSet::new();

    let mut batches: Vec<Vec<CondenseOp>> = Vec::new();
    let mut current: Vec<CondenseOp> = Vec::new();
    for op in ops {
        current.push(op);
        if current.len() == CONDENSE_BATCH_SIZE {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }

    for batch in batches {
        let store = store.clone();
        let source = source.to_string();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.unwrap();
            let mut failed = 0usize;
            for op in &batch {
                if let Err(e) = store.condense(&source, op.bucket_ms, &op.values, &op.ids) {
                    log::error!(
                        "condense failed for {} bucket {}: {}",
                        source,
                        op.bucket_ms,
                        e
                    );
                    failed += 1;
                }
            }
            failed
        });
    }

    // completion barrier: the job is done only once every batch has landed
    let mut failed_batches = 0usize;
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(failed) => failed_batches += failed,
            Err(e) => {
                log::error!("condense task panicked for {}: {}", source, e);
                failed_batches += 1;
            }
        }
    }

    Ok(CompactionReport {
        buckets: bucket_total - failed_batches,
        raw_records,
        failed_batches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<MeterStore>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(MeterStore::open(dir.path().join("test.db")).unwrap());
        (dir, store)
    }

    fn put(store: &MeterStore, time: i64, value: f64) {
        let mut values = BTreeMap::new();
        values.insert("Total KW".to_string(), value);
        store.upsert_record("meter", time, &values).unwrap();
    }

    #[tokio::test]
    async fn test_compact_one_record_per_minute_bucket() {
        let (_dir, store) = setup();
        // three records in minute 0, two in minute 1
        put(&store, 0, 10.0);
        put(&store, 20_000, 20.0);
        put(&store, 40_000, 30.0);
        put(&store, 60_000, 5.0);
        put(&store, 90_000, 15.0);

        let report = compact_range(store.clone(), "meter", 0, 120_000)
            .await
            .unwrap();
        assert_eq!(report.buckets, 2);
        assert_eq!(report.raw_records, 5);
        assert_eq!(report.failed_batches, 0);

        let records = store.scan("meter", -1, None, None).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].time, 0);
        assert_eq!(records[0].values.get("Total KW"), Some(&20.0));
        assert_eq!(records[1].time, 60_000);
        assert_eq!(records[1].values.get("Total KW"), Some(&10.0));
    }

    #[tokio::test]
    async fn test_compact_preserves_metric_mass() {
        let (_dir, store) = setup();
        let mut input_sum = 0.0;
        // 198 records at 10s spacing: exactly 33 minutes of 6 samples each
        for i in 0..198 {
            let value = (i % 7) as f64 + 0.5;
            put(&store, i * 10_000, value);
            input_sum += value;
        }

        compact_range(store.clone(), "meter", 0, 2_000_000)
            .await
            .unwrap();

        // sum of (bucket average × bucket population) equals the input sum
        let raw = store.scan_range_raw("meter", 0, 2_000_000).unwrap();
        let mut output_sum = 0.0;
        for record in &raw {
            // each minute held six 10s samples
            output_sum += record.values.get("Total KW").unwrap() * 6.0;
        }
        assert!((output_sum - input_sum).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_compact_leaves_out_of_range_records() {
        let (_dir, store) = setup();
        put(&store, 10_000, 1.0);
        put(&store, 20_000, 2.0);
        put(&store, 500_000, 9.0);

        let report = compact_range(store.clone(), "meter", 0, 60_000)
            .await
            .unwrap();
        assert_eq!(report.buckets, 1);
        assert_eq!(report.raw_records, 2);

        let records = store.scan("meter", -1, None, None).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].time, 500_000);
        assert_eq!(records[1].values.get("Total KW"), Some(&9.0));
    }

    #[tokio::test]
    async fn test_compact_rejects_empty_window() {
        let (_dir, store) = setup();
        let err = compact_range(store, "meter", 100, 100).await.unwrap_err();
        assert!(matches!(err, QueryError::InvalidWindow(_)));
    }

    #[tokio::test]
    async fn test_compact_empty_source_is_noop() {
        let (_dir, store) = setup();
        let report = compact_range(store, "meter", 0, 1_000_000).await.unwrap();
        assert_eq!(report, CompactionReport::default());
    }
}
