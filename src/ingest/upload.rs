//! Batch import of delimited meter history
//!
//! First line is a header naming columns after `time`. Two timestamp formats
//! are accepted, picked per line by a dash-date heuristic. Bad lines are
//! collected as human-readable errors and never abort the batch.

use crate::error::StoreError;
use crate::model::source_key;
use crate::store::{MeterStore, UpsertRow};
use chrono::{NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

const DASH_FORMAT: &str = "%d-%b-%y %H:%M:%S";
const SLASH_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

#[derive(Debug, Default)]
pub struct UploadReport {
    pub accepted: usize,
    pub errors: Vec<String>,
}

fn parse_line_time(raw: &str, zone: Tz) -> Option<i64> {
    let format = if raw.contains('-') {
        DASH_FORMAT
    } else {
        SLASH_FORMAT
    };
    let naive = NaiveDateTime::parse_from_str(raw, format).ok()?;
    // earliest() resolves the repeated fall-back hour deterministically
    zone.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// Import a delimited text file into a source. Every valid line becomes a
/// full-replace upsert keyed by its exact parsed timestamp; uploading the
/// same timestamp twice leaves one record with the later upload's values.
pub fn upload(
    store: &MeterStore,
    source: &str,
    path: impl AsRef<Path>,
    zone: Tz,
) -> Result<UploadReport, StoreError> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);

    // string cells are only meaningful for metadata-style sources
    let keep_text = source_key(source).starts_with("meta_");

    let mut report = UploadReport::default();
    let mut header: Vec<String> = Vec::new();
    let mut rows: Vec<UpsertRow> = Vec::new();
    let mut line_count = 0usize;

    for line in reader.lines() {
        let line = line?;
        let line = line.trim_end_matches('\r');
        line_count += 1;

        if header.is_empty() {
            header = line.split(',').map(|s| s.to_string()).collect();
            continue;
        }

        let row: Vec<&str> = line.split(',').collect();

        if row.len() != header.len() {
            report.errors.push(format!(
                "line {}: Number of columns does not match number of columns in header.",
                line_count
            ));
        }

        let time = match parse_line_time(row[0], zone) {
            Some(time) => time,
            None => {
                report.errors.push(format!(
                    "line {}: No time found on this line.",
                    line_count
                ));
                continue;
            }
        };

        let mut values = BTreeMap::new();
        let mut text = BTreeMap::new();
        for (i, name) in header.iter().enumerate().skip(1) {
            let cell = match row.get(i) {
                Some(cell) => *cell,
                None => continue,
            };
            match cell.parse::<f64>() {
                Ok(value) if value.is_finite() => {
                    values.insert(name.clone(), value);
                }
                _ if keep_text && !cell.is_empty() => {
                    text.insert(name.clone(), cell.to_string());
                }
                _ => {}
            }
        }

        if values.is_empty() && text.is_empty() {
            report.errors.push(format!(
                "line {}: No data found for this line.",
                line_count
            ));
            continue;
        }

        report.accepted += 1;
        rows.push(UpsertRow { time, values, text });
    }

    store.upsert_records(source, &rows)?;

    if report.errors.is_empty() {
        log::info!("Imported {} lines into {}", report.accepted, source);
    } else {
        log::warn!(
            "Imported {} lines into {} with {} parse errors",
            report.accepted,
            source,
            report.errors.len()
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn open_store() -> (tempfile::TempDir, MeterStore) {
        let dir = tempdir().unwrap();
        let store = MeterStore::open(dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    fn csv_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_upload_both_timestamp_formats() {
        let (_dir, store) = open_store();
        let file = csv_file(
            "time,a,b\n\
             10-Jul-24 09:00:00,1,2\n\
             07/10/2024 10:00:00,3,4\n",
        );

        let report = upload(&store, "meter", file.path(), New_York).unwrap();
        assert_eq!(report.accepted, 2);
        assert!(report.errors.is_empty());
        assert_eq!(store.record_count("meter").unwrap(), 2);
    }

    #[test]
    fn test_upload_is_idempotent_last_write_wins() {
        let (_dir, store) = open_store();
        let file1 = csv_file("time,a,b\n10-Jul-24 09:00:00,1,2\n");
        let file2 = csv_file("time,a\n10-Jul-24 09:00:00,9\n");

        upload(&store, "meter", file1.path(), New_York).unwrap();
        upload(&store, "meter", file2.path(), New_York).unwrap();

        assert_eq!(store.record_count("meter").unwrap(), 1);
        let latest = store.latest("meter").unwrap().unwrap();
        assert_eq!(latest.values.get("a"), Some(&9.0));
        // full replace: b from the first upload is gone
        assert!(latest.values.get("b").is_none());
    }

    #[test]
    fn test_bad_lines_collected_not_fatal() {
        let (_dir, store) = open_store();
        let file = csv_file(
            "time,a\n\
             not-a-time,1\n\
             10-Jul-24 09:00:00,nope\n\
             10-Jul-24 10:00:00,5\n",
        );

        let report = upload(&store, "meter", file.path(), New_York).unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors[0].contains("line 2"));
        assert!(report.errors[1].contains("line 3"));
        assert_eq!(store.record_count("meter").unwrap(), 1);
    }

    #[test]
    fn test_column_mismatch_is_warning_only() {
        let (_dir, store) = open_store();
        let file = csv_file(
            "time,a,b\n\
             10-Jul-24 09:00:00,1\n",
        );

        let report = upload(&store, "meter", file.path(), New_York).unwrap();
        // mismatch recorded, line still processed
        assert_eq!(report.accepted, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("columns"));
    }

    #[test]
    fn test_meta_source_keeps_strings() {
        let (_dir, store) = open_store();
        let file = csv_file("time,note\n10-Jul-24 09:00:00,calibrated\n");

        let report = upload(&store, "meta_notes", file.path(), New_York).unwrap();
        assert_eq!(report.accepted, 1);

        // the same line into a plain source has no numeric data
        let file = csv_file("time,note\n10-Jul-24 09:00:00,calibrated\n");
        let report = upload(&store, "plain", file.path(), New_York).unwrap();
        assert_eq!(report.accepted, 0);
        assert_eq!(report.errors.len(), 1);
    }
}
