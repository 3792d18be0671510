//! N-way merge of per-source flat tables for multi-source CSV export
//!
//! Rows from different sources can be sub-second-misaligned, so the join key
//! is the timestamp formatted to second resolution in the presentation zone,
//! not raw instant equality.

use crate::error::QueryError;
use crate::model::Record;
use chrono::TimeZone;
use chrono_tz::Tz;
use std::collections::HashMap;

/// Presentation timestamp format, second resolution.
pub const TIME_FORMAT: &str = "%d-%b-%y %H:%M:%S";

pub fn format_time(time_ms: i64, zone: Tz) -> String {
    match zone.timestamp_millis_opt(time_ms).single() {
        Some(dt) => dt.format(TIME_FORMAT).to_string(),
        None => time_ms.to_string(),
    }
}

/// One wide table: `time` plus the union of source columns.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedTable {
    /// Metric ids, `time` first.
    pub header: Vec<String>,
    /// Header with ids translated through the label dictionary.
    pub human_header: Vec<String>,
    /// Cell values as rendered strings; blanks where a source had no row.
    pub rows: Vec<Vec<String>>,
}

/// Outer-join N independently time-sorted tables into one.
///
/// Repeatedly takes the minimum pending timestamp across all cursors, folds
/// in every source whose next row lands on that second, and advances only the
/// cursors consumed.
pub fn merge_tables(
    tables: &[Vec<Record>],
    labels: &HashMap<String, String>,
    zone: Tz,
) -> Result<MergedTable, QueryError> {
    let mut header = vec!["time".to_string()];
    let mut human_header = vec!["time".to_string()];

    for table in tables {
        if let Some(first) = table.first() {
            for col in first.values.keys() {
                if !header.contains(col) {
                    header.push(col.clone());
                    human_header.push(labels.get(col).cloned().unwrap_or_else(|| col.clone()));
                }
            }
        }
    }

    if header.len() == 1 {
        return Err(QueryError::EmptyResult);
    }

    let mut cursors = vec![0usize; tables.len()];
    let mut rows = Vec::new();

    loop {
        let min_time = tables
            .iter()
            .zip(&cursors)
            .filter_map(|(table, &cursor)| table.get(cursor).map(|r| r.time))
            .min();
        let min_time = match min_time {
            Some(t) => t,
            None => break, // all cursors exhausted
        };
        let min_time_str = format_time(min_time, zone);

        let mut row_values: HashMap<&str, f64> = HashMap::new();
        for (table, cursor) in tables.iter().zip(cursors.iter_mut()) {
            if let Some(record) = table.get(*cursor) {
                if format_time(record.time, zone) == min_time_str {
                    for (col, value) in &record.values {
                        row_values.insert(col.as_str(), *value);
                    }
                    *cursor += 1;
                }
            }
        }

        let mut line = Vec::with_capacity(header.len());
        for col in &header {
            if col == "time" {
                line.push(min_time_str.clone());
            } else {
                match row_values.get(col.as_str()) {
                    Some(value) => line.push(value.to_string()),
                    None => line.push(String::new()),
                }
            }
        }
        rows.push(line);
    }

    Ok(MergedTable {
        header,
        human_header,
        rows,
    })
}
