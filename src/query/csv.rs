//! CSV rendering: single-source flat tables and multi-source merged exports

use super::merge::{format_time, merge_tables, MergedTable};
use crate::error::QueryError;
use crate::model::{MetricSelection, Record};
use chrono_tz::Tz;
use std::collections::HashMap;

/// Render one source's records as CSV. The header is `time` plus the columns
/// of the first record; later rows leave blanks for columns they lack.
pub fn render_flat(records: &[Record], zone: Tz) -> Result<String, QueryError> {
    let first = records.first().ok_or(QueryError::EmptyResult)?;

    let mut header = vec!["time".to_string()];
    header.extend(first.values.keys().cloned());

    let mut csv = header.join(",");
    for record in records {
        let mut row = Vec::with_capacity(header.len());
        row.push(format_time(record.time, zone));
        for col in &header[1..] {
            match record.values.get(col) {
                Some(value) => row.push(value.to_string()),
                None => row.push(String::new()),
            }
        }
        csv.push('\n');
        csv.push_str(&row.join(","));
    }
    Ok(csv)
}

fn render_merged(table: &MergedTable, use_labels: bool) -> String {
    let header = if use_labels {
        &table.human_header
    } else {
        &table.header
    };
    let mut csv = header.join(",");
    for row in &table.rows {
        csv.push('\n');
        csv.push_str(&row.join(","));
    }
    csv
}

/// Build the CSV for one or more sources.
///
/// A single source renders its flat table directly. Multiple sources go
/// through the outer-join merge; a source whose fetch fails contributes an
/// empty table (logged) rather than failing the whole export. Human labels
/// are applied unless the request asked for `all` columns.
pub fn generate_csv<F>(
    sources: &[String],
    selection: &MetricSelection,
    labels: &HashMap<String, String>,
    zone: Tz,
    fetch: F,
) -> Result<String, QueryError>
where
    F: Fn(&str) -> Result<Vec<Record>, QueryError>,
{
    if sources.len() == 1 {
        let records = fetch(&sources[0])?;
        return render_flat(&records, zone);
    }

    let tables: Vec<Vec<Record>> = sources
        .iter()
        .map(|source| match fetch(source) {
            Ok(records) => records,
            Err(e) => {
                log::warn!("export: skipping {}: {}", source, e);
                Vec::new()
            }
        })
        .collect();

    let merged = merge_tables(&tables, labels, zone)?;
    let use_labels = *selection != MetricSelection::All;
    Ok(render_merged(&merged, use_labels))
}
