//! SQLite-backed record store
//!
//! One wide table per source (normalized key), one `meta_`-prefixed metadata
//! table per source. Records are keyed by time with a unique index; metric
//! columns are added dynamically the first time a metric appears. Upserts are
//! full row replacements, so at most one record exists per (source, time).

pub mod pragma;

use crate::error::StoreError;
use crate::model::{meta_key, source_key, MetaEntry, Record};
use chrono::NaiveDateTime;
use pragma::apply_optimized_pragmas;
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, ToSql};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

/// A record ready to be written: numeric values plus string cells that are
/// only kept for metadata-style sources.
#[derive(Debug, Clone, Default)]
pub struct UpsertRow {
    pub time: i64,
    pub values: BTreeMap<String, f64>,
    pub text: BTreeMap<String, String>,
}

pub struct MeterStore {
    conn: Mutex<Connection>,
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl MeterStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        apply_optimized_pragmas(&conn)?;

        log::info!("SQLite store opened with WAL mode");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn table_exists(conn: &Connection, table: &str) -> Result<bool, StoreError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn ensure_source_table(conn: &Connection, key: &str) -> Result<(), StoreError> {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    time INTEGER NOT NULL UNIQUE
                )",
                quote_ident(key)
            ),
            [],
        )?;
        Ok(())
    }

    fn ensure_meta_table(conn: &Connection, mkey: &str) -> Result<(), StoreError> {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    h TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    unit TEXT
                )",
                quote_ident(mkey)
            ),
            [],
        )?;
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS {} ON {}(h, name)",
                quote_ident(&format!("idx_{}_h_name", mkey)),
                quote_ident(mkey)
            ),
            [],
        )?;
        Ok(())
    }

    fn existing_columns(conn: &Connection, key: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(key)))?;
        let cols = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(cols
            .into_iter()
            .filter(|c| c != "id" && c != "time")
            .collect())
    }

    fn ensure_metric_columns<'a>(
        conn: &Connection,
        key: &str,
        numeric: impl Iterator<Item = &'a String>,
        text: impl Iterator<Item = &'a String>,
    ) -> Result<(), StoreError> {
        let existing = Self::existing_columns(conn, key)?;
        for (name, ty) in numeric
            .map(|n| (n, "REAL"))
            .chain(text.map(|n| (n, "TEXT")))
        {
            if !existing.iter().any(|c| c == name) {
                conn.execute(
                    &format!(
                        "ALTER TABLE {} ADD COLUMN {} {}",
                        quote_ident(key),
                        quote_ident(name),
                        ty
                    ),
                    [],
                )?;
            }
        }
        Ok(())
    }

    /// Full-replace upsert of one record.
    pub fn upsert_record(
        &self,
        source: &str,
        time: i64,
        values: &BTreeMap<String, f64>,
    ) -> Result<(), StoreError> {
        let row = UpsertRow {
            time,
            values: values.clone(),
            text: BTreeMap::new(),
        };
        self.upsert_records(source, &[row])
    }

    /// Full-replace upsert of a batch of records in one transaction.
    ///
    /// `INSERT OR REPLACE` on the unique time column drops any previous row at
    /// that timestamp entirely; columns absent from the new row become NULL
    /// rather than being merged.
    pub fn upsert_records(&self, source: &str, rows: &[UpsertRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let key = source_key(source);
        let mut guard = self.conn.lock().unwrap();
        let tx = guard.transaction()?;

        Self::ensure_source_table(&tx, &key)?;

        let mut numeric: Vec<&String> = Vec::new();
        let mut text: Vec<&String> = Vec::new();
        for row in rows {
            for name in row.values.keys() {
                if !numeric.contains(&name) {
                    numeric.push(name);
                }
            }
            for name in row.text.keys() {
                if !text.contains(&name) {
                    text.push(name);
                }
            }
        }
        Self::ensure_metric_columns(&tx, &key, numeric.iter().copied(), text.iter().copied())?;

        for row in rows {
            let mut cols = vec!["time".to_string()];
            let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(row.time)];
            for (name, value) in &row.values {
                cols.push(quote_ident(name));
                params.push(Box::new(*value));
            }
            for (name, value) in &row.text {
                cols.push(quote_ident(name));
                params.push(Box::new(value.clone()));
            }

            let placeholders: Vec<String> =
                (1..=params.len()).map(|i| format!("?{}", i)).collect();
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
                    quote_ident(&key),
                    cols.join(", "),
                    placeholders.join(", ")
                ),
                params_from_iter(params.iter().map(|p| p.as_ref())),
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// The most recent record for a source, if any.
    pub fn latest(&self, source: &str) -> Result<Option<Record>, StoreError> {
        let key = source_key(source);
        let guard = self.conn.lock().unwrap();
        if !Self::table_exists(&guard, &key)? {
            return Ok(None);
        }

        let mut stmt = guard.prepare(&format!(
            "SELECT * FROM {} ORDER BY time DESC LIMIT 1",
            quote_ident(&key)
        ))?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_record(row, &names)?)),
            None => Ok(None),
        }
    }

    fn row_to_record(row: &rusqlite::Row<'_>, names: &[String]) -> Result<Record, StoreError> {
        let mut record = Record::new(0, BTreeMap::new());
        for (idx, name) in names.iter().enumerate() {
            match name.as_str() {
                "id" => record.id = Some(row.get(idx)?),
                "time" => record.time = row.get(idx)?,
                _ => match row.get_ref(idx)? {
                    ValueRef::Real(v) => {
                        record.values.insert(name.clone(), v);
                    }
                    ValueRef::Integer(v) => {
                        record.values.insert(name.clone(), v as f64);
                    }
                    // NULL and text cells are invisible to the numeric pipeline
                    _ => {}
                },
            }
        }
        Ok(record)
    }

    /// Time-ascending raw scan: `time > start` and, when given, `time <= end`.
    ///
    /// A projection restricts the selected metric columns; names that have no
    /// stored column yet are silently absent from the result.
    pub fn scan(
        &self,
        source: &str,
        start_ms: i64,
        end_ms: Option<i64>,
        projection: Option<&[String]>,
    ) -> Result<Vec<Record>, StoreError> {
        let key = source_key(source);
        let guard = self.conn.lock().unwrap();
        if !Self::table_exists(&guard, &key)? {
            return Ok(Vec::new());
        }

        let select = match projection {
            Some(fields) => {
                let existing = Self::existing_columns(&guard, &key)?;
                let cols: Vec<String> = fields
                    .iter()
                    .filter(|f| existing.iter().any(|c| c == *f))
                    .map(|f| quote_ident(f))
                    .collect();
                if cols.is_empty() {
                    "id, time".to_string()
                } else {
                    format!("id, time, {}", cols.join(", "))
                }
            }
            None => "*".to_string(),
        };

        let mut sql = format!(
            "SELECT {} FROM {} WHERE time > ?1",
            select,
            quote_ident(&key)
        );
        let mut params: Vec<i64> = vec![start_ms];
        if let Some(end) = end_ms {
            sql.push_str(" AND time <= ?2");
            params.push(end);
        }
        sql.push_str(" ORDER BY time ASC");

        let mut stmt = guard.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query(params_from_iter(params))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(Self::row_to_record(row, &names)?);
        }
        Ok(records)
    }

    /// Raw scan for compaction: `start <= time < end`, row ids included.
    pub fn scan_range_raw(
        &self,
        source: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Record>, StoreError> {
        let key = source_key(source);
        let guard = self.conn.lock().unwrap();
        if !Self::table_exists(&guard, &key)? {
            return Ok(Vec::new());
        }

        let mut stmt = guard.prepare(&format!(
            "SELECT * FROM {} WHERE time >= ?1 AND time < ?2 ORDER BY time ASC",
            quote_ident(&key)
        ))?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query([start_ms, end_ms])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(Self::row_to_record(row, &names)?);
        }
        Ok(records)
    }

    /// Store-side pre-aggregation: per-column averages grouped by UTC calendar
    /// year/month/day/hour, plus minute when `with_minute` is set. Bucket
    /// timestamps land on the truncated bucket start, ordered ascending.
    pub fn scan_grouped(
        &self,
        source: &str,
        start_ms: i64,
        end_ms: Option<i64>,
        fields: &[String],
        with_minute: bool,
    ) -> Result<Vec<Record>, StoreError> {
        let key = source_key(source);
        let guard = self.conn.lock().unwrap();
        if !Self::table_exists(&guard, &key)? {
            return Ok(Vec::new());
        }

        let existing = Self::existing_columns(&guard, &key)?;
        let cols: Vec<&String> = fields
            .iter()
            .filter(|f| existing.iter().any(|c| c == *f))
            .collect();
        if cols.is_empty() {
            return Ok(Vec::new());
        }

        let bucket_fmt = if with_minute {
            "%Y-%m-%d %H:%M:00"
        } else {
            "%Y-%m-%d %H:00:00"
        };

        let avgs: Vec<String> = cols
            .iter()
            .map(|c| format!("AVG({})", quote_ident(c)))
            .collect();
        let mut sql = format!(
            "SELECT strftime('{}', time / 1000, 'unixepoch') AS bucket, {} FROM {} WHERE time > ?1",
            bucket_fmt,
            avgs.join(", "),
            quote_ident(&key)
        );
        let mut params: Vec<i64> = vec![start_ms];
        if let Some(end) = end_ms {
            sql.push_str(" AND time <= ?2");
            params.push(end);
        }
        sql.push_str(" GROUP BY bucket ORDER BY bucket ASC");

        let mut stmt = guard.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let bucket: String = row.get(0)?;
            let naive = NaiveDateTime::parse_from_str(&bucket, "%Y-%m-%d %H:%M:%S")
                .map_err(|e| StoreError::Unavailable(format!("bad bucket {}: {}", bucket, e)))?;
            let mut record = Record::new(naive.and_utc().timestamp_millis(), BTreeMap::new());
            for (i, col) in cols.iter().enumerate() {
                if let Some(avg) = row.get::<_, Option<f64>>(i + 1)? {
                    record.values.insert((*col).clone(), avg);
                }
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Replace one bucket's raw rows with a single averaged record.
    ///
    /// The condensed record is inserted before the raw rows are deleted, and
    /// both happen in one transaction, so a crash cannot lose the bucket.
    pub fn condense(
        &self,
        source: &str,
        bucket_ms: i64,
        values: &BTreeMap<String, f64>,
        raw_ids: &[i64],
    ) -> Result<(), StoreError> {
        let key = source_key(source);
        let mut guard = self.conn.lock().unwrap();
        let tx = guard.transaction()?;

        Self::ensure_source_table(&tx, &key)?;
        Self::ensure_metric_columns(&tx, &key, values.keys(), std::iter::empty())?;

        let mut cols = vec!["time".to_string()];
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(bucket_ms)];
        for (name, value) in values {
            cols.push(quote_ident(name));
            params.push(Box::new(*value));
        }
        let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("?{}", i)).collect();
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
                quote_ident(&key),
                cols.join(", "),
                placeholders.join(", ")
            ),
            params_from_iter(params.iter().map(|p| p.as_ref())),
        )?;

        // The bucket-start insert above may have replaced a raw row that
        // shared its timestamp; deleting its id again is a no-op.
        let id_params: Vec<String> = (1..=raw_ids.len()).map(|i| format!("?{}", i)).collect();
        if !raw_ids.is_empty() {
            tx.execute(
                &format!(
                    "DELETE FROM {} WHERE id IN ({})",
                    quote_ident(&key),
                    id_params.join(", ")
                ),
                params_from_iter(raw_ids.iter()),
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// All metadata entries for a source.
    pub fn meta_entries(&self, source: &str) -> Result<Vec<MetaEntry>, StoreError> {
        self.meta_query(source, "SELECT h, name, unit FROM {} ORDER BY name", &[])
    }

    /// Metadata entries matching an explicit name list.
    pub fn meta_by_names(
        &self,
        source: &str,
        names: &[String],
    ) -> Result<Vec<MetaEntry>, StoreError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "SELECT h, name, unit FROM {{}} WHERE name IN ({}) ORDER BY name",
            placeholders.join(", ")
        );
        self.meta_query(source, &sql, names)
    }

    /// Metadata entries with a given unit.
    pub fn meta_by_unit(&self, source: &str, unit: &str) -> Result<Vec<MetaEntry>, StoreError> {
        self.meta_query(
            source,
            "SELECT h, name, unit FROM {} WHERE unit = ?1 ORDER BY name",
            &[unit.to_string()],
        )
    }

    fn meta_query(
        &self,
        source: &str,
        sql_template: &str,
        params: &[String],
    ) -> Result<Vec<MetaEntry>, StoreError> {
        let mkey = meta_key(source);
        let guard = self.conn.lock().unwrap();
        if !Self::table_exists(&guard, &mkey)? {
            return Ok(Vec::new());
        }

        let sql = sql_template.replace("{}", &quote_ident(&mkey));
        let mut stmt = guard.prepare(&sql)?;
        let entries = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                Ok(MetaEntry {
                    handle: row.get(0)?,
                    name: row.get(1)?,
                    unit: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Upsert metadata entries keyed by handle.
    pub fn upsert_meta(&self, source: &str, entries: &[MetaEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mkey = meta_key(source);
        let mut guard = self.conn.lock().unwrap();
        let tx = guard.transaction()?;
        Self::ensure_meta_table(&tx, &mkey)?;

        for entry in entries {
            tx.execute(
                &format!(
                    "INSERT INTO {} (h, name, unit) VALUES (?1, ?2, ?3)
                     ON CONFLICT(h) DO UPDATE SET name = excluded.name, unit = excluded.unit",
                    quote_ident(&mkey)
                ),
                rusqlite::params![entry.handle, entry.name, entry.unit],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Number of stored records for a source.
    pub fn record_count(&self, source: &str) -> Result<usize, StoreError> {
        let key = source_key(source);
        let guard = self.conn.lock().unwrap();
        if !Self::table_exists(&guard, &key)? {
            return Ok(0);
        }
        let count: i64 = guard.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(&key)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
