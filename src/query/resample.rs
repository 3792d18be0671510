//! Resampling: time-ordered records → named point series
//!
//! Short windows pass records straight through. Long windows are re-bucketed
//! on calendar boundaries in the presentation zone: truncation resets calendar
//! fields instead of subtracting fixed durations, because the zone observes
//! daylight saving and a fixed-duration bucket would drift an hour across a
//! transition. Bucket averages are scaled by a duration multiplier so that
//! averaged instantaneous power becomes integrated energy per bucket.

use crate::model::{Point, PointSeries, Record, ENERGY_UNIT, POWER_UNIT};
use chrono::{DateTime, Datelike, Duration, TimeZone};
use chrono_tz::Tz;
use std::collections::{BTreeMap, HashMap};

const WEEK4_MS: i64 = 4 * 7 * 24 * 60 * 60 * 1000;
const MONTH6_MS: i64 = 183 * 24 * 60 * 60 * 1000;
const YEAR_MS: i64 = 365 * 24 * 60 * 60 * 1000;

/// Calendar bucket width for long spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    /// Duration multiplier turning an averaged instantaneous quantity into an
    /// integrated per-bucket quantity: hours per day, composed with days per
    /// week and a nominal 30-day month.
    pub fn dt(&self) -> f64 {
        match self {
            Granularity::Day => 24.0,
            Granularity::Week => 24.0 * 7.0,
            Granularity::Month => 24.0 * 30.0,
        }
    }
}

/// Bucket width for a requested span; `None` means pass-through.
pub fn granularity_for(duration_ms: i64) -> Option<Granularity> {
    if duration_ms > YEAR_MS {
        Some(Granularity::Month)
    } else if duration_ms > MONTH6_MS {
        Some(Granularity::Week)
    } else if duration_ms > WEEK4_MS {
        Some(Granularity::Day)
    } else {
        None
    }
}

/// Truncate an instant to its bucket start by calendar field reset in `zone`.
pub fn truncate_to_bucket(time_ms: i64, zone: Tz, granularity: Granularity) -> Option<DateTime<Tz>> {
    let local = zone.timestamp_millis_opt(time_ms).single()?;
    let date = match granularity {
        Granularity::Day => local.date_naive(),
        Granularity::Week => {
            let days_back = local.weekday().num_days_from_monday() as i64;
            local.date_naive() - Duration::days(days_back)
        }
        Granularity::Month => local.date_naive().with_day(1)?,
    };
    let midnight = date.and_hms_opt(0, 0, 0)?;
    // A zone gap at midnight (some zones spring forward over 00:00) maps the
    // bucket start to the first valid instant after it.
    match zone.from_local_datetime(&midnight) {
        chrono::LocalResult::Single(dt) => Some(dt),
        chrono::LocalResult::Ambiguous(earliest, _) => Some(earliest),
        chrono::LocalResult::None => {
            let after = midnight + Duration::hours(1);
            zone.from_local_datetime(&after).earliest()
        }
    }
}

struct BucketAccumulator {
    start: DateTime<Tz>,
    sums: BTreeMap<String, f64>,
    count: u32,
}

impl BucketAccumulator {
    fn open(start: DateTime<Tz>, record: &Record) -> Self {
        Self {
            start,
            sums: record.values.clone(),
            count: 1,
        }
    }

    fn add(&mut self, record: &Record) {
        for (name, sum) in self.sums.iter_mut() {
            match record.values.get(name) {
                Some(value) if value.is_finite() => *sum += value,
                Some(value) => {
                    log::warn!(
                        "{}: dropping non-finite sample {} = {}",
                        self.start,
                        name,
                        value
                    );
                }
                None => {
                    log::debug!("{}: no sample for {} in record", self.start, name);
                }
            }
        }
        self.count += 1;
    }

    fn flush(&self, dt: f64, map: &mut BTreeMap<String, Vec<Point>>) {
        let x = self.start.timestamp();
        for (name, sum) in &self.sums {
            let y = sum / self.count as f64 * dt;
            if !y.is_finite() {
                log::warn!("{}: dropping non-finite bucket value for {}", self.start, name);
                continue;
            }
            map.entry(name.clone()).or_default().push(Point { x, y });
        }
    }

    /// Start the next bucket. The column set stays fixed: the metrics seen in
    /// the very first record define the series for the whole stream.
    fn reopen(&mut self, start: DateTime<Tz>, record: &Record) {
        for (name, sum) in self.sums.iter_mut() {
            *sum = match record.values.get(name) {
                Some(value) if value.is_finite() => *value,
                _ => 0.0,
            };
        }
        self.start = start;
        self.count = 1;
    }
}

/// Reduce stage: a time-ascending record stream into one point series per
/// metric. `units` is consumed (and rewritten in bucketed mode) to label each
/// series; `labels` maps metric ids to display names.
pub fn to_series(
    records: &[Record],
    duration_ms: i64,
    units: &BTreeMap<String, String>,
    labels: &HashMap<String, String>,
    zone: Tz,
) -> Vec<PointSeries> {
    let granularity = granularity_for(duration_ms);
    let mut map: BTreeMap<String, Vec<Point>> = BTreeMap::new();

    match granularity {
        None => {
            for record in records {
                let x = record.time / 1000;
                for (name, value) in &record.values {
                    map.entry(name.clone())
                        .or_default()
                        .push(Point { x, y: *value });
                }
            }
        }
        Some(granularity) => {
            let dt = granularity.dt();
            let mut accumulator: Option<BucketAccumulator> = None;

            for record in records {
                let bucket = match truncate_to_bucket(record.time, zone, granularity) {
                    Some(bucket) => bucket,
                    None => {
                        log::warn!("skipping record with untruncatable time {}", record.time);
                        continue;
                    }
                };

                match accumulator.as_mut() {
                    None => accumulator = Some(BucketAccumulator::open(bucket, record)),
                    Some(acc) if acc.start == bucket => acc.add(record),
                    Some(acc) => {
                        acc.flush(dt, &mut map);
                        acc.reopen(bucket, record);
                    }
                }
            }

            // a stream ending mid-bucket still emits its last partial bucket
            if let Some(acc) = accumulator {
                acc.flush(dt, &mut map);
            }
        }
    }

    let rewrite_units = granularity.is_some();
    map.into_iter()
        .map(|(id, data)| {
            let unit = units.get(&id).map(|u| {
                if rewrite_units && u == POWER_UNIT {
                    ENERGY_UNIT.to_string()
                } else {
                    u.clone()
                }
            });
            let name = labels.get(&id).cloned().unwrap_or_else(|| id.clone());
            PointSeries {
                name,
                id,
                unit,
                data,
            }
        })
        .collect()
}

/// Epoch milliseconds of an instant in a zone, for tests and callers that
/// build windows from calendar dates.
pub fn zoned_ms(zone: Tz, y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> Option<i64> {
    zone.with_ymd_and_hms(y, mo, d, h, mi, s)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}
