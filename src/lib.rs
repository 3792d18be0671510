//! metergrid: a telemetry store for utility meters
//!
//! Readings arrive by live polling or file upload, land in SQLite as one
//! record per (source, timestamp), and come back out as chart series, merged
//! CSV exports, or scalar differences. Old raw history is compacted into
//! minute averages in the background.

pub mod compact;
pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod push;
pub mod query;
pub mod store;

pub use compact::{compact_range, CompactionReport};
pub use config::{load_labels, load_sources, RuntimeConfig, SourceConfig};
pub use error::{QueryError, StoreError};
pub use ingest::{
    poll_once, upload, JsonFileFetcher, PollScheduler, Snapshot, SnapshotFetcher, SnapshotItem,
};
pub use model::{MetaEntry, MetricSelection, Point, PointSeries, QueryResult, Record, ResultFormat};
pub use push::{PushHub, PushUpdate};
pub use query::{CsvWindow, QueryApi};
pub use store::MeterStore;
