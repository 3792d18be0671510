//! Live polling of a meter snapshot
//!
//! The fetcher is a seam: the actual device protocols live outside this
//! crate. A snapshot is only stored when its reported save time is strictly
//! newer than the newest stored record, which guards against duplicate and
//! out-of-order pushes from the device side.

use crate::error::StoreError;
use crate::model::{MetaEntry, Point};
use crate::push::{PushHub, PushUpdate};
use crate::store::MeterStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One metric reading within a device snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotItem {
    pub handle: String,
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
    pub value: f64,
}

/// A device snapshot: the device's own save time plus its readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub saved_at_ms: i64,
    pub items: Vec<SnapshotItem>,
}

#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Snapshot, Box<dyn std::error::Error + Send + Sync>>;
}

/// Fetcher for devices that export their current snapshot as a JSON file.
/// Each tick rereads the file; the monotonicity guard in [`poll_once`]
/// deduplicates the ticks where the device has not written a new snapshot.
pub struct JsonFileFetcher {
    path: PathBuf,
}

impl JsonFileFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotFetcher for JsonFileFetcher {
    async fn fetch(&self) -> Result<Snapshot, Box<dyn std::error::Error + Send + Sync>> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let snapshot: Snapshot = serde_json::from_str(&raw)?;
        Ok(snapshot)
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct PollOutcome {
    pub stored: bool,
    pub metrics: usize,
    pub subscribers: usize,
}

/// Fetch one snapshot and store it, honoring the monotonicity guard.
///
/// Fetch failures are logged and skipped (the next tick retries naturally);
/// store failures are fatal to this poll.
pub async fn poll_once(
    store: &MeterStore,
    hub: &PushHub,
    source: &str,
    fetcher: &dyn SnapshotFetcher,
    desired: Option<&[String]>,
) -> Result<PollOutcome, StoreError> {
    let snapshot = match fetcher.fetch().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            log::warn!("polling error for {}: {}", source, e);
            return Ok(PollOutcome::default());
        }
    };

    if let Some(latest) = store.latest(source)? {
        if snapshot.saved_at_ms <= latest.time {
            log::debug!(
                "{}: snapshot at {} not newer than stored {}, skipping",
                source,
                snapshot.saved_at_ms,
                latest.time
            );
            return Ok(PollOutcome::default());
        }
    }

    let mut values = BTreeMap::new();
    for item in &snapshot.items {
        if !item.name.is_empty() && item.value.is_finite() {
            values.insert(item.name.clone(), item.value);
        }
    }

    if values.is_empty() {
        log::warn!("No data in {}", source);
        return Ok(PollOutcome::default());
    }

    store.upsert_record(source, snapshot.saved_at_ms, &values)?;

    let meta: Vec<MetaEntry> = snapshot
        .items
        .iter()
        .filter(|item| !item.handle.is_empty() && !item.name.is_empty())
        .map(|item| MetaEntry {
            handle: item.handle.clone(),
            name: item.name.clone(),
            unit: item.unit.clone(),
        })
        .collect();
    store.upsert_meta(source, &meta)?;

    log::info!("{} @ {}", source, snapshot.saved_at_ms);

    let x = snapshot.saved_at_ms / 1000;
    let updates: Vec<PushUpdate> = values
        .iter()
        .filter(|(name, _)| match desired {
            Some(wanted) => wanted.iter().any(|w| w == *name),
            None => true,
        })
        .map(|(name, value)| PushUpdate {
            name: name.clone(),
            data: vec![Point { x, y: *value }],
        })
        .collect();
    let subscribers = hub.publish(source, updates);

    Ok(PollOutcome {
        stored: true,
        metrics: values.len(),
        subscribers,
    })
}
