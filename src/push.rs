//! Per-source fan-out of simplified live updates
//!
//! On each successful poll the ingestion side publishes a reduced point set
//! to whoever subscribed to that source. The hub never buffers for absent
//! subscribers; an update with no listeners is dropped.

use crate::model::Point;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

/// One metric's latest sample, shaped for the live chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushUpdate {
    pub name: String,
    pub data: Vec<Point>,
}

pub struct PushHub {
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<PushUpdate>>>>,
}

impl PushHub {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to one source's updates.
    pub fn subscribe(&self, source: &str) -> broadcast::Receiver<Vec<PushUpdate>> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(source.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish to a source's subscribers; returns how many received it.
    pub fn publish(&self, source: &str, updates: Vec<PushUpdate>) -> usize {
        let channels = self.channels.lock().unwrap();
        match channels.get(source) {
            Some(sender) => sender.send(updates).unwrap_or(0),
            None => 0,
        }
    }
}

impl Default for PushHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(name: &str, x: i64, y: f64) -> PushUpdate {
        PushUpdate {
            name: name.to_string(),
            data: vec![Point { x, y }],
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_only_that_sources_subscribers() {
        let hub = PushHub::new();
        let mut rx = hub.subscribe("meter");
        let mut other = hub.subscribe("other");

        let delivered = hub.publish("meter", vec![update("Total KW", 1, 5.0)]);
        assert_eq!(delivered, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received[0].name, "Total KW");
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let hub = PushHub::new();
        assert_eq!(hub.publish("nobody", vec![update("a", 1, 1.0)]), 0);
    }

    #[test]
    fn test_update_serializes_to_chart_shape() {
        let json = serde_json::to_string(&update("Total KW", 10, 2.5)).unwrap();
        assert_eq!(json, r#"{"name":"Total KW","data":[{"x":10,"y":2.5}]}"#);
    }
}
