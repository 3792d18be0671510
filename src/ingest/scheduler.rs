//! Per-source polling tasks
//!
//! Each source gets one tokio task ticking at its configured interval. Tasks
//! are tracked by source name so a reconfigured source replaces its old task
//! instead of doubling up, and every task can be cancelled explicitly.

use super::poll::{poll_once, SnapshotFetcher};
use crate::config::SourceConfig;
use crate::push::PushHub;
use crate::store::MeterStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct PollScheduler {
    tasks: HashMap<String, JoinHandle<()>>,
}

impl PollScheduler {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Start (or restart) polling a source at its configured interval.
    pub fn start(
        &mut self,
        store: Arc<MeterStore>,
        hub: Arc<PushHub>,
        cfg: SourceConfig,
        fetcher: Arc<dyn SnapshotFetcher>,
    ) {
        if let Some(existing) = self.tasks.remove(&cfg.source) {
            log::info!("restarting poller for {}", cfg.source);
            existing.abort();
        }

        let source = cfg.source.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(cfg.interval_secs));
            loop {
                ticker.tick().await;
                let result = poll_once(
                    &store,
                    &hub,
                    &cfg.source,
                    fetcher.as_ref(),
                    cfg.desired.as_deref(),
                )
                .await;
                if let Err(e) = result {
                    log::error!("poll failed for {}: {}", cfg.source, e);
                }
            }
        });
        self.tasks.insert(source, handle);
    }

    /// Cancel one source's poller. Returns whether a task was running.
    pub fn stop(&mut self, source: &str) -> bool {
        match self.tasks.remove(source) {
            Some(handle) => {
                handle.abort();
                log::info!("stopped poller for {}", source);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&mut self) {
        for (source, handle) in self.tasks.drain() {
            handle.abort();
            log::info!("stopped poller for {}", source);
        }
    }

    pub fn is_running(&self, source: &str) -> bool {
        self.tasks
            .get(source)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Default for PollScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}
