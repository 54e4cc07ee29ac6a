use std::sync::Arc;
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use crate::connection::closed_signal;

/// Branch ids of transactions recently seen on a connection, so that retransmissions can be
///  recognized. Entries expire after a fixed time, removal is done periodically by
///  [run_janitor].
pub struct BranchCache {
    ttl: Duration,
    entries: Mutex<FxHashMap<String, Instant>>,
}

impl BranchCache {
    pub fn new(ttl: Duration) -> BranchCache {
        BranchCache {
            ttl,
            entries: Default::default(),
        }
    }

    /// Records `branch` as seen now, refreshing the timestamp if it was seen before
    pub async fn remember(&self, branch: &str) {
        self.entries.lock().await
            .insert(branch.to_string(), Instant::now());
    }

    /// NB: This reports entries that are past their ttl but were not yet removed by the janitor
    pub async fn contains(&self, branch: &str) -> bool {
        self.entries.lock().await
            .contains_key(branch)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await
            .len()
    }

    /// Removes all entries older than the ttl, returning the number of removed entries
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let len_before = entries.len();
        entries.retain(|_, seen| now.saturating_duration_since(*seen) <= self.ttl);
        len_before - entries.len()
    }
}

/// Periodically evicts expired entries from `cache` until the connection is closed
pub async fn run_janitor(cache: Arc<BranchCache>, interval: Duration, closed: watch::Receiver<bool>) {
    loop {
        select! {
            _ = sleep(interval) => {}
            _ = closed_signal(closed.clone()) => break,
        }

        let num_evicted = cache.evict_expired().await;
        if num_evicted > 0 {
            trace!("evicted {} expired branches", num_evicted);
        }
    }
    debug!("branch janitor stopped");
}
