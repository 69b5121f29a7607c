//! In-process store backed by concurrent hash maps.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{capped, BlockStatus, Store};
use crate::error::Result;

/// A fixed-window counter anchored at its first increment.
#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u64,
    expires_at: Instant,
}

impl WindowCounter {
    fn start(now: Instant, window: Duration) -> Self {
        Self {
            count: 1,
            expires_at: now + capped(window),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// A store that keeps counters and block markers in memory.
///
/// Increments run under the map's per-key entry lock, which makes
/// increment-with-expire atomic for a single process. Counters and block
/// markers live in separate maps. Expired entries are ignored on read and
/// reclaimed by [`MemoryStore::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: DashMap<String, WindowCounter>,
    blocks: DashMap<String, Instant>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every counter and block marker that has expired.
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len() + self.blocks.len();

        self.counters.retain(|_, counter| !counter.is_expired(now));
        self.blocks.retain(|_, expires_at| *expires_at > now);

        before.saturating_sub(self.counters.len() + self.blocks.len())
    }

    /// Periodically purge expired entries until the returned task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let purged = self.purge_expired();
                if purged > 0 {
                    debug!(purged = purged, "Purged expired store entries");
                }
            }
        })
    }

    /// Current count for `key`, or `None` if absent or expired.
    pub fn current_count(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.counters
            .get(key)
            .filter(|counter| !counter.is_expired(now))
            .map(|counter| counter.count)
    }

    /// Number of counters held, including expired ones not yet purged.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Number of block markers held, including expired ones not yet purged.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64> {
        let now = Instant::now();

        let count = match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let counter = occupied.get_mut();
                if counter.is_expired(now) {
                    *counter = WindowCounter::start(now, window);
                } else {
                    counter.count += 1;
                }
                counter.count
            }
            Entry::Vacant(vacant) => {
                vacant.insert(WindowCounter::start(now, window));
                1
            }
        };

        trace!(key = %key, count = count, "Incremented counter");
        Ok(count)
    }

    async fn set_blocked(&self, key: &str, duration: Duration) -> Result<()> {
        self.blocks
            .insert(key.to_string(), Instant::now() + capped(duration));
        Ok(())
    }

    async fn is_blocked(&self, key: &str) -> Result<BlockStatus> {
        let now = Instant::now();

        let status = match self.blocks.get(key) {
            Some(expires_at) if *expires_at > now => BlockStatus::blocked_for(*expires_at - now),
            _ => BlockStatus::unblocked(),
        };
        Ok(status)
    }
}
