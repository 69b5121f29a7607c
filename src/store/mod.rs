//! Counter and block-marker storage.
//!
//! A store keeps two independent cells per key: a fixed-window counter and a
//! block marker. Both expire on their own. Backends must keep block markers in
//! a namespace disjoint from counters.

mod memory;
mod redis_store;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Longest expiry a store will set. Longer windows and blocks are capped.
pub const MAX_EXPIRY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn capped(duration: Duration) -> Duration {
    duration.min(MAX_EXPIRY)
}

/// Block state of a key as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockStatus {
    pub blocked: bool,
    /// Time until the block marker expires. Zero when not blocked.
    pub remaining: Duration,
}

impl BlockStatus {
    pub fn unblocked() -> Self {
        Self::default()
    }

    pub fn blocked_for(remaining: Duration) -> Self {
        Self {
            blocked: true,
            remaining,
        }
    }
}

/// Storage backend for counters and block markers.
///
/// Implementations are shared between concurrent requests and possibly
/// between gateway instances.
#[async_trait]
pub trait Store: Send + Sync {
    /// Increment the counter for `key` and return the post-increment count.
    ///
    /// When the key is absent or its window has elapsed, the counter restarts
    /// at 1 with a fresh expiry of `window`. This must be atomic per key.
    async fn increment(&self, key: &str, window: Duration) -> Result<u64>;

    /// Mark `key` as blocked for `duration`, replacing any existing block.
    async fn set_blocked(&self, key: &str, duration: Duration) -> Result<()>;

    /// Report whether `key` is blocked and for how much longer.
    async fn is_blocked(&self, key: &str) -> Result<BlockStatus>;
}
