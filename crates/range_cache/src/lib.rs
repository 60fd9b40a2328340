//! Read-through cache for rank windows of the message log.
//!
//! The cache is advisory. Entries are never invalidated on write, so only
//! windows that sit entirely below the live tail are admitted, and every
//! entry expires after a fixed time-to-live.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use moka::future::Cache;
use shared::domain::Message;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub start: u64,
    pub end: u64,
}

impl WindowKey {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// A window is cacheable when its last rank is strictly older than the
    /// newest message, so appends cannot change what it selects.
    pub fn is_below_tail(&self, total_messages: u64) -> bool {
        self.end < total_messages
    }

    /// Number of ranks the window selects; a start of 0 counts from rank 1.
    pub fn span(&self) -> u64 {
        (self.end + 1).saturating_sub(self.start.max(1))
    }
}

#[async_trait]
pub trait RangeCache: Send + Sync {
    async fn get(&self, key: WindowKey) -> Result<Option<Vec<Message>>>;
    async fn put(&self, key: WindowKey, messages: Vec<Message>) -> Result<()>;
}

/// Cache that never holds anything; every read goes to the store.
pub struct NoopRangeCache;

#[async_trait]
impl RangeCache for NoopRangeCache {
    async fn get(&self, _key: WindowKey) -> Result<Option<Vec<Message>>> {
        Ok(None)
    }

    async fn put(&self, _key: WindowKey, _messages: Vec<Message>) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryRangeCache {
    cache: Cache<WindowKey, Arc<Vec<Message>>>,
}

impl MemoryRangeCache {
    pub fn new(max_windows: u64, time_to_live: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_windows)
            .time_to_live(time_to_live)
            .build();
        Self { cache }
    }

    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl RangeCache for MemoryRangeCache {
    async fn get(&self, key: WindowKey) -> Result<Option<Vec<Message>>> {
        let hit = self.cache.get(&key).await;
        debug!(start = key.start, end = key.end, hit = hit.is_some(), "range cache lookup");
        Ok(hit.map(|messages| messages.as_ref().clone()))
    }

    async fn put(&self, key: WindowKey, messages: Vec<Message>) -> Result<()> {
        self.cache.insert(key, Arc::new(messages)).await;
        Ok(())
    }
}
