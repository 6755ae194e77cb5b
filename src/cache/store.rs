//! Response storage behind an `EventAwareCache`.

use std::sync::RwLock;

use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use time::OffsetDateTime;

use super::config::CacheConfig;
use super::keys::PipelineKey;
use super::lock::{rw_read, rw_write};
use super::validity::Validity;

const SOURCE: &str = "cache::store";

const METRIC_HIT_TOTAL: &str = "eventcache_store_hit_total";
const METRIC_MISS_TOTAL: &str = "eventcache_store_miss_total";
const METRIC_EVICT_TOTAL: &str = "eventcache_store_evict_total";

/// A cached pipeline response.
#[derive(Debug, Clone)]
pub struct CachedPipeline {
    pub content: Bytes,
    pub content_type: Option<String>,
    pub validity: Validity,
    pub stored_at: OffsetDateTime,
}

impl CachedPipeline {
    pub fn new(content: impl Into<Bytes>, validity: Validity) -> Self {
        Self {
            content: content.into(),
            content_type: None,
            validity,
            stored_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Storage the cache keeps its responses in.
pub trait ResponseStore: Send + Sync {
    fn get(&self, key: &PipelineKey) -> Option<CachedPipeline>;

    /// Like `get`, but leaves recency and hit/miss accounting alone.
    fn peek(&self, key: &PipelineKey) -> Option<CachedPipeline>;

    /// Store `entry`, returning the key of an entry evicted to make room.
    fn put(&self, key: PipelineKey, entry: CachedPipeline) -> Option<PipelineKey>;

    fn remove(&self, key: &PipelineKey) -> Option<CachedPipeline>;

    fn contains(&self, key: &PipelineKey) -> bool;

    fn keys(&self) -> Vec<PipelineKey>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self);
}

/// In-memory LRU store.
pub struct MemoryStore {
    entries: RwLock<LruCache<PipelineKey, CachedPipeline>>,
}

impl MemoryStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.capacity_non_zero())),
        }
    }
}

impl ResponseStore for MemoryStore {
    fn get(&self, key: &PipelineKey) -> Option<CachedPipeline> {
        // LRU reads update recency, so this takes the write lock.
        let entry = rw_write(&self.entries, SOURCE, "get").get(key).cloned();
        if entry.is_some() {
            counter!(METRIC_HIT_TOTAL).increment(1);
        } else {
            counter!(METRIC_MISS_TOTAL).increment(1);
        }
        entry
    }

    fn peek(&self, key: &PipelineKey) -> Option<CachedPipeline> {
        rw_read(&self.entries, SOURCE, "peek").peek(key).cloned()
    }

    fn put(&self, key: PipelineKey, entry: CachedPipeline) -> Option<PipelineKey> {
        let evicted = rw_write(&self.entries, SOURCE, "put")
            .push(key.clone(), entry)
            .map(|(evicted_key, _)| evicted_key)
            .filter(|evicted_key| *evicted_key != key);
        if evicted.is_some() {
            counter!(METRIC_EVICT_TOTAL).increment(1);
        }
        evicted
    }

    fn remove(&self, key: &PipelineKey) -> Option<CachedPipeline> {
        rw_write(&self.entries, SOURCE, "remove").pop(key)
    }

    fn contains(&self, key: &PipelineKey) -> bool {
        rw_read(&self.entries, SOURCE, "contains").contains(key)
    }

    fn keys(&self) -> Vec<PipelineKey> {
        rw_read(&self.entries, SOURCE, "keys")
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }
}
