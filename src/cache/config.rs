//! Registry and cache configuration.
//!
//! Resolved from the `[registry]` and `[cache]` tables of `eventcache.toml`.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_BATCH_SIZE: usize = 64;
const DEFAULT_COMPACT_AFTER: usize = 10_000;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;
const DEFAULT_CAPACITY: usize = 1000;
const DEFAULT_QUEUE_LIMIT: usize = 4096;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;

/// When journal records reach the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Every mutation is written before it returns.
    Immediate,
    /// Mutations are buffered and written in batches or by the flusher.
    Batched,
}

/// Persistence settings for an `EventRegistry`.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Store directory. `None` keeps the registry purely in memory.
    pub store_dir: Option<PathBuf>,
    pub flush_mode: FlushMode,
    /// Pending records that trigger an inline flush in batched mode.
    pub batch_size: usize,
    /// Journal records after which a checkpoint rewrites the snapshot.
    pub compact_after: usize,
    /// Period of the background flusher.
    pub flush_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            store_dir: None,
            flush_mode: FlushMode::Immediate,
            batch_size: DEFAULT_BATCH_SIZE,
            compact_after: DEFAULT_COMPACT_AFTER,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
        }
    }
}

impl RegistryConfig {
    /// Persistent configuration rooted at `dir`, other values defaulted.
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: Some(dir.into()),
            ..Default::default()
        }
    }

    pub fn is_batched(&self) -> bool {
        self.flush_mode == FlushMode::Batched
    }

    pub fn batch_size_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.batch_size).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn compact_after_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.compact_after).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

impl From<&crate::config::RegistrySettings> for RegistryConfig {
    fn from(settings: &crate::config::RegistrySettings) -> Self {
        Self {
            store_dir: settings.store_dir.clone(),
            flush_mode: settings.flush_mode,
            batch_size: settings.batch_size.get(),
            compact_after: settings.compact_after.get(),
            flush_interval_ms: settings.flush_interval.as_millis() as u64,
        }
    }
}

/// Settings for the reference `EventAwareCache`.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entries held by the memory store.
    pub capacity: usize,
    /// Maximum pending events in the invalidation queue.
    pub queue_limit: usize,
    /// Maximum events per consumption batch.
    pub consume_batch_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            queue_limit: DEFAULT_QUEUE_LIMIT,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            capacity: settings.capacity.get(),
            queue_limit: settings.queue_limit.get(),
            consume_batch_limit: settings.consume_batch_limit.get(),
        }
    }
}

impl CacheConfig {
    /// Returns the capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn queue_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.queue_limit).unwrap_or(NonZeroUsize::MIN)
    }
}
