//! Event registry.
//!
//! Tracks which cached pipeline keys must be invalidated when an event fires,
//! and optionally keeps that relation durable across restarts.

use std::collections::HashSet;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use tracing::{debug, error, info, warn};

use super::config::RegistryConfig;
use super::index::Index;
use super::keys::{Event, PipelineKey, RegistryItem};
use super::lock::{mutex_lock, mutex_try_lock, rw_read, rw_write};
use super::persist::{self, JournalRecord, PersistError, RecoveryOutcome, StoreWriter};

const SOURCE: &str = "cache::registry";

const METRIC_REGISTER_TOTAL: &str = "eventcache_registry_register_total";
const METRIC_REMOVE_TOTAL: &str = "eventcache_registry_remove_total";
const METRIC_KEYS: &str = "eventcache_registry_keys";
const METRIC_PERSIST_ERROR_TOTAL: &str = "eventcache_persist_error_total";
const METRIC_RECOVERY_FAILED_TOTAL: &str = "eventcache_recovery_failed_total";
const METRIC_RECOVERY_MS: &str = "eventcache_recovery_ms";
const METRIC_FLUSH_MS: &str = "eventcache_flush_ms";
const METRIC_CHECKPOINT_MS: &str = "eventcache_checkpoint_ms";

struct Persistence<E, K> {
    config: RegistryConfig,
    /// Records not yet written, in mutation order. Only pushed while the
    /// index write lock is held.
    pending: Mutex<Vec<JournalRecord<E, K>>>,
    writer: Mutex<StoreWriter>,
    degraded: AtomicBool,
    closed: AtomicBool,
}

/// Many-to-many index between invalidation events and cache keys.
///
/// Both directions live behind one `RwLock`, so every operation, `clear`
/// included, is atomic with respect to every other. The type is `Send + Sync`
/// and is meant to be shared as `Arc<EventRegistry>` between the cache and
/// request threads.
///
/// Queries and mutations never fail and never wait on disk. Only startup
/// recovery can fail, and it reports through [`was_recovery_successful`].
///
/// [`was_recovery_successful`]: EventRegistry::was_recovery_successful
pub struct EventRegistry<E: RegistryItem = Event, K: RegistryItem = PipelineKey> {
    index: RwLock<Index<E, K>>,
    persistence: Option<Persistence<E, K>>,
    recovery: RecoveryOutcome,
}

impl<E: RegistryItem, K: RegistryItem> EventRegistry<E, K> {
    /// A registry without a store. Recovery reports success: nothing it could
    /// have known about outlived the previous process.
    pub fn in_memory() -> Self {
        Self {
            index: RwLock::new(Index::default()),
            persistence: None,
            recovery: RecoveryOutcome::NotConfigured,
        }
    }

    /// Open the registry described by `config`, reloading any persisted
    /// relation before returning.
    ///
    /// Never fails. A defective store yields an empty registry whose
    /// [`was_recovery_successful`](Self::was_recovery_successful) is false; an
    /// unwritable store additionally leaves durability degraded.
    pub fn open(config: &RegistryConfig) -> Self {
        let Some(dir) = config.store_dir.clone() else {
            return Self::in_memory();
        };

        let started = Instant::now();
        let mut writer = StoreWriter::detached(dir.clone(), config.is_batched());

        let (index, recovery, session) = match persist::recover::<E, K>(&dir) {
            Ok(recovered) => {
                let outcome = RecoveryOutcome::Recovered {
                    events: recovered.index.event_count(),
                    keys: recovered.index.key_count(),
                    generation: recovered.generation,
                };
                info!(
                    store_dir = %dir.display(),
                    outcome = ?outcome,
                    "Registry recovered"
                );
                let next = recovered.generation + 1;
                let session = persist::encode_snapshot(next, &recovered.index)
                    .and_then(|bytes| writer.resume(next, &bytes));
                (recovered.index, outcome, session)
            }
            Err(failure) => {
                counter!(METRIC_RECOVERY_FAILED_TOTAL).increment(1);
                warn!(
                    store_dir = %dir.display(),
                    reason = %failure,
                    "Registry recovery failed; starting empty, event-dependent cache entries are suspect"
                );
                let index = Index::default();
                let session =
                    persist::encode_snapshot(1, &index).and_then(|bytes| writer.reset(&bytes));
                (index, RecoveryOutcome::Failed(failure), session)
            }
        };

        histogram!(METRIC_RECOVERY_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        let degraded = match session {
            Ok(()) => false,
            Err(err) => {
                counter!(METRIC_PERSIST_ERROR_TOTAL).increment(1);
                error!(
                    store_dir = %dir.display(),
                    error = %err,
                    "Failed to start registry store; continuing without durability"
                );
                writer.abandon();
                true
            }
        };

        gauge!(METRIC_KEYS).set(index.key_count() as f64);

        Self {
            index: RwLock::new(index),
            persistence: Some(Persistence {
                config: config.clone(),
                pending: Mutex::new(Vec::new()),
                writer: Mutex::new(writer),
                degraded: AtomicBool::new(degraded),
                closed: AtomicBool::new(false),
            }),
            recovery,
        }
    }

    /// Associate `key` with `event`. Registering a present pair changes nothing.
    pub fn register(&self, event: E, key: K) {
        self.register_all([event], key);
    }

    /// Associate `key` with every event in `events` under a single lock, so
    /// no reader sees the key with only part of its events.
    pub fn register_all(&self, events: impl IntoIterator<Item = E>, key: K) {
        let inserted = {
            let mut index = rw_write(&self.index, SOURCE, "register");
            let journaling = self.journaling();
            let mut inserted = 0u64;

            for event in events {
                let record = journaling.then(|| JournalRecord::Register {
                    event: event.clone(),
                    key: key.clone(),
                });
                if index.insert(event, key.clone()) {
                    inserted += 1;
                    if let Some(record) = record {
                        self.push(record);
                    }
                }
            }

            if inserted > 0 {
                gauge!(METRIC_KEYS).set(index.key_count() as f64);
            }
            inserted
        };

        if inserted > 0 {
            counter!(METRIC_REGISTER_TOTAL).increment(inserted);
            self.after_mutation();
        }
    }

    /// Forget every registration of `key`. Unknown keys are ignored.
    pub fn remove_key(&self, key: &K) {
        let removed = {
            let mut index = rw_write(&self.index, SOURCE, "remove_key");
            let removed = index.remove_key(key);
            if removed > 0 {
                if self.journaling() {
                    self.push(JournalRecord::RemoveKey { key: key.clone() });
                }
                gauge!(METRIC_KEYS).set(index.key_count() as f64);
            }
            removed
        };

        if removed > 0 {
            counter!(METRIC_REMOVE_TOTAL).increment(1);
            debug!(key = ?key, pairs = removed, "Registry key removed");
            self.after_mutation();
        }
    }

    /// Keys registered against `event`, copied out. Empty when none.
    pub fn keys_for_event(&self, event: &E) -> HashSet<K> {
        rw_read(&self.index, SOURCE, "keys_for_event").keys_for_event(event)
    }

    /// Events `key` is registered against, copied out. Empty when none.
    pub fn events_for_key(&self, key: &K) -> HashSet<E> {
        rw_read(&self.index, SOURCE, "events_for_key").events_for_key(key)
    }

    /// Every key with at least one registration, copied out.
    pub fn all_keys(&self) -> HashSet<K> {
        rw_read(&self.index, SOURCE, "all_keys").all_keys()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        rw_read(&self.index, SOURCE, "contains_key").contains_key(key)
    }

    /// Copy of the whole relation, one entry per event.
    pub fn entries(&self) -> Vec<(E, HashSet<K>)> {
        rw_read(&self.index, SOURCE, "entries")
            .entries()
            .map(|(event, keys)| (event.clone(), keys.clone()))
            .collect()
    }

    /// Atomically empty the relation. The recovery outcome is unaffected.
    pub fn clear(&self) {
        let removed = {
            let mut index = rw_write(&self.index, SOURCE, "clear");
            let removed = index.key_count();
            index.clear();
            if self.journaling() {
                self.push(JournalRecord::Clear);
            }
            gauge!(METRIC_KEYS).set(0.0);
            removed
        };

        info!(keys = removed, "Registry cleared");
        self.after_mutation();
    }

    pub fn event_count(&self) -> usize {
        rw_read(&self.index, SOURCE, "event_count").event_count()
    }

    pub fn key_count(&self) -> usize {
        rw_read(&self.index, SOURCE, "key_count").key_count()
    }

    pub fn is_empty(&self) -> bool {
        rw_read(&self.index, SOURCE, "is_empty").is_empty()
    }

    /// Whether the startup reload succeeded. Fixed for the registry's life.
    ///
    /// When false, the cache must treat every entry whose validity depends on
    /// events as stale: invalidations registered before the restart are gone.
    pub fn was_recovery_successful(&self) -> bool {
        self.recovery.is_successful()
    }

    pub fn recovery(&self) -> &RecoveryOutcome {
        &self.recovery
    }

    /// True once a store write has failed and durability was given up. A
    /// successful [`checkpoint`](Self::checkpoint) restores it.
    pub fn durability_degraded(&self) -> bool {
        self.persistence
            .as_ref()
            .is_some_and(|p| p.degraded.load(Ordering::Acquire))
    }

    pub fn is_persistent(&self) -> bool {
        self.persistence.is_some()
    }

    /// Write pending journal records now.
    pub fn flush(&self) -> Result<(), PersistError> {
        let Some(p) = &self.persistence else {
            return Ok(());
        };
        let mut writer = mutex_lock(&p.writer, SOURCE, "flush");
        if p.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.flush_locked(p, &mut writer)
    }

    /// Write a full snapshot and start a new journal generation.
    pub fn checkpoint(&self) -> Result<(), PersistError> {
        let Some(p) = &self.persistence else {
            return Ok(());
        };
        let mut writer = mutex_lock(&p.writer, SOURCE, "checkpoint");
        if p.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.checkpoint_locked(p, &mut writer)
    }

    /// Final checkpoint plus clean-shutdown marker. Idempotent; also run on
    /// drop. Afterwards the registry keeps working in memory only.
    pub fn close(&self) -> Result<(), PersistError> {
        let Some(p) = &self.persistence else {
            return Ok(());
        };
        let mut writer = mutex_lock(&p.writer, SOURCE, "close");
        if p.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.checkpoint_locked(p, &mut writer)?;
        if let Err(err) = writer.close() {
            self.degrade(p, &mut writer, &err);
            return Err(err);
        }

        info!(
            store_dir = %writer.dir().display(),
            generation = writer.generation(),
            "Registry closed"
        );
        Ok(())
    }

    fn journaling(&self) -> bool {
        self.persistence
            .as_ref()
            .is_some_and(|p| !p.closed.load(Ordering::Acquire))
    }

    fn push(&self, record: JournalRecord<E, K>) {
        if let Some(p) = &self.persistence {
            mutex_lock(&p.pending, SOURCE, "push").push(record);
        }
    }

    /// Runs outside the index lock after every mutation.
    fn after_mutation(&self) {
        let Some(p) = &self.persistence else {
            return;
        };
        if p.closed.load(Ordering::Acquire) {
            return;
        }

        let writer = if p.config.is_batched() {
            let pending = mutex_lock(&p.pending, SOURCE, "after_mutation").len();
            if pending < p.config.batch_size_non_zero().get() {
                return;
            }
            // Another thread is already flushing; it or the flusher picks these up.
            mutex_try_lock(&p.writer, SOURCE, "flush.batched")
        } else {
            Some(mutex_lock(&p.writer, SOURCE, "flush.immediate"))
        };

        if let Some(mut writer) = writer {
            // Failures are logged and counted in `degrade`; callers never see them.
            let _ = self.flush_locked(p, &mut writer);
        }
    }

    fn flush_locked(
        &self,
        p: &Persistence<E, K>,
        writer: &mut StoreWriter,
    ) -> Result<(), PersistError> {
        let records = mem::take(&mut *mutex_lock(&p.pending, SOURCE, "flush.take"));
        if records.is_empty() || writer.is_detached() {
            return Ok(());
        }

        let started = Instant::now();
        if let Err(err) = writer.append(&records) {
            self.degrade(p, writer, &err);
            return Err(err);
        }
        histogram!(METRIC_FLUSH_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        if writer.appended() >= p.config.compact_after_non_zero().get() {
            self.checkpoint_locked(p, writer)?;
        }
        Ok(())
    }

    fn checkpoint_locked(
        &self,
        p: &Persistence<E, K>,
        writer: &mut StoreWriter,
    ) -> Result<(), PersistError> {
        let started = Instant::now();
        let generation = writer.generation() + 1;

        let snapshot = {
            let index = rw_read(&self.index, SOURCE, "checkpoint");
            let bytes = persist::encode_snapshot(generation, &index)?;
            // Everything pending is already reflected in the snapshot.
            mutex_lock(&p.pending, SOURCE, "checkpoint.discard").clear();
            bytes
        };

        if let Err(err) = writer.rotate(generation, &snapshot) {
            self.degrade(p, writer, &err);
            return Err(err);
        }
        p.degraded.store(false, Ordering::Release);

        histogram!(METRIC_CHECKPOINT_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        debug!(
            generation,
            bytes = snapshot.len(),
            "Registry checkpoint written"
        );
        Ok(())
    }

    fn degrade(&self, p: &Persistence<E, K>, writer: &mut StoreWriter, err: &PersistError) {
        counter!(METRIC_PERSIST_ERROR_TOTAL).increment(1);
        error!(
            store_dir = %writer.dir().display(),
            error = %err,
            "Registry persistence failed; in-memory index stays authoritative, store abandoned"
        );
        writer.abandon();
        p.degraded.store(true, Ordering::Release);
    }
}

impl<E: RegistryItem, K: RegistryItem> Default for EventRegistry<E, K> {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl<E: RegistryItem, K: RegistryItem> Drop for EventRegistry<E, K> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "Registry close on drop failed");
        }
    }
}
