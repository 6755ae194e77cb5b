//! Event-aware cache.
//!
//! Stores pipeline responses, registers their events, and evicts them when
//! those events fire.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use metrics::{counter, histogram};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::config::CacheConfig;
use super::events::InvalidationQueue;
use super::keys::{Event, PipelineKey};
use super::lock::mutex_lock;
use super::planner::InvalidationPlan;
use super::registry::EventRegistry;
use super::store::{CachedPipeline, ResponseStore};
use super::validity::Validity;

const SOURCE: &str = "cache::consumer";

const METRIC_INVALIDATED_TOTAL: &str = "eventcache_invalidated_keys_total";
const METRIC_CONSUME_MS: &str = "eventcache_consume_ms";

/// A response cache kept consistent by an [`EventRegistry`].
///
/// The registry is shared; the cache is its only writer in normal operation.
pub struct EventAwareCache<S: ResponseStore> {
    config: CacheConfig,
    registry: Arc<EventRegistry>,
    store: S,
    queue: InvalidationQueue,
    /// Held while an entry and its registrations change, and while an event
    /// fires, so a fire never lands between a put and its registration.
    gate: Mutex<()>,
}

impl<S: ResponseStore> EventAwareCache<S> {
    /// Wrap `store`, reconciling it with `registry` first.
    ///
    /// After a failed registry recovery nothing in `store` can be trusted to
    /// be invalidated, so everything is purged.
    pub fn new(config: CacheConfig, registry: Arc<EventRegistry>, store: S) -> Self {
        let queue = InvalidationQueue::new(config.queue_limit_non_zero());
        let cache = Self {
            config,
            registry,
            store,
            queue,
            gate: Mutex::new(()),
        };

        if cache.registry.was_recovery_successful() {
            cache.verify();
        } else {
            warn!(
                entries = cache.store.len(),
                recovery = ?cache.registry.recovery(),
                "Registry recovery failed; purging cache"
            );
            cache.clear();
        }
        cache
    }

    /// Drop registry keys with no stored entry, and event-based entries
    /// whose key is no longer registered. Returns (keys, entries) removed.
    pub fn verify(&self) -> (usize, usize) {
        let _gate = mutex_lock(&self.gate, SOURCE, "verify");
        let mut stale_keys = 0;
        for key in self.registry.all_keys() {
            if !self.store.contains(&key) {
                self.registry.remove_key(&key);
                stale_keys += 1;
            }
        }

        let mut stale_entries = 0;
        for key in self.store.keys() {
            let unregistered = self
                .store
                .peek(&key)
                .is_some_and(|entry| entry.validity.is_event_based())
                && !self.registry.contains_key(&key);
            if unregistered {
                self.store.remove(&key);
                stale_entries += 1;
            }
        }

        info!(stale_keys, stale_entries, "Cache verified against registry");
        (stale_keys, stale_entries)
    }

    /// Store a response and register every event its validity depends on.
    pub fn store(&self, key: PipelineKey, content: impl Into<Bytes>, validity: Validity) {
        self.store_entry(key, CachedPipeline::new(content, validity));
    }

    /// Replaces any entry already stored under `key`, together with its
    /// registrations.
    pub fn store_entry(&self, key: PipelineKey, entry: CachedPipeline) {
        let events = entry.validity.events();
        let _gate = mutex_lock(&self.gate, SOURCE, "store_entry");

        self.registry.remove_key(&key);
        if !events.is_empty() {
            self.registry.register_all(events, key.clone());
        }
        if let Some(evicted) = self.store.put(key, entry) {
            self.registry.remove_key(&evicted);
            debug!(key = %evicted, "Evicted entry unregistered");
        }
    }

    /// Stored content for `key`, if present and still valid. Expired entries
    /// are removed on the way.
    pub fn get(&self, key: &PipelineKey) -> Option<CachedPipeline> {
        let entry = self.store.get(key)?;
        if entry.validity.is_valid(OffsetDateTime::now_utc()) {
            return Some(entry);
        }
        self.evict(key);
        None
    }

    /// Invalidate every entry registered against `event` now. Returns the
    /// number of keys evicted.
    #[instrument(skip_all, fields(event = %event))]
    pub fn fire(&self, event: &Event) -> usize {
        let _gate = mutex_lock(&self.gate, SOURCE, "fire");
        let keys = self.registry.keys_for_event(event);
        for key in &keys {
            self.evict(key);
        }
        if !keys.is_empty() {
            counter!(METRIC_INVALIDATED_TOTAL).increment(keys.len() as u64);
        }
        debug!(evicted = keys.len(), "Event fired");
        keys.len()
    }

    /// Queue `event` for the next [`consume`](Self::consume).
    ///
    /// When the queue is full its oldest event is fired here, before this
    /// call returns.
    pub fn publish(&self, event: Event) -> Uuid {
        let published = self.queue.publish(event);
        if let Some(displaced) = published.displaced {
            let evicted = self.fire(&displaced.event);
            debug!(
                event_id = %displaced.id,
                evicted,
                "Displaced event fired on publish"
            );
        }
        published.id
    }

    /// Fire one batch of queued events. Returns true if any were processed.
    #[instrument(skip(self))]
    pub fn consume(&self) -> bool {
        let started = Instant::now();
        let fired = self.queue.drain(self.config.consume_batch_limit.max(1));
        if fired.is_empty() {
            return false;
        }

        let event_count = fired.len();
        let event_ids: Vec<Uuid> = fired.iter().map(|f| f.id).collect();
        let plan = InvalidationPlan::from_events(fired);

        info!(
            event_count,
            event_ids = ?event_ids,
            plan = %plan,
            "Cache consumption starting"
        );

        let invalidated: usize = plan.events.iter().map(|event| self.fire(event)).sum();

        info!(event_count, invalidated, "Cache consumption complete");
        histogram!(METRIC_CONSUME_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        true
    }

    /// Empty both the store and the registry.
    pub fn clear(&self) {
        let _gate = mutex_lock(&self.gate, SOURCE, "clear");
        self.store.clear();
        self.registry.clear();
    }

    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    pub fn store_ref(&self) -> &S {
        &self.store
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    fn evict(&self, key: &PipelineKey) {
        self.store.remove(key);
        self.registry.remove_key(key);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration as StdDuration;

    use time::Duration;

    use super::*;
    use crate::cache::keys::ComponentKind;
    use crate::cache::store::MemoryStore;
    use crate::cache::validity::EventValidity;

    /// Blocks every `put` until the test releases it.
    struct GatedStore {
        inner: MemoryStore,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl ResponseStore for GatedStore {
        fn get(&self, key: &PipelineKey) -> Option<CachedPipeline> {
            self.inner.get(key)
        }

        fn peek(&self, key: &PipelineKey) -> Option<CachedPipeline> {
            self.inner.peek(key)
        }

        fn put(&self, key: PipelineKey, entry: CachedPipeline) -> Option<PipelineKey> {
            let _ = self.entered.lock().expect("entered").send(());
            let _ = self
                .release
                .lock()
                .expect("release")
                .recv_timeout(StdDuration::from_secs(5));
            self.inner.put(key, entry)
        }

        fn remove(&self, key: &PipelineKey) -> Option<CachedPipeline> {
            self.inner.remove(key)
        }

        fn contains(&self, key: &PipelineKey) -> bool {
            self.inner.contains(key)
        }

        fn keys(&self) -> Vec<PipelineKey> {
            self.inner.keys()
        }

        fn len(&self) -> usize {
            self.inner.len()
        }

        fn clear(&self) {
            self.inner.clear()
        }
    }

    fn key(name: &str) -> PipelineKey {
        PipelineKey::new()
            .with(ComponentKind::Generator, "file", name)
            .with(ComponentKind::Serializer, "html", "")
    }

    fn cache() -> EventAwareCache<MemoryStore> {
        let config = CacheConfig::default();
        let store = MemoryStore::new(&config);
        EventAwareCache::new(config, Arc::new(EventRegistry::in_memory()), store)
    }

    #[test]
    fn fire_evicts_registered_entries() {
        let cache = cache();
        let docs = Event::named("docs");
        cache.store(key("a.xml"), "a", Validity::on_event(docs.clone()));
        cache.store(key("b.xml"), "b", Validity::on_event(docs.clone()));
        cache.store(
            key("c.xml"),
            "c",
            Validity::on_event(Event::named("other")),
        );

        assert_eq!(cache.fire(&docs), 2);
        assert!(cache.get(&key("a.xml")).is_none());
        assert!(cache.get(&key("b.xml")).is_none());
        assert!(cache.get(&key("c.xml")).is_some());
        assert!(cache.registry().keys_for_event(&docs).is_empty());
    }

    #[test]
    fn entry_with_several_events_is_evicted_by_any() {
        let cache = cache();
        let validity = Validity::Event(EventValidity::new([
            Event::named("a"),
            Event::name_value("doc", "7"),
        ]));
        cache.store(key("page"), "p", validity);

        assert_eq!(cache.fire(&Event::name_value("doc", "7")), 1);
        assert!(cache.get(&key("page")).is_none());
        assert!(!cache.registry().contains_key(&key("page")));
        assert!(cache.registry().keys_for_event(&Event::named("a")).is_empty());
    }

    #[test]
    fn queued_events_fire_on_consume() {
        let cache = cache();
        let docs = Event::named("docs");
        cache.store(key("a.xml"), "a", Validity::on_event(docs.clone()));

        cache.publish(docs.clone());
        cache.publish(docs);
        assert_eq!(cache.pending_events(), 2);

        assert!(cache.consume());
        assert!(cache.get(&key("a.xml")).is_none());
        assert!(!cache.consume());
    }

    #[test]
    fn expired_entry_is_removed_on_read() {
        let cache = cache();
        let validity = Validity::Aggregated(vec![
            Validity::on_event(Event::named("a")),
            Validity::Expires {
                at: OffsetDateTime::now_utc() - Duration::seconds(1),
            },
        ]);
        cache.store(key("old"), "x", validity);

        assert!(cache.get(&key("old")).is_none());
        assert!(cache.store_ref().is_empty());
        assert!(cache.registry().is_empty());
    }

    #[test]
    fn lru_eviction_unregisters_key() {
        let config = CacheConfig {
            capacity: 1,
            ..Default::default()
        };
        let store = MemoryStore::new(&config);
        let cache = EventAwareCache::new(config, Arc::new(EventRegistry::in_memory()), store);

        cache.store(key("a"), "a", Validity::on_event(Event::named("e")));
        cache.store(key("b"), "b", Validity::on_event(Event::named("e")));

        assert_eq!(
            cache.registry().all_keys(),
            std::collections::HashSet::from([key("b")])
        );
    }

    #[test]
    fn verify_drops_orphans_on_both_sides() {
        let config = CacheConfig::default();
        let registry: Arc<EventRegistry> = Arc::new(EventRegistry::in_memory());
        registry.register(Event::named("e"), key("orphan-key"));

        let store = MemoryStore::new(&config);
        store.put(
            key("orphan-entry"),
            CachedPipeline::new("x", Validity::on_event(Event::named("e"))),
        );
        store.put(
            key("timed"),
            CachedPipeline::new(
                "t",
                Validity::Expires {
                    at: OffsetDateTime::now_utc() + Duration::hours(1),
                },
            ),
        );

        let cache = EventAwareCache::new(config, registry, store);

        assert!(cache.registry().is_empty());
        assert_eq!(cache.store_ref().keys(), vec![key("timed")]);
        assert_eq!(cache.verify(), (0, 0));
    }

    #[test]
    fn full_queue_fires_the_displaced_event() {
        let config = CacheConfig {
            queue_limit: 1,
            ..Default::default()
        };
        let store = MemoryStore::new(&config);
        let cache = EventAwareCache::new(config, Arc::new(EventRegistry::in_memory()), store);
        let docs = Event::named("docs");
        cache.store(key("a.xml"), "a", Validity::on_event(docs.clone()));

        cache.publish(docs);
        cache.publish(Event::named("other"));

        assert_eq!(cache.pending_events(), 1);
        assert!(cache.get(&key("a.xml")).is_none());
        while cache.consume() {}
        assert!(cache.get(&key("a.xml")).is_none());
        assert!(cache.registry().is_empty());
    }

    #[test]
    fn restoring_a_key_replaces_its_registrations() {
        let cache = cache();
        let old = Event::named("old");
        let new = Event::named("new");
        cache.store(key("a"), "v1", Validity::on_event(old.clone()));
        cache.store(key("a"), "v2", Validity::on_event(new.clone()));

        assert_eq!(
            cache.registry().events_for_key(&key("a")),
            HashSet::from([new.clone()])
        );
        assert_eq!(cache.fire(&old), 0);
        assert!(cache.get(&key("a")).is_some());
        assert_eq!(cache.fire(&new), 1);
        assert!(cache.get(&key("a")).is_none());
    }

    #[test]
    fn restoring_with_time_validity_drops_event_registrations() {
        let cache = cache();
        cache.store(key("a"), "v1", Validity::on_event(Event::named("old")));
        cache.store(
            key("a"),
            "v2",
            Validity::Expires {
                at: OffsetDateTime::now_utc() + Duration::hours(1),
            },
        );

        assert!(!cache.registry().contains_key(&key("a")));
        assert!(cache.get(&key("a")).is_some());
    }

    #[test]
    fn fire_waits_for_a_store_in_progress() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let config = CacheConfig::default();
        let store = GatedStore {
            inner: MemoryStore::new(&config),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        let cache = Arc::new(EventAwareCache::new(
            config,
            Arc::new(EventRegistry::in_memory()),
            store,
        ));
        let docs = Event::named("docs");

        let storer = {
            let (cache, docs) = (Arc::clone(&cache), docs.clone());
            thread::spawn(move || cache.store(key("a"), "before", Validity::on_event(docs)))
        };
        entered_rx
            .recv_timeout(StdDuration::from_secs(5))
            .expect("store reached put");

        let firer = {
            let (cache, docs) = (Arc::clone(&cache), docs.clone());
            thread::spawn(move || cache.fire(&docs))
        };
        thread::sleep(StdDuration::from_millis(50));
        release_tx.send(()).expect("release put");

        storer.join().expect("storer");
        assert_eq!(firer.join().expect("firer"), 1);
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.registry().is_empty());
    }

    #[test]
    fn concurrent_stores_and_fires_keep_entries_and_registrations_paired() {
        let cache = Arc::new(cache());
        let events = [Event::named("even"), Event::named("odd")];

        let storers: Vec<_> = (0..4)
            .map(|worker| {
                let (cache, events) = (Arc::clone(&cache), events.clone());
                thread::spawn(move || {
                    for n in 0..200usize {
                        let key = key(&format!("page{}", (worker + n) % 5));
                        let event = events[n % 2].clone();
                        cache.store(key, "body", Validity::on_event(event));
                    }
                })
            })
            .collect();
        let firer = {
            let (cache, events) = (Arc::clone(&cache), events.clone());
            thread::spawn(move || {
                for n in 0..200usize {
                    cache.fire(&events[n % 2]);
                }
            })
        };
        for storer in storers {
            storer.join().expect("storer");
        }
        firer.join().expect("firer");

        let stored: HashSet<_> = cache.store_ref().keys().into_iter().collect();
        assert_eq!(cache.registry().all_keys(), stored);
        for key in stored {
            let entry = cache.store_ref().peek(&key).expect("stored");
            let expected: HashSet<_> = entry.validity.events().into_iter().collect();
            assert_eq!(cache.registry().events_for_key(&key), expected);
        }
    }
}
