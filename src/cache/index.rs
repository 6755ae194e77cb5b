//! Bidirectional event/key index.
//!
//! Plain data structure with no locking; `EventRegistry` owns one behind a
//! single `RwLock` so both directions always change together.

use std::collections::{HashMap, HashSet};

use super::keys::RegistryItem;

/// Forward (`event -> keys`) and reverse (`key -> events`) maps over the same
/// relation. Neither map ever holds an empty set.
#[derive(Debug, Clone)]
pub(crate) struct Index<E, K> {
    event_to_keys: HashMap<E, HashSet<K>>,
    key_to_events: HashMap<K, HashSet<E>>,
}

impl<E: RegistryItem, K: RegistryItem> Default for Index<E, K> {
    fn default() -> Self {
        Self {
            event_to_keys: HashMap::new(),
            key_to_events: HashMap::new(),
        }
    }
}

impl<E: RegistryItem, K: RegistryItem> Index<E, K> {
    /// Insert the pair. Returns false when it was already present.
    pub(crate) fn insert(&mut self, event: E, key: K) -> bool {
        let events = self.key_to_events.entry(key.clone()).or_default();
        if !events.insert(event.clone()) {
            return false;
        }
        self.event_to_keys.entry(event).or_default().insert(key);
        true
    }

    /// Drop every pair involving `key`. Returns the number of pairs removed.
    pub(crate) fn remove_key(&mut self, key: &K) -> usize {
        let Some(events) = self.key_to_events.remove(key) else {
            return 0;
        };

        for event in &events {
            if let Some(keys) = self.event_to_keys.get_mut(event) {
                keys.remove(key);
                if keys.is_empty() {
                    self.event_to_keys.remove(event);
                }
            }
        }

        events.len()
    }

    pub(crate) fn keys_for_event(&self, event: &E) -> HashSet<K> {
        self.event_to_keys.get(event).cloned().unwrap_or_default()
    }

    pub(crate) fn events_for_key(&self, key: &K) -> HashSet<E> {
        self.key_to_events.get(key).cloned().unwrap_or_default()
    }

    pub(crate) fn all_keys(&self) -> HashSet<K> {
        self.key_to_events.keys().cloned().collect()
    }

    pub(crate) fn contains_key(&self, key: &K) -> bool {
        self.key_to_events.contains_key(key)
    }

    pub(crate) fn clear(&mut self) {
        self.event_to_keys.clear();
        self.key_to_events.clear();
    }

    pub(crate) fn event_count(&self) -> usize {
        self.event_to_keys.len()
    }

    pub(crate) fn key_count(&self) -> usize {
        self.key_to_events.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.key_to_events.is_empty()
    }

    /// Iterate the forward map, one entry per event.
    pub(crate) fn entries(&self) -> impl Iterator<Item = (&E, &HashSet<K>)> {
        self.event_to_keys.iter()
    }
}
