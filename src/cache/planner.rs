//! Invalidation plan generation.
//!
//! Merges a drained batch of fired events into the distinct events to apply.

use std::collections::HashSet;
use std::fmt;

use super::events::FiredEvent;
use super::keys::Event;

#[derive(Debug, Default)]
pub struct InvalidationPlan {
    /// Distinct events in first-fire order.
    pub events: Vec<Event>,
    /// Inputs merged away as duplicates.
    pub merged: usize,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidationPlan {{ events: {}, merged: {} }}",
            self.events.len(),
            self.merged
        )
    }
}

impl InvalidationPlan {
    /// Deduplicates by event id, then by event value. Firing the same event
    /// twice in one batch invalidates nothing more than firing it once.
    pub fn from_events(fired: Vec<FiredEvent>) -> Self {
        let total = fired.len();
        let mut seen_ids = HashSet::new();
        let mut seen_events = HashSet::new();

        let events: Vec<Event> = fired
            .into_iter()
            .filter(|f| seen_ids.insert(f.id))
            .map(|f| f.event)
            .filter(|event| seen_events.insert(event.clone()))
            .collect();

        Self {
            merged: total - events.len(),
            events,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
