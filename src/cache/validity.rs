//! Validity attached to cached responses.

use std::collections::HashSet;

use time::OffsetDateTime;

use super::keys::Event;

/// Valid until any of `events` fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventValidity {
    events: Vec<Event>,
}

impl EventValidity {
    pub fn new(events: impl IntoIterator<Item = Event>) -> Self {
        let mut seen = HashSet::new();
        let events = events
            .into_iter()
            .filter(|event| seen.insert(event.clone()))
            .collect();
        Self { events }
    }

    pub fn single(event: Event) -> Self {
        Self {
            events: vec![event],
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }
}

/// How long a cached response may be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Event(EventValidity),
    Expires { at: OffsetDateTime },
    /// Valid while every part is.
    Aggregated(Vec<Validity>),
}

impl Validity {
    pub fn on_event(event: Event) -> Self {
        Self::Event(EventValidity::single(event))
    }

    /// Every event in the tree, deduplicated, in first-seen order.
    pub fn events(&self) -> Vec<Event> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        self.collect_events(&mut seen, &mut out);
        out
    }

    fn collect_events(&self, seen: &mut HashSet<Event>, out: &mut Vec<Event>) {
        match self {
            Self::Event(validity) => {
                for event in validity.events() {
                    if seen.insert(event.clone()) {
                        out.push(event.clone());
                    }
                }
            }
            Self::Expires { .. } => {}
            Self::Aggregated(parts) => {
                for part in parts {
                    part.collect_events(seen, out);
                }
            }
        }
    }

    /// Event parts never expire here; firing removes them from the cache.
    pub fn is_valid(&self, now: OffsetDateTime) -> bool {
        match self {
            Self::Event(_) => true,
            Self::Expires { at } => now < *at,
            Self::Aggregated(parts) => parts.iter().all(|part| part.is_valid(now)),
        }
    }

    pub fn is_event_based(&self) -> bool {
        match self {
            Self::Event(validity) => !validity.events().is_empty(),
            Self::Expires { .. } => false,
            Self::Aggregated(parts) => parts.iter().any(Validity::is_event_based),
        }
    }
}
