//! Invalidation event queue.
//!
//! Events fired by writers wait here until the cache consumes them.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::keys::Event;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::events";

const METRIC_QUEUE_LEN: &str = "eventcache_queue_len";
const METRIC_QUEUE_OVERFLOW_TOTAL: &str = "eventcache_queue_overflow_total";

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

/// An event that has fired and awaits consumption.
#[derive(Debug, Clone)]
pub struct FiredEvent {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    pub epoch: Epoch,
    pub event: Event,
    pub timestamp: OffsetDateTime,
}

impl FiredEvent {
    pub fn new(event: Event, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            event,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Result of [`InvalidationQueue::publish`].
#[derive(Debug)]
#[must_use = "a displaced event has not been fired yet"]
pub struct Published {
    pub id: Uuid,
    /// Oldest event pushed out of a full queue. It was never consumed, so the
    /// caller must fire it.
    pub displaced: Option<FiredEvent>,
}

/// Bounded FIFO of fired events. When full, the oldest event is handed back
/// to the publisher instead of being kept.
pub struct InvalidationQueue {
    queue: Mutex<VecDeque<FiredEvent>>,
    epoch_counter: AtomicU64,
    limit: NonZeroUsize,
}

impl InvalidationQueue {
    pub fn new(limit: NonZeroUsize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            limit,
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Enqueue `event`, returning the id it was assigned and any event it
    /// displaced.
    pub fn publish(&self, event: Event) -> Published {
        let fired = FiredEvent::new(event, self.next_epoch());
        let id = fired.id;

        info!(
            event_id = %fired.id,
            event_epoch = fired.epoch,
            event = %fired.event,
            "Invalidation event enqueued"
        );

        let mut queue = mutex_lock(&self.queue, SOURCE, "publish");
        let displaced = if queue.len() >= self.limit.get() {
            queue.pop_front()
        } else {
            None
        };
        if let Some(displaced) = &displaced {
            counter!(METRIC_QUEUE_OVERFLOW_TOTAL).increment(1);
            warn!(
                event_id = %displaced.id,
                event = %displaced.event,
                limit = self.limit.get(),
                "Invalidation queue full; oldest event handed back to publisher"
            );
        }
        queue.push_back(fired);
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        Published { id, displaced }
    }

    /// Drain up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<FiredEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let events = queue.drain(..count).collect();
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        events
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
        gauge!(METRIC_QUEUE_LEN).set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    fn queue(limit: usize) -> InvalidationQueue {
        InvalidationQueue::new(NonZeroUsize::new(limit).expect("non-zero"))
    }

    #[test]
    fn epoch_monotonicity() {
        let queue = queue(8);

        let e1 = queue.next_epoch();
        let e2 = queue.next_epoch();
        let e3 = queue.next_epoch();

        assert!(e1 < e2);
        assert!(e2 < e3);
    }

    #[test]
    fn publish_and_drain() {
        let queue = queue(8);

        let _ = queue.publish(Event::named("a"));
        let _ = queue.publish(Event::named("b"));
        let _ = queue.publish(Event::name_value("doc", "42"));
        assert_eq!(queue.len(), 3);

        let events = queue.drain(2);
        assert_eq!(events.len(), 2);
        assert_eq!(queue.len(), 1);

        // FIFO
        assert_eq!(events[0].event, Event::named("a"));
        assert_eq!(events[1].event, Event::named("b"));
        assert!(events[0].epoch < events[1].epoch);
    }

    #[test]
    fn full_queue_hands_back_oldest() {
        let queue = queue(2);

        assert!(queue.publish(Event::named("first")).displaced.is_none());
        assert!(queue.publish(Event::named("second")).displaced.is_none());
        let published = queue.publish(Event::named("third"));

        let displaced = published.displaced.expect("oldest displaced");
        assert_eq!(displaced.event, Event::named("first"));
        assert_ne!(displaced.id, published.id);

        let events = queue.drain(10);
        let names: Vec<_> = events.iter().map(|e| e.event.name().to_string()).collect();
        assert_eq!(names, ["second", "third"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn clear_queue() {
        let queue = queue(8);
        let _ = queue.publish(Event::named("a"));
        assert!(!queue.is_empty());

        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn invalidation_queue_recovers_from_poisoned_lock() {
        let queue = queue(8);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = queue.queue.lock().expect("queue lock should be acquired");
            panic!("poison queue lock");
        }));

        let _ = queue.publish(Event::named("a"));
        assert_eq!(queue.len(), 1);
    }
}
