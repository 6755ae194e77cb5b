//! Event-based cache invalidation.
//!
//! - **Registry**: which cached pipeline keys depend on which events,
//!   optionally persisted across restarts.
//! - **Cache**: a response store that registers entries on write and evicts
//!   them when their events fire.
//!
//! ## Configuration
//!
//! Registry behavior is controlled via `eventcache.toml`:
//!
//! ```toml
//! [registry]
//! store_dir = "/var/lib/eventcache"
//! flush_mode = "batched"
//! batch_size = 64
//! # ... see config.rs for all options
//! ```

mod config;
mod consumer;
mod events;
mod flusher;
mod index;
mod keys;
mod lock;
pub mod persist;
mod planner;
mod registry;
mod store;
mod validity;

pub use config::{CacheConfig, FlushMode, RegistryConfig};
pub use consumer::EventAwareCache;
pub use events::{Epoch, FiredEvent, InvalidationQueue, Published};
pub use flusher::spawn_flusher;
pub use keys::{ComponentKey, ComponentKind, Event, PipelineKey, RegistryItem};
pub use persist::{PersistError, RecoveryFailure, RecoveryOutcome};
pub use planner::InvalidationPlan;
pub use registry::EventRegistry;
pub use store::{CachedPipeline, MemoryStore, ResponseStore};
pub use validity::{EventValidity, Validity};
