//! Event-based cache invalidation registry.
//!
//! [`cache::EventRegistry`] maps invalidation events to the cache keys that
//! depend on them and, when given a store directory, reloads that mapping
//! after a restart. [`cache::EventAwareCache`] is a response cache built on it.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
