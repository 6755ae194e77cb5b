//! Background journal flusher.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::keys::RegistryItem;
use super::registry::EventRegistry;

/// Periodically flush pending journal records of `registry`.
///
/// A registry whose durability degraded is checkpointed instead, which
/// rebuilds the store from the in-memory index. Disk work runs on the
/// blocking pool. Abort the handle to stop.
pub fn spawn_flusher<E: RegistryItem, K: RegistryItem>(
    registry: Arc<EventRegistry<E, K>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;

            let registry = Arc::clone(&registry);
            let result = tokio::task::spawn_blocking(move || {
                if registry.durability_degraded() {
                    debug!("Flusher retrying checkpoint of degraded registry");
                    registry.checkpoint()
                } else {
                    registry.flush()
                }
            })
            .await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "Background registry flush failed"),
                Err(err) => warn!(error = %err, "Background registry flush task failed"),
            }
        }
    })
}
