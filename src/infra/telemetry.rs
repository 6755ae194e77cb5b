use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    // Logs go to stderr; stdout carries command output.
    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "eventcache_registry_register_total",
            Unit::Count,
            "Total number of new event/key registrations."
        );
        describe_counter!(
            "eventcache_registry_remove_total",
            Unit::Count,
            "Total number of keys removed from the registry."
        );
        describe_gauge!(
            "eventcache_registry_keys",
            Unit::Count,
            "Current number of keys with at least one registered event."
        );
        describe_counter!(
            "eventcache_persist_error_total",
            Unit::Count,
            "Total number of registry store write failures."
        );
        describe_counter!(
            "eventcache_recovery_failed_total",
            Unit::Count,
            "Total number of failed registry recoveries at startup."
        );
        describe_histogram!(
            "eventcache_recovery_ms",
            Unit::Milliseconds,
            "Registry recovery latency in milliseconds."
        );
        describe_histogram!(
            "eventcache_flush_ms",
            Unit::Milliseconds,
            "Journal flush latency in milliseconds."
        );
        describe_histogram!(
            "eventcache_checkpoint_ms",
            Unit::Milliseconds,
            "Snapshot checkpoint latency in milliseconds."
        );
        describe_gauge!(
            "eventcache_queue_len",
            Unit::Count,
            "Current number of pending invalidation events in the queue."
        );
        describe_counter!(
            "eventcache_queue_overflow_total",
            Unit::Count,
            "Total number of invalidation events pushed out of a full queue and fired on publish."
        );
        describe_counter!(
            "eventcache_invalidated_keys_total",
            Unit::Count,
            "Total number of cache keys evicted by fired events."
        );
        describe_histogram!(
            "eventcache_consume_ms",
            Unit::Milliseconds,
            "Invalidation batch consumption latency in milliseconds."
        );
        describe_counter!(
            "eventcache_store_hit_total",
            Unit::Count,
            "Total number of response store hits."
        );
        describe_counter!(
            "eventcache_store_miss_total",
            Unit::Count,
            "Total number of response store misses."
        );
        describe_counter!(
            "eventcache_store_evict_total",
            Unit::Count,
            "Total number of response store evictions due to capacity."
        );
    });
}
