//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::FlushMode;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "eventcache";
const ENV_PREFIX: &str = "EVENTCACHE";
const DEFAULT_BATCH_SIZE: u64 = 64;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;
const DEFAULT_COMPACT_AFTER: u64 = 10_000;
const DEFAULT_CACHE_CAPACITY: u64 = 1000;
const DEFAULT_QUEUE_LIMIT: u64 = 4096;
const DEFAULT_CONSUME_BATCH_LIMIT: u64 = 100;

/// Command-line arguments for the eventcache maintenance binary.
#[derive(Debug, Parser)]
#[command(
    name = "eventcache",
    version,
    about = "Inspect and maintain an event cache registry store"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "EVENTCACHE_CONFIG_FILE",
        value_name = "PATH",
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: RegistryOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Report the recovery outcome and relation size of the store.
    Inspect(InspectArgs),
    /// Exit with status 1 when the store cannot be recovered.
    Verify,
    /// Rewrite the snapshot and truncate the journal.
    Compact,
    /// Discard the stored relation, leaving a valid empty store.
    Reset,
}

#[derive(Debug, Args, Default, Clone)]
pub struct InspectArgs {
    /// Print every event with its keys.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub list: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RegistryOverrides {
    /// Override the registry store directory.
    #[arg(
        long = "store-dir",
        value_name = "PATH",
        value_hint = ValueHint::DirPath,
        global = true
    )]
    pub store_dir: Option<PathBuf>,

    /// Override the journal flush mode (immediate|batched).
    #[arg(long = "flush-mode", value_name = "MODE", global = true)]
    pub flush_mode: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub registry: RegistrySettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub store_dir: Option<PathBuf>,
    pub flush_mode: FlushMode,
    pub batch_size: NonZeroUsize,
    pub flush_interval: Duration,
    pub compact_after: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub capacity: NonZeroUsize,
    pub queue_limit: NonZeroUsize,
    pub consume_batch_limit: NonZeroUsize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_registry_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    registry: RawRegistrySettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_registry_overrides(&mut self, overrides: &RegistryOverrides) {
        if let Some(dir) = overrides.store_dir.as_ref() {
            self.registry.store_dir = Some(dir.clone());
        }
        if let Some(mode) = overrides.flush_mode.as_ref() {
            self.registry.flush_mode = Some(mode.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            registry,
            cache,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let registry = build_registry_settings(registry)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self {
            logging,
            registry,
            cache,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_registry_settings(registry: RawRegistrySettings) -> Result<RegistrySettings, LoadError> {
    let store_dir = registry
        .store_dir
        .filter(|dir| !dir.as_os_str().is_empty());

    let flush_mode = match registry.flush_mode.as_deref().map(str::trim) {
        None | Some("immediate") => FlushMode::Immediate,
        Some("batched") => FlushMode::Batched,
        Some(other) => {
            return Err(LoadError::invalid(
                "registry.flush_mode",
                format!("expected `immediate` or `batched`, got `{other}`"),
            ));
        }
    };

    let batch_size = non_zero_usize(
        registry.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
        "registry.batch_size",
    )?;
    let compact_after = non_zero_usize(
        registry.compact_after.unwrap_or(DEFAULT_COMPACT_AFTER),
        "registry.compact_after",
    )?;

    let interval_ms = registry
        .flush_interval_ms
        .unwrap_or(DEFAULT_FLUSH_INTERVAL_MS);
    if interval_ms == 0 {
        return Err(LoadError::invalid(
            "registry.flush_interval_ms",
            "must be greater than zero",
        ));
    }

    Ok(RegistrySettings {
        store_dir,
        flush_mode,
        batch_size,
        flush_interval: Duration::from_millis(interval_ms),
        compact_after,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    Ok(CacheSettings {
        capacity: non_zero_usize(
            cache.capacity.unwrap_or(DEFAULT_CACHE_CAPACITY),
            "cache.capacity",
        )?,
        queue_limit: non_zero_usize(
            cache.queue_limit.unwrap_or(DEFAULT_QUEUE_LIMIT),
            "cache.queue_limit",
        )?,
        consume_batch_limit: non_zero_usize(
            cache
                .consume_batch_limit
                .unwrap_or(DEFAULT_CONSUME_BATCH_LIMIT),
            "cache.consume_batch_limit",
        )?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRegistrySettings {
    store_dir: Option<PathBuf>,
    flush_mode: Option<String>,
    batch_size: Option<u64>,
    flush_interval_ms: Option<u64>,
    compact_after: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    capacity: Option<u64>,
    queue_limit: Option<u64>,
    consume_batch_limit: Option<u64>,
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_usize: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value_usize).ok_or_else(|| LoadError::invalid(key, "must be non-zero"))
}

/// Parse CLI arguments and load settings in one step.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
