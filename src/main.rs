use std::{collections::HashSet, path::PathBuf, process};

use eventcache::{
    cache::{
        Event, EventRegistry, PipelineKey, RecoveryOutcome, RegistryConfig,
        persist::{self, StoreContents},
    },
    config::{self, Command, InspectArgs, Settings},
    error::AppError,
    infra::telemetry,
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

fn main() {
    if let Err(error) = run() {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(Command::Inspect(InspectArgs::default()));

    telemetry::init(&settings.logging)?;

    match command {
        Command::Inspect(args) => run_inspect(&settings, &args),
        Command::Verify => run_verify(&settings),
        Command::Compact => run_compact(&settings),
        Command::Reset => run_reset(&settings),
    }
}

fn store_dir(settings: &Settings) -> Result<PathBuf, AppError> {
    settings.registry.store_dir.clone().ok_or_else(|| {
        AppError::validation("registry.store_dir is not configured; pass --store-dir")
    })
}

fn read_store(settings: &Settings) -> Result<StoreContents<Event, PipelineKey>, AppError> {
    let dir = store_dir(settings)?;
    Ok(persist::read_store::<Event, PipelineKey>(&dir)?)
}

fn run_inspect(settings: &Settings, args: &InspectArgs) -> Result<(), AppError> {
    let dir = store_dir(settings)?;
    let contents = match persist::read_store::<Event, PipelineKey>(&dir) {
        Ok(contents) => contents,
        Err(failure) => {
            println!("recovery: failed ({failure})");
            return Ok(());
        }
    };
    let keys: usize = {
        let mut all = HashSet::new();
        for (_, entry_keys) in &contents.entries {
            all.extend(entry_keys.iter());
        }
        all.len()
    };

    println!("recovery: ok");
    println!("generation: {}", contents.generation);
    println!("events: {}", contents.event_count());
    println!("keys: {keys}");

    if args.list {
        let mut entries: Vec<_> = contents.entries.iter().collect();
        entries.sort_by_key(|(event, _)| event.to_string());
        for (event, entry_keys) in entries {
            let mut rendered: Vec<String> = entry_keys.iter().map(ToString::to_string).collect();
            rendered.sort();
            println!("{event}");
            for key in rendered {
                println!("  {key}");
            }
        }
    }
    Ok(())
}

fn run_verify(settings: &Settings) -> Result<(), AppError> {
    let contents = read_store(settings)?;
    info!(
        generation = contents.generation,
        events = contents.event_count(),
        "Registry store verified"
    );
    println!("ok");
    Ok(())
}

fn run_compact(settings: &Settings) -> Result<(), AppError> {
    // A failed recovery would reset the store on open; refuse instead.
    read_store(settings)?;

    let registry = open_registry(settings)?;
    registry.checkpoint()?;
    registry.close()?;

    println!(
        "compacted: {} events, {} keys",
        registry.event_count(),
        registry.key_count()
    );
    Ok(())
}

fn run_reset(settings: &Settings) -> Result<(), AppError> {
    let registry = open_registry(settings)?;
    let previous = registry.key_count();
    registry.clear();
    registry.close()?;

    if let RecoveryOutcome::Failed(reason) = registry.recovery() {
        println!("reset: previous store was unusable ({reason})");
    } else {
        println!("reset: {previous} keys discarded");
    }
    Ok(())
}

fn open_registry(settings: &Settings) -> Result<EventRegistry, AppError> {
    store_dir(settings)?;
    let config = RegistryConfig::from(&settings.registry);
    let registry: EventRegistry = EventRegistry::open(&config);
    if registry.durability_degraded() {
        return Err(AppError::unexpected(
            "registry store could not be written; see log for details",
        ));
    }
    Ok(registry)
}
