use std::fs;
use std::mem;
use std::path::Path;

use assert_cmd::Command;
use eventcache::cache::persist::JOURNAL_FILE;
use eventcache::cache::{
    ComponentKind, Event, EventRegistry, FlushMode, PipelineKey, RegistryConfig,
};
use predicates::str::contains;
use tempfile::tempdir;

fn pck(source: &str) -> PipelineKey {
    PipelineKey::new()
        .with(ComponentKind::Generator, "file", source)
        .with(ComponentKind::Serializer, "html", "")
}

fn seed(dir: &Path) {
    let registry: EventRegistry = EventRegistry::open(&RegistryConfig::persistent(dir));
    registry.register(Event::named("EventA"), pck("index.xml"));
    registry.register(Event::name_value("doc", "7"), pck("index.xml"));
    registry.close().expect("close");
}

fn eventcache() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("eventcache"));
    cmd.env_remove("EVENTCACHE_CONFIG_FILE")
        .env("RUST_LOG", "error");
    cmd
}

#[test]
fn inspect_lists_stored_relation() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path());

    let assert = eventcache()
        .arg("--store-dir")
        .arg(dir.path())
        .arg("inspect")
        .arg("--list")
        .assert()
        .success();

    let output = String::from_utf8_lossy(&assert.get_output().stdout);
    assert!(output.contains("recovery: ok"));
    assert!(output.contains("events: 2"));
    assert!(output.contains("keys: 1"));
    assert!(output.contains("doc=7"));
    assert!(output.contains("  G-file-index.xml;S-html-"));
}

#[test]
fn verify_fails_on_unclean_batched_store() {
    let dir = tempdir().expect("tempdir");
    {
        let config = RegistryConfig {
            flush_mode: FlushMode::Batched,
            batch_size: 1,
            ..RegistryConfig::persistent(dir.path())
        };
        let registry: EventRegistry = EventRegistry::open(&config);
        registry.register(Event::named("EventA"), pck("index.xml"));
        mem::forget(registry);
    }
    let journal_before = fs::read(dir.path().join(JOURNAL_FILE)).expect("journal");

    eventcache()
        .arg("verify")
        .arg("--store-dir")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(contains("did not shut down cleanly"));

    // Verification never rewrites the store.
    assert_eq!(
        fs::read(dir.path().join(JOURNAL_FILE)).expect("journal"),
        journal_before
    );
}

#[test]
fn inspect_reports_missing_store_without_failing() {
    let dir = tempdir().expect("tempdir");

    eventcache()
        .arg("inspect")
        .arg("--store-dir")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(contains("recovery: failed (no persisted registry state found)"));
}

#[test]
fn verify_succeeds_on_clean_store() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path());

    eventcache()
        .arg("verify")
        .arg("--store-dir")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(contains("ok"));
}

#[test]
fn reset_leaves_an_empty_valid_store() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path());

    eventcache()
        .arg("reset")
        .arg("--store-dir")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(contains("1 keys discarded"));

    let registry: EventRegistry = EventRegistry::open(&RegistryConfig::persistent(dir.path()));
    assert!(registry.was_recovery_successful());
    assert!(registry.is_empty());
}

#[test]
fn compact_keeps_relation() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path());

    eventcache()
        .arg("compact")
        .arg("--store-dir")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(contains("compacted: 2 events, 1 keys"));

    let registry: EventRegistry = EventRegistry::open(&RegistryConfig::persistent(dir.path()));
    assert!(registry.was_recovery_successful());
    assert_eq!(registry.event_count(), 2);
}

#[test]
fn missing_store_dir_fails_fast() {
    eventcache()
        .arg("verify")
        .env_remove("EVENTCACHE__REGISTRY__STORE_DIR")
        .assert()
        .failure()
        .stderr(contains("registry.store_dir is not configured"));
}
