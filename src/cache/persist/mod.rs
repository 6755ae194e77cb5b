//! Durable storage for the event/key relation.
//!
//! A store directory holds `registry.snapshot` (full relation, atomically
//! replaced) and `registry.journal` (operations since that snapshot). Every
//! start and every checkpoint moves to a new generation.

mod journal;
mod snapshot;

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use super::index::Index;
use super::keys::RegistryItem;

pub(crate) use journal::JournalRecord;
use journal::JournalWriter;

pub const SNAPSHOT_FILE: &str = "registry.snapshot";
pub const JOURNAL_FILE: &str = "registry.journal";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("checksum mismatch: expected {expected}, found {found}")]
    Checksum { expected: String, found: String },
    #[error("unsupported format version {found} (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("malformed store: {detail}")]
    Malformed { detail: String },
    #[error("torn write: {detail}")]
    Torn { detail: String },
    #[error("journal generation {journal} does not follow snapshot generation {snapshot}")]
    Generation { journal: u64, snapshot: u64 },
}

impl PersistError {
    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        Self::Malformed {
            detail: detail.into(),
        }
    }
}

/// Why the relation could not be reloaded at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryFailure {
    #[error("no persisted registry state found")]
    Missing,
    #[error("persisted registry state is corrupted: {reason}")]
    Corrupted { reason: String },
    #[error("persisted registry state has unsupported version {found}")]
    VersionMismatch { found: u32 },
    #[error("previous batched session did not shut down cleanly")]
    UncleanShutdown,
    #[error("persisted registry state could not be read: {reason}")]
    Io { reason: String },
}

impl From<PersistError> for RecoveryFailure {
    fn from(err: PersistError) -> Self {
        match err {
            PersistError::Io(err) => Self::Io {
                reason: err.to_string(),
            },
            PersistError::VersionMismatch { found, .. } => Self::VersionMismatch { found },
            other => Self::Corrupted {
                reason: other.to_string(),
            },
        }
    }
}

/// Result of the one-shot startup reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The registry has no store; nothing outlived the previous process.
    NotConfigured,
    Recovered {
        events: usize,
        keys: usize,
        generation: u64,
    },
    Failed(RecoveryFailure),
}

impl RecoveryOutcome {
    pub fn is_successful(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

pub(crate) struct Recovered<E, K> {
    pub(crate) index: Index<E, K>,
    pub(crate) generation: u64,
}

/// Rebuild the relation from `dir`.
///
/// Never returns a partially loaded index: any defect fails the whole reload.
pub(crate) fn recover<E: RegistryItem, K: RegistryItem>(
    dir: &Path,
) -> Result<Recovered<E, K>, RecoveryFailure> {
    let snapshot = snapshot::read::<E, K>(&dir.join(SNAPSHOT_FILE))?;
    let session = journal::read::<E, K>(&dir.join(JOURNAL_FILE))?;

    let Some(snapshot) = snapshot else {
        return match session {
            None => Err(RecoveryFailure::Missing),
            Some(_) => Err(RecoveryFailure::Corrupted {
                reason: "journal present without a snapshot".to_string(),
            }),
        };
    };

    let generation = snapshot.generation;
    let mut index = snapshot.index;

    if let Some(session) = session {
        if session.generation > generation {
            return Err(PersistError::Generation {
                journal: session.generation,
                snapshot: generation,
            }
            .into());
        }

        if session.batched && !session.closed {
            return Err(RecoveryFailure::UncleanShutdown);
        }

        if session.generation < generation {
            debug!(
                journal_generation = session.generation,
                snapshot_generation = generation,
                "Ignoring journal superseded by snapshot"
            );
        } else {
            let applied = session.replay(&mut index);
            debug!(applied, generation, "Replayed registry journal");
        }
    }

    Ok(Recovered { index, generation })
}

/// Read-only view of a store, as recovery would see it.
#[derive(Debug)]
pub struct StoreContents<E, K> {
    pub generation: u64,
    pub entries: Vec<(E, HashSet<K>)>,
}

impl<E, K> StoreContents<E, K> {
    pub fn event_count(&self) -> usize {
        self.entries.len()
    }
}

/// Load the relation stored in `dir` without opening a session or touching
/// any file.
pub fn read_store<E: RegistryItem, K: RegistryItem>(
    dir: &Path,
) -> Result<StoreContents<E, K>, RecoveryFailure> {
    let recovered = recover::<E, K>(dir)?;
    let entries = recovered
        .index
        .entries()
        .map(|(event, keys)| (event.clone(), keys.clone()))
        .collect();
    Ok(StoreContents {
        generation: recovered.generation,
        entries,
    })
}

/// Owns the files of the current session. `journal` is `None` once
/// durability has been abandoned.
pub(crate) struct StoreWriter {
    dir: PathBuf,
    batched: bool,
    generation: u64,
    journal: Option<JournalWriter>,
    appended: usize,
}

impl StoreWriter {
    /// A writer with no open session; `resume` or `reset` opens one.
    pub(crate) fn detached(dir: PathBuf, batched: bool) -> Self {
        Self {
            dir,
            batched,
            generation: 0,
            journal: None,
            appended: 0,
        }
    }

    /// Continue after a successful recovery: `snapshot` holds the recovered
    /// relation, so the old journal becomes stale the moment it is installed.
    pub(crate) fn resume(&mut self, generation: u64, snapshot: &[u8]) -> Result<(), PersistError> {
        self.rotate(generation, snapshot)
    }

    /// Start over after a failed recovery. The old journal goes first so a
    /// crash part-way cannot pair it with the new snapshot.
    pub(crate) fn reset(&mut self, snapshot: &[u8]) -> Result<(), PersistError> {
        fs::create_dir_all(&self.dir)?;
        remove_if_present(&self.dir.join(JOURNAL_FILE))?;
        self.rotate(1, snapshot)
    }

    /// Install `snapshot` as `generation` and truncate the journal to a new
    /// session on top of it.
    pub(crate) fn rotate(&mut self, generation: u64, snapshot: &[u8]) -> Result<(), PersistError> {
        self.journal = None;
        fs::create_dir_all(&self.dir)?;
        snapshot::install(&self.dir.join(SNAPSHOT_FILE), snapshot)?;
        let journal = JournalWriter::create(&self.dir.join(JOURNAL_FILE), generation, self.batched)?;
        self.journal = Some(journal);
        self.generation = generation;
        self.appended = 0;
        Ok(())
    }

    pub(crate) fn append<E: RegistryItem, K: RegistryItem>(
        &mut self,
        records: &[JournalRecord<E, K>],
    ) -> Result<(), PersistError> {
        let Some(journal) = self.journal.as_mut() else {
            return Ok(());
        };
        journal.append(records)?;
        self.appended += records.len();
        Ok(())
    }

    /// Mark the session as cleanly closed.
    pub(crate) fn close(&mut self) -> Result<(), PersistError> {
        let Some(journal) = self.journal.as_mut() else {
            return Ok(());
        };
        journal.append::<(), ()>(&[JournalRecord::Close])?;
        journal.sync()
    }

    /// Give up on durability: drop the session and delete the store so a
    /// later start reports `Missing` rather than loading an incomplete
    /// relation.
    pub(crate) fn abandon(&mut self) {
        self.journal = None;
        for file in [JOURNAL_FILE, SNAPSHOT_FILE] {
            let path = self.dir.join(file);
            if let Err(err) = remove_if_present(&path) {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "Failed to remove registry store file after persistence failure"
                );
            }
        }
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.journal.is_none()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn appended(&self) -> usize {
        self.appended
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }
}

pub(crate) fn encode_snapshot<E: RegistryItem, K: RegistryItem>(
    generation: u64,
    index: &Index<E, K>,
) -> Result<Vec<u8>, PersistError> {
    snapshot::encode(generation, index)
}

fn remove_if_present(path: &Path) -> Result<(), PersistError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tempfile::tempdir;

    use super::*;

    fn register(event: &str, key: &str) -> JournalRecord<String, String> {
        JournalRecord::Register {
            event: event.to_string(),
            key: key.to_string(),
        }
    }

    fn started(dir: &Path, batched: bool, index: &Index<String, String>) -> StoreWriter {
        let mut writer = StoreWriter::detached(dir.to_path_buf(), batched);
        let snapshot = encode_snapshot(1, index).expect("encode");
        writer.resume(1, &snapshot).expect("resume");
        writer
    }

    #[test]
    fn empty_directory_is_missing() {
        let dir = tempdir().expect("tempdir");
        let result = recover::<String, String>(dir.path());
        assert_eq!(result.err(), Some(RecoveryFailure::Missing));
    }

    #[test]
    fn snapshot_plus_journal_replays() {
        let dir = tempdir().expect("tempdir");
        let mut base = Index::default();
        base.insert("a".to_string(), "k1".to_string());

        let mut writer = started(dir.path(), false, &base);
        writer
            .append(&[
                register("a", "k2"),
                JournalRecord::RemoveKey {
                    key: "k1".to_string(),
                },
            ])
            .expect("append");

        let recovered = recover::<String, String>(dir.path()).expect("recover");
        assert_eq!(recovered.generation, 1);
        assert_eq!(
            recovered.index.keys_for_event(&"a".to_string()),
            HashSet::from(["k2".to_string()])
        );
    }

    #[test]
    fn unclosed_batched_session_is_unclean() {
        let dir = tempdir().expect("tempdir");
        let mut writer = started(dir.path(), true, &Index::default());
        writer.append(&[register("a", "k1")]).expect("append");

        let result = recover::<String, String>(dir.path());
        assert_eq!(result.err(), Some(RecoveryFailure::UncleanShutdown));
    }

    #[test]
    fn closed_batched_session_recovers() {
        let dir = tempdir().expect("tempdir");
        let mut writer = started(dir.path(), true, &Index::default());
        writer.append(&[register("a", "k1")]).expect("append");
        writer.close().expect("close");

        let recovered = recover::<String, String>(dir.path()).expect("recover");
        assert_eq!(recovered.index.key_count(), 1);
    }

    #[test]
    fn journal_superseded_by_snapshot_is_ignored() {
        let dir = tempdir().expect("tempdir");
        let mut writer = started(dir.path(), false, &Index::default());
        writer.append(&[register("a", "k1")]).expect("append");

        // Simulate a crash between installing snapshot 2 and truncating the journal.
        let mut newer = Index::default();
        newer.insert("b".to_string(), "k2".to_string());
        let bytes = encode_snapshot(2, &newer).expect("encode");
        snapshot::install(&dir.path().join(SNAPSHOT_FILE), &bytes).expect("install");

        let recovered = recover::<String, String>(dir.path()).expect("recover");
        assert_eq!(recovered.generation, 2);
        assert!(recovered.index.keys_for_event(&"a".to_string()).is_empty());
        assert_eq!(recovered.index.key_count(), 1);
    }

    #[test]
    fn journal_ahead_of_snapshot_is_corrupted() {
        let dir = tempdir().expect("tempdir");
        let mut writer = started(dir.path(), false, &Index::default());
        let bytes = encode_snapshot(5, &Index::<String, String>::default()).expect("encode");
        writer.rotate(5, &bytes).expect("rotate");

        let older = encode_snapshot(4, &Index::<String, String>::default()).expect("encode");
        snapshot::install(&dir.path().join(SNAPSHOT_FILE), &older).expect("install");

        let result = recover::<String, String>(dir.path());
        assert!(matches!(result.err(), Some(RecoveryFailure::Corrupted { .. })));
    }

    #[test]
    fn read_store_leaves_files_untouched() {
        let dir = tempdir().expect("tempdir");
        let mut writer = started(dir.path(), true, &Index::default());
        writer.append(&[register("a", "k1")]).expect("append");
        writer.close().expect("close");
        let before = fs::read(dir.path().join(JOURNAL_FILE)).expect("journal");

        let contents = read_store::<String, String>(dir.path()).expect("read");
        assert_eq!(contents.generation, 1);
        assert_eq!(contents.event_count(), 1);
        assert_eq!(
            fs::read(dir.path().join(JOURNAL_FILE)).expect("journal"),
            before
        );
    }

    #[test]
    fn abandon_removes_store_files() {
        let dir = tempdir().expect("tempdir");
        let mut writer = started(dir.path(), false, &Index::default());
        writer.abandon();

        assert!(writer.is_detached());
        assert!(!dir.path().join(SNAPSHOT_FILE).exists());
        assert!(!dir.path().join(JOURNAL_FILE).exists());
        assert_eq!(
            recover::<String, String>(dir.path()).err(),
            Some(RecoveryFailure::Missing)
        );
    }
}
