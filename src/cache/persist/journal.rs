//! Append-only operation journal.
//!
//! One record per line: `<checksum> <json>`, where the checksum is the first
//! 16 hex digits of the SHA-256 of the JSON text. A journal holds exactly one
//! session: it starts with `open` and, after a clean shutdown, ends with
//! `close`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::PersistError;
use super::snapshot::checksum;
use crate::cache::index::Index;
use crate::cache::keys::RegistryItem;

const CHECKSUM_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum JournalRecord<E, K> {
    Open { generation: u64, batched: bool },
    Register { event: E, key: K },
    RemoveKey { key: K },
    Clear,
    Close,
}

/// A parsed journal session.
#[derive(Debug)]
pub(crate) struct Session<E, K> {
    pub(crate) generation: u64,
    pub(crate) batched: bool,
    pub(crate) closed: bool,
    records: Vec<JournalRecord<E, K>>,
}

impl<E: RegistryItem, K: RegistryItem> Session<E, K> {
    /// Apply the session's mutations on top of `index`, in order.
    pub(crate) fn replay(self, index: &mut Index<E, K>) -> usize {
        let mut applied = 0;
        for record in self.records {
            match record {
                JournalRecord::Register { event, key } => {
                    index.insert(event, key);
                }
                JournalRecord::RemoveKey { key } => {
                    index.remove_key(&key);
                }
                JournalRecord::Clear => index.clear(),
                JournalRecord::Open { .. } | JournalRecord::Close => continue,
            }
            applied += 1;
        }
        applied
    }
}

pub(crate) fn encode_line<E: Serialize, K: Serialize>(
    record: &JournalRecord<E, K>,
    out: &mut Vec<u8>,
) -> Result<(), PersistError> {
    let json = serde_json::to_vec(record)?;
    let sum = checksum(&json);
    out.extend_from_slice(&sum.as_bytes()[..CHECKSUM_LEN]);
    out.push(b' ');
    out.extend_from_slice(&json);
    out.push(b'\n');
    Ok(())
}

fn decode_line<E: RegistryItem, K: RegistryItem>(
    line_no: usize,
    line: &str,
) -> Result<JournalRecord<E, K>, PersistError> {
    let (sum, json) = line
        .split_once(' ')
        .ok_or_else(|| PersistError::malformed(format!("journal line {line_no}: no checksum")))?;

    let expected = checksum(json.as_bytes());
    if sum.len() != CHECKSUM_LEN || sum != &expected[..CHECKSUM_LEN] {
        return Err(PersistError::Checksum {
            expected: expected[..CHECKSUM_LEN].to_string(),
            found: sum.to_string(),
        });
    }

    serde_json::from_str(json)
        .map_err(|err| PersistError::malformed(format!("journal line {line_no}: {err}")))
}

/// Read and verify the journal at `path`. `Ok(None)` when it does not exist.
pub(crate) fn read<E: RegistryItem, K: RegistryItem>(
    path: &Path,
) -> Result<Option<Session<E, K>>, PersistError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) if err.kind() == io::ErrorKind::InvalidData => {
            return Err(PersistError::malformed("journal is not valid UTF-8"));
        }
        Err(err) => return Err(err.into()),
    };

    if !text.is_empty() && !text.ends_with('\n') {
        return Err(PersistError::Torn {
            detail: "journal ends in a partial record".to_string(),
        });
    }

    let mut lines = text.lines().enumerate();
    let (generation, batched) = match lines.next() {
        Some((line_no, line)) => match decode_line::<E, K>(line_no + 1, line)? {
            JournalRecord::Open {
                generation,
                batched,
            } => (generation, batched),
            _ => return Err(PersistError::malformed("journal does not start with open")),
        },
        None => return Err(PersistError::malformed("journal is empty")),
    };

    let mut session = Session {
        generation,
        batched,
        closed: false,
        records: Vec::new(),
    };

    for (line_no, line) in lines {
        if session.closed {
            return Err(PersistError::malformed(format!(
                "journal line {}: record after close",
                line_no + 1
            )));
        }
        match decode_line::<E, K>(line_no + 1, line)? {
            JournalRecord::Open { .. } => {
                return Err(PersistError::malformed(format!(
                    "journal line {}: second open",
                    line_no + 1
                )));
            }
            JournalRecord::Close => session.closed = true,
            record => session.records.push(record),
        }
    }

    Ok(Some(session))
}

/// Buffered handle on the journal file of the current session.
pub(crate) struct JournalWriter {
    file: BufWriter<File>,
}

impl JournalWriter {
    /// Truncate the journal at `path` and begin a new session.
    pub(crate) fn create(path: &Path, generation: u64, batched: bool) -> Result<Self, PersistError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = Self {
            file: BufWriter::new(file),
        };
        writer.append::<(), ()>(&[JournalRecord::Open {
            generation,
            batched,
        }])?;
        writer.sync()?;
        Ok(writer)
    }

    /// Write `records` and hand them to the OS.
    pub(crate) fn append<E: Serialize, K: Serialize>(
        &mut self,
        records: &[JournalRecord<E, K>],
    ) -> Result<(), PersistError> {
        let mut buf = Vec::with_capacity(records.len() * 96);
        for record in records {
            encode_line(record, &mut buf)?;
        }
        self.file.write_all(&buf)?;
        self.file.flush()?;
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> Result<(), PersistError> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }
}
