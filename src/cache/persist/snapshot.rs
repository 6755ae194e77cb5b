//! Full snapshot of the relation.
//!
//! Layout: one JSON header line, then the JSON body. The header pins the
//! format version, the generation, the body length and its SHA-256.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::{FORMAT_VERSION, PersistError};
use crate::cache::index::Index;
use crate::cache::keys::RegistryItem;

const MAGIC: &str = "eventcache-snapshot";

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    magic: String,
    version: u32,
    generation: u64,
    length: u64,
    checksum: String,
    created_at: String,
}

#[derive(Serialize)]
struct EntryRef<'a, E, K> {
    event: &'a E,
    keys: Vec<&'a K>,
}

#[derive(Deserialize)]
struct Entry<E, K> {
    event: E,
    keys: Vec<K>,
}

/// A decoded, verified snapshot.
pub(crate) struct Snapshot<E, K> {
    pub(crate) generation: u64,
    pub(crate) index: Index<E, K>,
}

pub(crate) fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize().to_vec())
}

/// Serialize `index` as a snapshot of `generation`.
pub(crate) fn encode<E: RegistryItem, K: RegistryItem>(
    generation: u64,
    index: &Index<E, K>,
) -> Result<Vec<u8>, PersistError> {
    let entries: Vec<EntryRef<'_, E, K>> = index
        .entries()
        .map(|(event, keys)| EntryRef {
            event,
            keys: keys.iter().collect(),
        })
        .collect();
    let body = serde_json::to_vec(&entries)?;

    let header = Header {
        magic: MAGIC.to_string(),
        version: FORMAT_VERSION,
        generation,
        length: body.len() as u64,
        checksum: checksum(&body),
        created_at: OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default(),
    };

    let mut out = serde_json::to_vec(&header)?;
    out.push(b'\n');
    out.extend_from_slice(&body);
    Ok(out)
}

/// Atomically replace the snapshot at `path` with `bytes`.
pub(crate) fn install(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let dir = path
        .parent()
        .ok_or_else(|| PersistError::malformed("snapshot path has no parent directory"))?;

    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| PersistError::Io(err.error))?;
    Ok(())
}

/// Read and verify the snapshot at `path`. `Ok(None)` when it does not exist.
pub(crate) fn read<E: RegistryItem, K: RegistryItem>(
    path: &Path,
) -> Result<Option<Snapshot<E, K>>, PersistError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    decode(&bytes).map(Some)
}

fn decode<E: RegistryItem, K: RegistryItem>(bytes: &[u8]) -> Result<Snapshot<E, K>, PersistError> {
    let split = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| PersistError::malformed("snapshot header is not terminated"))?;
    let (header_bytes, rest) = bytes.split_at(split);
    let body = &rest[1..];

    let header: Header = serde_json::from_slice(header_bytes)
        .map_err(|err| PersistError::malformed(format!("snapshot header: {err}")))?;

    if header.magic != MAGIC {
        return Err(PersistError::malformed(format!(
            "unexpected snapshot magic `{}`",
            header.magic
        )));
    }
    if header.version != FORMAT_VERSION {
        return Err(PersistError::VersionMismatch {
            found: header.version,
            expected: FORMAT_VERSION,
        });
    }
    if header.length != body.len() as u64 {
        return Err(PersistError::Torn {
            detail: format!(
                "snapshot body is {} bytes, header says {}",
                body.len(),
                header.length
            ),
        });
    }

    let found = checksum(body);
    if found != header.checksum {
        return Err(PersistError::Checksum {
            expected: header.checksum,
            found,
        });
    }

    let entries: Vec<Entry<E, K>> = serde_json::from_slice(body)
        .map_err(|err| PersistError::malformed(format!("snapshot body: {err}")))?;

    let mut index = Index::default();
    for entry in entries {
        for key in entry.keys {
            index.insert(entry.event.clone(), key);
        }
    }

    Ok(Snapshot {
        generation: header.generation,
        index,
    })
}
