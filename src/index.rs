//! Secondary-index hook: the small materialized `(field, value) -> keys`
//! multimap the core exposes to the out-of-scope secondary-index query
//! planner via `query_index`/`ListByIndex` (distilled spec §1, §6).
//!
//! The planner itself — choosing which fields to index, parsing
//! predicates — lives outside this crate. What lives here is the
//! durable multimap it reads and writes through: maintaining it is the
//! caller's responsibility (typically alongside a `Node::put`), exactly
//! as thin a hook as the distilled spec's external-interface list
//! implies. WAL-backed and checkpointed like [`crate::replication::meta_table::MetaTable`]:
//! every mutation goes through a `Wal<T>` before being held in memory,
//! `checkpoint` folds it into a checksummed snapshot and truncates the WAL.


use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::info;

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::wal::{Wal, WalError};

const SNAPSHOT_FILENAME: &str = "INDEX-000001";
const SNAPSHOT_TMP_SUFFIX: &str = ".tmp";
const WAL_FILENAME: &str = "index.wal";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("snapshot checksum mismatch")]
    SnapshotChecksumMismatch,
}

type IndexKey = (String, Vec<u8>);

#[derive(Debug)]
enum IndexEvent {
    Insert { field: String, value: Vec<u8>, key: Vec<u8> },
    Remove { field: String, value: Vec<u8>, key: Vec<u8> },
}

impl Encode for IndexEvent {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            IndexEvent::Insert { field, value, key } => {
                0u32.encode_to(buf)?;
                field.encode_to(buf)?;
                value.encode_to(buf)?;
                key.encode_to(buf)?;
            }
            IndexEvent::Remove { field, value, key } => {
                1u32.encode_to(buf)?;
                field.encode_to(buf)?;
                value.encode_to(buf)?;
                key.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for IndexEvent {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (tag, n) = u32::decode_from(buf)?;
        offset += n;
        let (field, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let event = match tag {
            0 => IndexEvent::Insert { field, value, key },
            1 => IndexEvent::Remove { field, value, key },
            _ => return Err(EncodingError::InvalidTag { tag, type_name: "IndexEvent" }),
        };
        Ok((event, offset))
    }
}

#[derive(Debug, Default, Clone)]
struct IndexSnapshotData {
    entries: BTreeMap<IndexKey, BTreeSet<Vec<u8>>>,
}

impl Encode for IndexSnapshotData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let rows: Vec<(String, Vec<u8>, Vec<Vec<u8>>)> = self
            .entries
            .iter()
            .map(|((field, value), keys)| (field.clone(), value.clone(), keys.iter().cloned().collect()))
            .collect();
        encoding::encode_vec(&rows, buf)
    }
}

impl Decode for IndexSnapshotData {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (rows, n) = encoding::decode_vec::<(String, Vec<u8>, Vec<Vec<u8>>)>(buf)?;
        let entries = rows
            .into_iter()
            .map(|(field, value, keys)| ((field, value), keys.into_iter().collect()))
            .collect();
        Ok((Self { entries }, n))
    }
}

impl Encode for (String, Vec<u8>, Vec<Vec<u8>>) {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.0.encode_to(buf)?;
        self.1.encode_to(buf)?;
        encoding::encode_vec(&self.2, buf)?;
        Ok(())
    }
}

impl Decode for (String, Vec<u8>, Vec<Vec<u8>>) {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (field, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (keys, n) = encoding::decode_vec::<Vec<u8>>(&buf[offset..])?;
        offset += n;
        Ok(((field, value, keys), offset))
    }
}

#[derive(Debug)]
struct IndexSnapshot {
    checksum: u32,
    data: IndexSnapshotData,
}

impl Encode for IndexSnapshot {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.data.encode_to(buf)?;
        self.checksum.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for IndexSnapshot {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (data, n1) = IndexSnapshotData::decode_from(buf)?;
        let (checksum, n2) = u32::decode_from(&buf[n1..])?;
        Ok((Self { checksum, data }, n1 + n2))
    }
}

/// WAL-backed, checkpointed `(field, value) -> {key}` multimap.
pub struct IndexTable {
    path: PathBuf,
    wal: Wal<IndexEvent>,
    data: Mutex<BTreeMap<IndexKey, BTreeSet<Vec<u8>>>>,
}

impl IndexTable {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let snapshot_path = path.join(SNAPSHOT_FILENAME);
        let entries = if snapshot_path.exists() {
            Self::read_snapshot(&snapshot_path)?
        } else {
            BTreeMap::new()
        };

        let wal = Wal::<IndexEvent>::open(path.join(WAL_FILENAME), None)?;
        let table = Self { path, wal, data: Mutex::new(entries) };
        table.replay_wal()?;
        Ok(table)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<IndexKey, BTreeSet<Vec<u8>>>> {
        self.data.lock().expect("index table mutex poisoned")
    }

    /// Records that `key` currently carries `value` for `field`.
    pub fn insert(&self, field: &str, value: Vec<u8>, key: Vec<u8>) -> Result<(), IndexError> {
        self.wal.append(&IndexEvent::Insert { field: field.to_string(), value: value.clone(), key: key.clone() })?;
        self.lock().entry((field.to_string(), value)).or_default().insert(key);
        Ok(())
    }

    /// Drops `key` from the `(field, value)` bucket, e.g. on delete or
    /// on re-index after an update.
    pub fn remove(&self, field: &str, value: Vec<u8>, key: Vec<u8>) -> Result<(), IndexError> {
        self.wal.append(&IndexEvent::Remove { field: field.to_string(), value: value.clone(), key: key.clone() })?;
        if let Some(set) = self.lock().get_mut(&(field.to_string(), value)) {
            set.remove(&key);
        }
        Ok(())
    }

    /// `ListByIndex(field, value)`: every key currently tagged with
    /// `value` under `field`, in key order.
    pub fn query(&self, field: &str, value: &[u8]) -> Vec<Vec<u8>> {
        self.lock()
            .get(&(field.to_string(), value.to_vec()))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn checkpoint(&mut self) -> Result<(), IndexError> {
        let data = IndexSnapshotData { entries: self.lock().clone() };
        let mut body = encoding::encode_to_vec(&data)?;
        let mut hasher = Crc32::new();
        hasher.update(&body);
        let checksum = hasher.finalize();

        let snapshot = IndexSnapshot { checksum, data };
        body = encoding::encode_to_vec(&snapshot)?;

        let tmp_path = self.path.join(format!("{SNAPSHOT_FILENAME}{SNAPSHOT_TMP_SUFFIX}"));
        {
            let mut f = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
            f.write_all(&body)?;
            f.sync_all()?;
        }
        let final_path = self.path.join(SNAPSHOT_FILENAME);
        fs::rename(&tmp_path, &final_path)?;
        info!("index table snapshot written to {:?}", final_path);

        self.wal.truncate()?;
        Ok(())
    }

    fn read_snapshot(p: &Path) -> Result<BTreeMap<IndexKey, BTreeSet<Vec<u8>>>, IndexError> {
        let mut f = File::open(p)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        let (snap, _) = encoding::decode_from_slice::<IndexSnapshot>(&buf)?;

        let verify_bytes = encoding::encode_to_vec(&snap.data)?;
        let mut hasher = Crc32::new();
        hasher.update(&verify_bytes);
        if hasher.finalize() != snap.checksum {
            return Err(IndexError::SnapshotChecksumMismatch);
        }
        Ok(snap.data.entries)
    }

    fn replay_wal(&self) -> Result<(), IndexError> {
        let iter = self.wal.replay_iter()?;
        for item in iter {
            match item {
                Ok(IndexEvent::Insert { field, value, key }) => {
                    self.lock().entry((field, value)).or_default().insert(key);
                }
                Ok(IndexEvent::Remove { field, value, key }) => {
                    if let Some(set) = self.lock().get_mut(&(field, value)) {
                        set.remove(&key);
                    }
                }
                Err(_) => break,
            }
        }
        Ok(())
    }
}
