//! # MetaTable
//!
//! Per-key replication metadata, tracked independently of the value
//! storage in [`crate::engine::Engine`].
//!
//! The engine's on-disk `Record` format (see `engine::utils`) is a
//! single-node design: `key, value, lsn, timestamp`. Rather than widen
//! that format (and every SSTable cell and the ~30 existing engine/WAL
//! tests built against it) with `origin`/`lamport_ts`/`seq`/`vector`
//! fields, those fields live here, in a second WAL-backed, checkpointed
//! map, keyed by the same raw key bytes. The quorum coordinator
//! consults `MetaTable` to decide whether an incoming write wins before
//! ever calling `Engine::put`/`Engine::delete`, so the LSM engine only
//! ever stores the one current winning value per key — unchanged from
//! how the teacher engine already behaves.
//!
//! This is the manifest's WAL + snapshot model (see `manifest::Manifest`)
//! generalized to a second payload type: a fixed-name WAL plus a
//! checksummed snapshot file, replayed on open.


use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{info, warn};

use crate::clock::VersionVector;
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::wal::{Wal, WalError};

const SNAPSHOT_TMP_SUFFIX: &str = ".tmp";
const SNAPSHOT_FILENAME: &str = "META-000001";
const WAL_FILENAME: &str = "meta.wal";

#[derive(Debug, Error)]
pub enum MetaTableError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("snapshot checksum mismatch")]
    SnapshotChecksumMismatch,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Replication metadata recorded for a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaEntry {
    /// Node id that authored the current winning value.
    pub origin: u64,
    /// Lamport timestamp of the current winning value.
    pub lamport_ts: u64,
    /// Per-origin op sequence number, for at-least-once dedup.
    pub seq: u64,
    /// Present only in vector-consistency mode.
    pub vector: Option<VersionVector>,
    /// True if the current winning value is a delete.
    pub tombstone: bool,
}

impl Encode for MetaEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.origin.encode_to(buf)?;
        self.lamport_ts.encode_to(buf)?;
        self.seq.encode_to(buf)?;
        self.vector.encode_to(buf)?;
        self.tombstone.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for MetaEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (origin, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (lamport_ts, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (vector, n) = Option::<VersionVector>::decode_from(&buf[offset..])?;
        offset += n;
        let (tombstone, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                origin,
                lamport_ts,
                seq,
                vector,
                tombstone,
            },
            offset,
        ))
    }
}

/// WAL record: a single key's metadata was written, or the whole table
/// was cleared (used only by tests and by the tombstone-retention
/// sweep, which removes expired entries one at a time via `Remove`).
#[derive(Debug)]
enum MetaEvent {
    Put { key: Vec<u8>, entry: MetaEntry },
    Remove { key: Vec<u8> },
}

impl Encode for MetaEvent {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            MetaEvent::Put { key, entry } => {
                0u32.encode_to(buf)?;
                key.encode_to(buf)?;
                entry.encode_to(buf)?;
            }
            MetaEvent::Remove { key } => {
                1u32.encode_to(buf)?;
                key.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for MetaEvent {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (tag, n) = u32::decode_from(buf)?;
        offset += n;
        match tag {
            0 => {
                let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                let (entry, n) = MetaEntry::decode_from(&buf[offset..])?;
                offset += n;
                Ok((MetaEvent::Put { key, entry }, offset))
            }
            1 => {
                let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                Ok((MetaEvent::Remove { key }, offset))
            }
            _ => Err(EncodingError::InvalidTag {
                tag,
                type_name: "MetaEvent",
            }),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct MetaSnapshotData {
    entries: BTreeMap<Vec<u8>, MetaEntry>,
}

impl Encode for MetaSnapshotData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let pairs: Vec<(Vec<u8>, MetaEntry)> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        encoding::encode_vec(&pairs, buf)
    }
}

impl Decode for MetaSnapshotData {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (pairs, n) = encoding::decode_vec::<(Vec<u8>, MetaEntry)>(buf)?;
        Ok((
            Self {
                entries: pairs.into_iter().collect(),
            },
            n,
        ))
    }
}

impl Encode for (Vec<u8>, MetaEntry) {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.0.encode_to(buf)?;
        self.1.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for (Vec<u8>, MetaEntry) {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (k, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (v, n) = MetaEntry::decode_from(&buf[offset..])?;
        offset += n;
        Ok(((k, v), offset))
    }
}

#[derive(Debug)]
struct MetaSnapshot {
    checksum: u32,
    data: MetaSnapshotData,
}

impl Encode for MetaSnapshot {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.data.encode_to(buf)?;
        self.checksum.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for MetaSnapshot {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (data, n1) = MetaSnapshotData::decode_from(buf)?;
        let (checksum, n2) = u32::decode_from(&buf[n1..])?;
        Ok((Self { checksum, data }, n1 + n2))
    }
}

/// WAL-backed, checkpointed map from raw key bytes to [`MetaEntry`].
///
/// Mirrors `manifest::Manifest`: every mutation is appended to a
/// dedicated WAL before being applied in memory; `checkpoint` folds the
/// in-memory state into a checksummed snapshot and truncates the WAL.
#[derive(Debug)]
pub struct MetaTable {
    path: PathBuf,
    wal: Wal<MetaEvent>,
    data: Mutex<BTreeMap<Vec<u8>, MetaEntry>>,
}

impl MetaTable {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetaTableError> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let snapshot_path = path.join(SNAPSHOT_FILENAME);
        let mut data = BTreeMap::new();

        if snapshot_path.exists() {
            match Self::read_snapshot(&snapshot_path) {
                Ok(d) => {
                    data = d;
                    info!("loaded meta table snapshot from {:?}", snapshot_path);
                }
                Err(e) => {
                    warn!(
                        "failed to read meta table snapshot {:?}: {}; falling back to full WAL replay",
                        snapshot_path, e
                    );
                }
            }
        }

        let wal_path = path.join(WAL_FILENAME);
        let wal = Wal::<MetaEvent>::open(&wal_path, None)?;

        let table = MetaTable {
            path,
            wal,
            data: Mutex::new(data),
        };

        table.replay_wal()?;
        Ok(table)
    }

    fn lock_data(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<Vec<u8>, MetaEntry>>, MetaTableError> {
        self.data
            .lock()
            .map_err(|_| MetaTableError::Internal("mutex poisoned".into()))
    }

    /// Current metadata for `key`, if any has been recorded.
    pub fn get(&self, key: &[u8]) -> Result<Option<MetaEntry>, MetaTableError> {
        Ok(self.lock_data()?.get(key).cloned())
    }

    /// Records new winning metadata for `key`.
    pub fn put(&self, key: Vec<u8>, entry: MetaEntry) -> Result<(), MetaTableError> {
        let rec = MetaEvent::Put {
            key: key.clone(),
            entry: entry.clone(),
        };
        self.wal.append(&rec)?;
        self.lock_data()?.insert(key, entry);
        Ok(())
    }

    /// Drops metadata for `key` entirely (used by tombstone-retention
    /// expiry, not by ordinary deletes — a delete still needs a
    /// tombstone entry so late-arriving stale writes lose to it).
    pub fn remove(&self, key: &[u8]) -> Result<(), MetaTableError> {
        let rec = MetaEvent::Remove { key: key.to_vec() };
        self.wal.append(&rec)?;
        self.lock_data()?.remove(key);
        Ok(())
    }

    /// Keys whose metadata is a tombstone older than `retention`
    /// relative to `now_lamport` (an approximate, logical-clock-based
    /// notion of age — see `SPEC_FULL.md` §4.9).
    pub fn expired_tombstones(&self, max_lamport_ts: u64) -> Result<Vec<Vec<u8>>, MetaTableError> {
        Ok(self
            .lock_data()?
            .iter()
            .filter(|(_, e)| e.tombstone && e.lamport_ts <= max_lamport_ts)
            .map(|(k, _)| k.clone())
            .collect())
    }

    pub fn len(&self) -> Result<usize, MetaTableError> {
        Ok(self.lock_data()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, MetaTableError> {
        Ok(self.lock_data()?.is_empty())
    }

    /// Snapshot of every `(key, entry)` pair whose key falls in
    /// `[low, high)` (`high = None` means unbounded), ordered by key.
    /// Used by Merkle tree construction, which needs a stable full scan
    /// rather than point lookups.
    pub fn entries_in_range(
        &self,
        low: &[u8],
        high: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, MetaEntry)>, MetaTableError> {
        Ok(self
            .lock_data()?
            .range(low.to_vec()..)
            .take_while(|(k, _)| high.is_none_or(|h| k.as_slice() < h))
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect())
    }

    /// Folds current state into a checksummed snapshot and truncates the
    /// WAL. See `manifest::Manifest::checkpoint` for the identical
    /// temp-file-then-rename durability sequence.
    pub fn checkpoint(&mut self) -> Result<(), MetaTableError> {
        let data = MetaSnapshotData {
            entries: self.lock_data()?.clone(),
        };

        let mut body = encoding::encode_to_vec(&data)?;
        let mut hasher = Crc32::new();
        hasher.update(&body);
        let checksum = hasher.finalize();

        let snapshot = MetaSnapshot { checksum, data };
        body = encoding::encode_to_vec(&snapshot)?;

        let tmp_name = format!("{SNAPSHOT_FILENAME}{SNAPSHOT_TMP_SUFFIX}");
        let tmp_path = self.path.join(&tmp_name);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(&body)?;
            f.sync_all()?;
        }

        let final_path = self.path.join(SNAPSHOT_FILENAME);
        fs::rename(&tmp_path, &final_path)?;
        Self::fsync_dir(&self.path)?;

        info!("meta table snapshot written to {:?}", final_path);

        self.wal.truncate()?;
        Ok(())
    }

    fn fsync_dir(dir: &Path) -> Result<(), MetaTableError> {
        let dir_file = File::open(dir)?;
        dir_file.sync_all()?;
        Ok(())
    }

    fn read_snapshot(p: &Path) -> Result<BTreeMap<Vec<u8>, MetaEntry>, MetaTableError> {
        let mut f = File::open(p)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;

        let (snap, _) = encoding::decode_from_slice::<MetaSnapshot>(buf.as_slice())?;

        let verify_bytes = encoding::encode_to_vec(&snap.data)?;
        let mut hasher = Crc32::new();
        hasher.update(&verify_bytes);
        let computed = hasher.finalize();

        if computed != snap.checksum {
            return Err(MetaTableError::SnapshotChecksumMismatch);
        }

        Ok(snap.data.entries)
    }

    fn replay_wal(&self) -> Result<(), MetaTableError> {
        let iter = self.wal.replay_iter()?;
        let mut count = 0u64;
        for item in iter {
            match item {
                Ok(rec) => {
                    self.apply_record(&rec)?;
                    count += 1;
                }
                Err(e) => {
                    warn!("meta table WAL replay stopped due to WAL error: {}", e);
                    break;
                }
            }
        }
        info!("meta table WAL replay: {} entries applied", count);
        Ok(())
    }

    fn apply_record(&self, rec: &MetaEvent) -> Result<(), MetaTableError> {
        let mut data = self.lock_data()?;
        match rec {
            MetaEvent::Put { key, entry } => {
                data.insert(key.clone(), entry.clone());
            }
            MetaEvent::Remove { key } => {
                data.remove(key);
            }
        }
        Ok(())
    }
}
