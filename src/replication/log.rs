//! Replication log: the durable queue of locally-originated ops
//! awaiting peer acknowledgement (distilled spec §4.6).
//!
//! WAL-backed and checkpointed exactly like `replication::meta_table`
//! and `manifest::Manifest`: every appended op goes through a `Wal<T>`
//! before being held in memory; `checkpoint` folds the live state (the
//! op queue plus per-peer cursors) into a checksummed snapshot file and
//! truncates the WAL.


use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::info;

use crate::clock::VersionVector;
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::wal::{Wal, WalError};

const SNAPSHOT_FILENAME: &str = "REPLOG-000001";
const SNAPSHOT_TMP_SUFFIX: &str = ".tmp";
const WAL_FILENAME: &str = "replication_log.wal";

#[derive(Debug, Error)]
pub enum ReplicationLogError {
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

/// A single replicated mutation, wire-compatible with the `Replicate`
/// RPC batch element (distilled spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOp {
    pub origin: u64,
    pub seq: u64,
    pub key: Vec<u8>,
    /// `None` for a delete (tombstone).
    pub value: Option<Vec<u8>>,
    pub lamport_ts: u64,
    pub vector: Option<VersionVector>,
    /// Set when this op was accepted by a sloppy-quorum substitute on
    /// behalf of an unreachable owner (distilled §4.8).
    pub hinted_for: Option<u64>,
    pub tx_id: Option<u64>,
}

impl LogOp {
    pub fn op_id(&self) -> String {
        crate::clock::op_id(self.origin, self.seq)
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

impl Encode for LogOp {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.origin.encode_to(buf)?;
        self.seq.encode_to(buf)?;
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        self.lamport_ts.encode_to(buf)?;
        self.vector.encode_to(buf)?;
        self.hinted_for.encode_to(buf)?;
        self.tx_id.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for LogOp {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (origin, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = Option::<Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (lamport_ts, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (vector, n) = Option::<VersionVector>::decode_from(&buf[offset..])?;
        offset += n;
        let (hinted_for, n) = Option::<u64>::decode_from(&buf[offset..])?;
        offset += n;
        let (tx_id, n) = Option::<u64>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self { origin, seq, key, value, lamport_ts, vector, hinted_for, tx_id },
            offset,
        ))
    }
}

#[derive(Debug)]
enum LogEvent {
    Append(LogOp),
    Ack { peer_id: u64, seq: u64 },
    Truncate { up_to_seq: u64 },
}

impl Encode for LogEvent {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            LogEvent::Append(op) => {
                0u32.encode_to(buf)?;
                op.encode_to(buf)?;
            }
            LogEvent::Ack { peer_id, seq } => {
                1u32.encode_to(buf)?;
                peer_id.encode_to(buf)?;
                seq.encode_to(buf)?;
            }
            LogEvent::Truncate { up_to_seq } => {
                2u32.encode_to(buf)?;
                up_to_seq.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for LogEvent {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (tag, n) = u32::decode_from(buf)?;
        offset += n;
        match tag {
            0 => {
                let (op, n) = LogOp::decode_from(&buf[offset..])?;
                offset += n;
                Ok((LogEvent::Append(op), offset))
            }
            1 => {
                let (peer_id, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                let (seq, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((LogEvent::Ack { peer_id, seq }, offset))
            }
            2 => {
                let (up_to_seq, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((LogEvent::Truncate { up_to_seq }, offset))
            }
            _ => Err(EncodingError::InvalidTag { tag, type_name: "LogEvent" }),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct LogSnapshotData {
    queue: BTreeMap<u64, LogOp>,
    cursors: BTreeMap<u64, u64>,
    next_seq: u64,
}

impl Encode for LogSnapshotData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let ops: Vec<LogOp> = self.queue.values().cloned().collect();
        encoding::encode_vec(&ops, buf)?;
        let cursors: Vec<(u64, u64)> = self.cursors.iter().map(|(&p, &s)| (p, s)).collect();
        encoding::encode_vec(&cursors, buf)?;
        self.next_seq.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for LogSnapshotData {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (ops, n) = encoding::decode_vec::<LogOp>(&buf[offset..])?;
        offset += n;
        let (cursors, n) = encoding::decode_vec::<(u64, u64)>(&buf[offset..])?;
        offset += n;
        let (next_seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                queue: ops.into_iter().map(|op| (op.seq, op)).collect(),
                cursors: cursors.into_iter().collect(),
                next_seq,
            },
            offset,
        ))
    }
}

#[derive(Debug)]
struct LogSnapshot {
    checksum: u32,
    data: LogSnapshotData,
}

impl Encode for LogSnapshot {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.data.encode_to(buf)?;
        self.checksum.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for LogSnapshot {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (data, n1) = LogSnapshotData::decode_from(buf)?;
        let (checksum, n2) = u32::decode_from(&buf[n1..])?;
        Ok((Self { checksum, data }, n1 + n2))
    }
}

struct Inner {
    queue: BTreeMap<u64, LogOp>,
    cursors: BTreeMap<u64, u64>,
    next_seq: u64,
}

/// Durable per-origin queue of ops this node originated, plus per-peer
/// ack cursors. Truncated up to `min_over_peers(last_seen_for_origin_self)`
/// (distilled §4.6).
pub struct ReplicationLog {
    path: PathBuf,
    wal: Wal<LogEvent>,
    inner: Mutex<Inner>,
}

impl ReplicationLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReplicationLogError> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let mut data = LogSnapshotData::default();
        let snapshot_path = path.join(SNAPSHOT_FILENAME);
        if snapshot_path.exists() {
            data = Self::read_snapshot(&snapshot_path)?;
        }

        let wal = Wal::<LogEvent>::open(path.join(WAL_FILENAME), None)?;
        let log = Self {
            path,
            wal,
            inner: Mutex::new(Inner { queue: data.queue, cursors: data.cursors, next_seq: data.next_seq }),
        };
        log.replay_wal()?;
        Ok(log)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("replication log mutex poisoned")
    }

    /// Appends a new locally-originated op, allocating the next
    /// sequence number for `origin` (always this node's own id).
    pub fn append(&self, origin: u64, mut op: LogOp) -> Result<LogOp, ReplicationLogError> {
        let mut inner = self.lock();
        op.origin = origin;
        op.seq = inner.next_seq;
        inner.next_seq += 1;
        drop(inner);

        self.wal.append(&LogEvent::Append(op.clone()))?;
        self.lock().queue.insert(op.seq, op.clone());
        Ok(op)
    }

    /// Ops with `seq` greater than `peer_id`'s cursor, oldest first,
    /// capped at `max_batch_size`.
    pub fn pending_for_peer(&self, peer_id: u64, max_batch_size: usize) -> Vec<LogOp> {
        let inner = self.lock();
        let cursor = inner.cursors.get(&peer_id).copied().unwrap_or(0);
        inner
            .queue
            .range((cursor + 1)..)
            .take(max_batch_size)
            .map(|(_, op)| op.clone())
            .collect()
    }

    /// Records that `peer_id` has acked through `seq`, then truncates
    /// any entries acked by every known peer.
    pub fn ack(&self, peer_id: u64, seq: u64) -> Result<(), ReplicationLogError> {
        {
            let mut inner = self.lock();
            let slot = inner.cursors.entry(peer_id).or_insert(0);
            if seq > *slot {
                *slot = seq;
            }
        }
        self.wal.append(&LogEvent::Ack { peer_id, seq })?;
        self.truncate_fully_acked()
    }

    fn truncate_fully_acked(&self) -> Result<(), ReplicationLogError> {
        let up_to = {
            let inner = self.lock();
            if inner.cursors.is_empty() {
                return Ok(());
            }
            inner.cursors.values().copied().min().unwrap_or(0)
        };
        {
            let mut inner = self.lock();
            inner.queue.retain(|&seq, _| seq > up_to);
        }
        self.wal.append(&LogEvent::Truncate { up_to_seq: up_to })?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    pub fn cursor_for(&self, peer_id: u64) -> u64 {
        self.lock().cursors.get(&peer_id).copied().unwrap_or(0)
    }

    pub fn checkpoint(&mut self) -> Result<(), ReplicationLogError> {
        let data = {
            let inner = self.lock();
            LogSnapshotData { queue: inner.queue.clone(), cursors: inner.cursors.clone(), next_seq: inner.next_seq }
        };

        let mut body = encoding::encode_to_vec(&data)?;
        let mut hasher = Crc32::new();
        hasher.update(&body);
        let checksum = hasher.finalize();

        let snapshot = LogSnapshot { checksum, data };
        body = encoding::encode_to_vec(&snapshot)?;

        let tmp_path = self.path.join(format!("{SNAPSHOT_FILENAME}{SNAPSHOT_TMP_SUFFIX}"));
        {
            let mut f = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
            f.write_all(&body)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, self.path.join(SNAPSHOT_FILENAME))?;
        info!("replication log snapshot written");

        self.wal.truncate()?;
        Ok(())
    }

    fn read_snapshot(p: &Path) -> Result<LogSnapshotData, ReplicationLogError> {
        let mut f = File::open(p)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        let (snap, _) = encoding::decode_from_slice::<LogSnapshot>(&buf)?;

        let verify = encoding::encode_to_vec(&snap.data)?;
        let mut hasher = Crc32::new();
        hasher.update(&verify);
        if hasher.finalize() != snap.checksum {
            return Err(ReplicationLogError::SnapshotChecksumMismatch);
        }
        Ok(snap.data)
    }

    fn replay_wal(&self) -> Result<(), ReplicationLogError> {
        let iter = self.wal.replay_iter()?;
        let mut inner = self.lock();
        for item in iter {
            match item {
                Ok(LogEvent::Append(op)) => {
                    inner.next_seq = inner.next_seq.max(op.seq + 1);
                    inner.queue.insert(op.seq, op);
                }
                Ok(LogEvent::Ack { peer_id, seq }) => {
                    let slot = inner.cursors.entry(peer_id).or_insert(0);
                    if seq > *slot {
                        *slot = seq;
                    }
                }
                Ok(LogEvent::Truncate { up_to_seq }) => {
                    inner.queue.retain(|&seq, _| seq > up_to_seq);
                }
                Err(_) => break,
            }
        }
        Ok(())
    }
}
