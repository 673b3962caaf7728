//! Partition map: hash or range partitioning strategy, split/merge, and
//! the monotonic `map_epoch` (distilled spec §4.10/§4.13).
//!
//! Persisted as `partition_map.json` per the external interface layout
//! (distilled spec §6); the bytes on disk are the crate's own
//! `encoding::{Encode, Decode}` codec — the same convention
//! `manifest::Manifest` and `replication::meta_table::MetaTable` use for
//! their own "one checkpoint file, atomically replaced" state — rather
//! than a text format, so the partition map shares its crash-recovery
//! story with the rest of the node's persisted state.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::cluster::hash_ring::HashRing;
use crate::config::PartitionStrategy;
use crate::encoding::{self, Decode, Encode, EncodingError};

const PARTITION_MAP_FILENAME: &str = "partition_map.json";
const PARTITION_MAP_TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("unknown partition {0}")]
    UnknownPartition(u64),

    #[error("partitions {0} and {1} are not adjacent; cannot merge")]
    NotAdjacent(u64, u64),

    #[error("split key does not fall inside partition {0}'s range")]
    SplitKeyOutOfRange(u64),

    #[error("ring has no nodes to place partitions on")]
    EmptyRing,
}

/// `(pid, key_range, owner, replicas, item_count, op_count)` (distilled
/// spec §3). `high` is exclusive; `None` means "open end of keyspace".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub pid: u64,
    pub low: Vec<u8>,
    pub high: Option<Vec<u8>>,
    pub owner: u64,
    pub replicas: Vec<u64>,
    pub item_count: u64,
    pub op_count: u64,
}

impl Partition {
    fn contains(&self, key: &[u8]) -> bool {
        key >= self.low.as_slice() && self.high.as_deref().is_none_or(|h| key < h)
    }
}

impl Encode for Partition {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.pid.encode_to(buf)?;
        self.low.encode_to(buf)?;
        self.high.encode_to(buf)?;
        self.owner.encode_to(buf)?;
        encoding::encode_vec(&self.replicas, buf)?;
        self.item_count.encode_to(buf)?;
        self.op_count.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for Partition {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (pid, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (low, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (high, n) = Option::<Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (owner, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (replicas, n) = encoding::decode_vec::<u64>(&buf[offset..])?;
        offset += n;
        let (item_count, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (op_count, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self { pid, low, high, owner, replicas, item_count, op_count },
            offset,
        ))
    }
}

impl Encode for Vec<u64> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::encode_vec(self, buf)
    }
}

impl Decode for Vec<u64> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        encoding::decode_vec::<u64>(buf)
    }
}

#[derive(Debug, Clone, Default)]
struct PartitionMapData {
    partitions: Vec<Partition>,
    map_epoch: u64,
}

impl Encode for PartitionMapData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::encode_vec(&self.partitions, buf)?;
        self.map_epoch.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for PartitionMapData {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (partitions, n) = encoding::decode_vec::<Partition>(&buf[offset..])?;
        offset += n;
        let (map_epoch, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { partitions, map_epoch }, offset))
    }
}

/// Strategy-specific state. Hash and range partitioning are mutually
/// exclusive alternatives (distilled spec §9's open-question
/// resolution), never combined on one `Partitioner`.
#[derive(Debug, Clone)]
enum Strategy {
    Hash { ring: HashRing, partitions_per_node: usize },
    Range,
}

/// Owns the partition map for one node's view of the cluster: which
/// pids exist, their key ranges, owners, and replica sets, plus the
/// monotonic `map_epoch` bumped by every topology change.
#[derive(Debug)]
pub struct Partitioner {
    strategy: Strategy,
    partitions: Vec<Partition>,
    replication_factor: usize,
    next_pid: u64,
    map_epoch: u64,
    dir: Option<PathBuf>,
}

impl Partitioner {
    pub fn new_hash(replication_factor: usize, partitions_per_node: usize) -> Self {
        Self {
            strategy: Strategy::Hash { ring: HashRing::new(), partitions_per_node },
            partitions: Vec::new(),
            replication_factor,
            next_pid: 0,
            map_epoch: 0,
            dir: None,
        }
    }

    pub fn new_range(replication_factor: usize, num_partitions: usize) -> Self {
        let mut p = Self {
            strategy: Strategy::Range,
            partitions: Vec::new(),
            replication_factor,
            next_pid: 0,
            map_epoch: 0,
            dir: None,
        };
        if num_partitions > 0 {
            // A single unbounded partition to start; real boundaries are
            // established once nodes and keys exist (via splits).
            p.partitions.push(Partition {
                pid: 0,
                low: Vec::new(),
                high: None,
                owner: 0,
                replicas: Vec::new(),
                item_count: 0,
                op_count: 0,
            });
            p.next_pid = 1;
        }
        p
    }

    pub fn from_strategy(strategy: PartitionStrategy, replication_factor: usize, partitions_per_node: usize, num_partitions: usize) -> Self {
        match strategy {
            PartitionStrategy::Hash => Self::new_hash(replication_factor, partitions_per_node),
            PartitionStrategy::Range => Self::new_range(replication_factor, num_partitions),
        }
    }

    pub fn map_epoch(&self) -> u64 {
        self.map_epoch
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Adds a physical node to the ring (hash mode only) and rebuilds
    /// the partition map from the new ring layout, bumping `map_epoch`.
    /// No-op bump for range mode: the owner-reassignment for a freshly
    /// added node in range mode is a `rebalance()` concern, handled by
    /// the node layer, not the partitioner itself.
    pub fn add_node(&mut self, node_id: u64) -> Result<(), PartitionError> {
        match &mut self.strategy {
            Strategy::Hash { ring, partitions_per_node } => {
                let vnodes = *partitions_per_node;
                ring.add_node(node_id, vnodes);
                self.rebuild_from_ring()?;
            }
            Strategy::Range => {
                if self.partitions.is_empty() {
                    return Err(PartitionError::EmptyRing);
                }
                // First node added becomes the initial owner of every
                // existing (unowned) partition.
                for p in &mut self.partitions {
                    if p.replicas.is_empty() {
                        p.owner = node_id;
                    }
                    if !p.replicas.contains(&node_id) {
                        p.replicas.push(node_id);
                        p.replicas.truncate(self.replication_factor.max(1));
                    }
                }
                self.map_epoch += 1;
            }
        }
        Ok(())
    }

    pub fn remove_node(&mut self, node_id: u64) -> Result<(), PartitionError> {
        match &mut self.strategy {
            Strategy::Hash { ring, .. } => {
                ring.remove_node(node_id);
                self.rebuild_from_ring()?;
            }
            Strategy::Range => {
                for p in &mut self.partitions {
                    p.replicas.retain(|&r| r != node_id);
                    if p.owner == node_id {
                        p.owner = p.replicas.first().copied().unwrap_or(0);
                    }
                }
                self.map_epoch += 1;
            }
        }
        Ok(())
    }

    fn rebuild_from_ring(&mut self) -> Result<(), PartitionError> {
        let Strategy::Hash { ring, .. } = &self.strategy else {
            return Ok(());
        };
        if ring.is_empty() {
            self.partitions.clear();
            self.map_epoch += 1;
            return Ok(());
        }
        // Preserve existing item/op counters when a vnode segment's
        // boundaries survive the rebuild unchanged (same pid index,
        // same owner); otherwise start fresh counters. Virtual-node
        // segments are ordered by ring position, not key value — the
        // ring does not expose key boundaries directly, so `low`/`high`
        // stay empty/open for hash-mode partitions; ring placement
        // (not partition range) determines ownership (§4.10).
        let mut rebuilt = Vec::with_capacity(ring.segment_count());
        for idx in 0..ring.segment_count() {
            let owner = ring.segment_owner(idx).expect("idx within segment_count");
            let preserved = self.partitions.get(idx).filter(|p| p.pid == idx as u64);
            rebuilt.push(Partition {
                pid: idx as u64,
                low: Vec::new(),
                high: None,
                owner,
                replicas: Vec::new(),
                item_count: preserved.map(|p| p.item_count).unwrap_or(0),
                op_count: preserved.map(|p| p.op_count).unwrap_or(0),
            });
        }
        self.partitions = rebuilt;
        self.next_pid = self.partitions.len() as u64;
        self.map_epoch += 1;
        Ok(())
    }

    /// Preference list for `key`: first `n` distinct nodes. Hash mode
    /// delegates straight to the ring (distilled spec §4.10); range mode
    /// returns the owning partition's `replicas`.
    pub fn owners_for_key(&self, key: &[u8], n: usize) -> Vec<u64> {
        match &self.strategy {
            Strategy::Hash { ring, .. } => ring.owners_for_key(key, n),
            Strategy::Range => self
                .partitions
                .iter()
                .find(|p| p.contains(key))
                .map(|p| p.replicas.iter().take(n).copied().collect())
                .unwrap_or_default(),
        }
    }

    pub fn partition_id_for_key(&self, key: &[u8]) -> Option<u64> {
        match &self.strategy {
            Strategy::Hash { ring, .. } => ring.segment_for_key(key).map(|idx| idx as u64),
            Strategy::Range => self.partitions.iter().find(|p| p.contains(key)).map(|p| p.pid),
        }
    }

    pub fn partition(&self, pid: u64) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.pid == pid)
    }

    /// Explicitly reassigns a partition's owner, adding it to the
    /// replica set if it isn't already there. Range mode has no ring to
    /// derive ownership from, so rebalancing there means a direct
    /// reassignment rather than `add_node`/`remove_node`'s automatic
    /// rebuild; hash mode accepts this too (e.g. to even out a manual
    /// rebalance) even though ring placement will win back on the next
    /// topology change. Bumps `map_epoch`.
    pub fn reassign_owner(&mut self, pid: u64, owner: u64) -> Result<(), PartitionError> {
        let replication_factor = self.replication_factor;
        let partition = self
            .partitions
            .iter_mut()
            .find(|p| p.pid == pid)
            .ok_or(PartitionError::UnknownPartition(pid))?;
        partition.owner = owner;
        if !partition.replicas.contains(&owner) {
            partition.replicas.push(owner);
            partition.replicas.truncate(replication_factor.max(1));
        }
        self.map_epoch += 1;
        Ok(())
    }

    /// Splits `pid` at `split_key`: `(low, high)` becomes `(low,
    /// split_key)` and `(split_key, high)`. Hash-mode records "stay in
    /// place" (ownership follows the ring, not the pid boundary, so a
    /// hash-mode split only subdivides bookkeeping, no data movement);
    /// range-mode splits require the caller to migrate records with key
    /// `>= split_key` to the new partition's owner (distilled §4.10).
    /// Bumps `map_epoch`.
    pub fn split(&mut self, pid: u64, split_key: Vec<u8>) -> Result<(u64, u64), PartitionError> {
        let idx = self
            .partitions
            .iter()
            .position(|p| p.pid == pid)
            .ok_or(PartitionError::UnknownPartition(pid))?;
        let parent = self.partitions[idx].clone();
        if split_key <= parent.low || parent.high.as_ref().is_some_and(|h| &split_key >= h) {
            return Err(PartitionError::SplitKeyOutOfRange(pid));
        }

        let left_pid = parent.pid;
        let right_pid = self.next_pid;
        self.next_pid += 1;

        let left = Partition {
            pid: left_pid,
            low: parent.low.clone(),
            high: Some(split_key.clone()),
            owner: parent.owner,
            replicas: parent.replicas.clone(),
            item_count: 0,
            op_count: 0,
        };
        let right = Partition {
            pid: right_pid,
            low: split_key,
            high: parent.high.clone(),
            owner: parent.owner,
            replicas: parent.replicas.clone(),
            item_count: 0,
            op_count: 0,
        };

        self.partitions.splice(idx..idx + 1, [left, right]);
        self.map_epoch += 1;
        info!(pid = left_pid, new_pid = right_pid, epoch = self.map_epoch, "partition split");
        Ok((left_pid, right_pid))
    }

    /// Merges two adjacent pids (`high` of one equals `low` of the
    /// other). Fails if they are not contiguous.
    pub fn merge(&mut self, pid1: u64, pid2: u64) -> Result<u64, PartitionError> {
        let idx1 = self.partitions.iter().position(|p| p.pid == pid1).ok_or(PartitionError::UnknownPartition(pid1))?;
        let idx2 = self.partitions.iter().position(|p| p.pid == pid2).ok_or(PartitionError::UnknownPartition(pid2))?;

        let (left_idx, right_idx) = if idx1 < idx2 { (idx1, idx2) } else { (idx2, idx1) };
        let left = self.partitions[left_idx].clone();
        let right = self.partitions[right_idx].clone();

        if left.high.as_ref() != Some(&right.low) {
            return Err(PartitionError::NotAdjacent(pid1, pid2));
        }

        let merged = Partition {
            pid: left.pid,
            low: left.low,
            high: right.high,
            owner: left.owner,
            replicas: left.replicas,
            item_count: left.item_count + right.item_count,
            op_count: left.op_count + right.op_count,
        };

        // Remove the higher index first so the lower index stays valid.
        self.partitions.remove(right_idx);
        self.partitions[left_idx] = merged;
        self.map_epoch += 1;
        info!(pid = left.pid, absorbed = right.pid, epoch = self.map_epoch, "partitions merged");
        Ok(left.pid)
    }

    /// Accepts a replicated partition map update only if its epoch is
    /// strictly greater than the local one (distilled §4.13).
    pub fn apply_remote_map(&mut self, partitions: Vec<Partition>, epoch: u64) -> bool {
        if epoch <= self.map_epoch {
            return false;
        }
        self.partitions = partitions;
        self.map_epoch = epoch;
        true
    }

    pub fn persist(&self, dir: impl AsRef<Path>) -> Result<(), PartitionError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let data = PartitionMapData { partitions: self.partitions.clone(), map_epoch: self.map_epoch };
        let body = encoding::encode_to_vec(&data)?;

        let tmp_path = dir.join(format!("{PARTITION_MAP_FILENAME}{PARTITION_MAP_TMP_SUFFIX}"));
        {
            let mut f = File::create(&tmp_path)?;
            f.write_all(&body)?;
            f.sync_all()?;
        }
        let final_path = dir.join(PARTITION_MAP_FILENAME);
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    pub fn load(&mut self, dir: impl AsRef<Path>) -> Result<bool, PartitionError> {
        let path = dir.as_ref().join(PARTITION_MAP_FILENAME);
        if !path.exists() {
            return Ok(false);
        }
        let mut f = File::open(&path)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        let (data, _) = encoding::decode_from_slice::<PartitionMapData>(&buf)?;
        self.partitions = data.partitions;
        self.map_epoch = data.map_epoch;
        Ok(true)
    }
}
