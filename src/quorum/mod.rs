//! Quorum coordinator: the write/read path a client-facing `put`/`get`
//! actually runs (distilled spec §4.4, §4.11).
//!
//! A write is coordinated by one of the key's owning replicas (the
//! caller rejects with [`QuorumError::NotOwner`] otherwise, matching
//! the `DbError::NotOwner` kind callers are expected to retry against
//! the returned owner). The coordinator ticks the Lamport clock,
//! assigns a sequence number via [`crate::replication::log::ReplicationLog`],
//! applies the write to its own storage, and pushes it synchronously to
//! the remaining owners, counting replies toward `write_quorum` (or
//! every owner, under [`crate::config::DbConfig::strong_consistency`]).
//! An owner that can't be reached has its write durably queued in this
//! node's own [`crate::replication::hinted_handoff::HintedHandoff`]
//! store instead — Dynamo's sloppy quorum: the hint still counts toward
//! the write's quorum, and is relayed once the owner is seen live again.
//! Strong consistency is the one exception: it needs every preferred
//! owner to ack for real, so an unreachable owner isn't papered over
//! with a hint there — it just counts as a miss against `owners.len()`.
//!
//! A read queries the same preference list for `Vec<RecordReply>` per
//! replica (plural, so a replica holding concurrent vector-mode
//! siblings can report all of them), merges everything through
//! [`merge_siblings`], and read-repairs any replica whose reply
//! disagreed with the merged winner.
//!
//! The engine's on-disk `Record` only ever holds one opaque value per
//! key (see `meta_table`'s module doc); what that blob actually holds
//! here is an encoded `Vec<SiblingValue>` — almost always length one,
//! longer only while vector-consistency mode has an unresolved
//! concurrent write outstanding for that key.


use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::clock::{LamportClock, VersionVector};
use crate::cluster::Partitioner;
use crate::crdt::{Candidate, GCounter, MergeStrategy, Resolution};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::engine::{Engine, EngineError};
use crate::replication::heartbeat::Heartbeat;
use crate::replication::hinted_handoff::{HintError, HintedHandoff};
use crate::replication::log::{LogOp, ReplicationLog, ReplicationLogError};
use crate::replication::meta_table::{MetaEntry, MetaTable, MetaTableError};
use crate::replication::transport::{DeleteRequest, PeerRpc, PutRequest, RecordReply, TransportError};

#[derive(Debug, Error)]
pub enum QuorumError {
    #[error("no replica currently owns this key")]
    NoOwners,

    #[error("not the owner of this key; retry against {owner}")]
    NotOwner { owner: u64, epoch: u64 },

    #[error("quorum not met: needed {needed}, got {got}")]
    NotMet { needed: usize, got: usize },

    #[error("meta table error: {0}")]
    MetaTable(#[from] MetaTableError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("replication log error: {0}")]
    ReplicationLog(#[from] ReplicationLogError),

    #[error("hint store error: {0}")]
    Hint(#[from] HintError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

pub type QuorumResult<T> = Result<T, QuorumError>;

/// One value as known to a single replica: the payload (`None` for a
/// tombstone) plus the metadata needed to order it against others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiblingValue {
    pub value: Option<Vec<u8>>,
    pub lamport_ts: u64,
    pub origin: u64,
    pub seq: u64,
    pub vector: Option<VersionVector>,
}

impl Encode for SiblingValue {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.value.encode_to(buf)?;
        self.lamport_ts.encode_to(buf)?;
        self.origin.encode_to(buf)?;
        self.seq.encode_to(buf)?;
        self.vector.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SiblingValue {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (value, n) = Option::<Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (lamport_ts, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (origin, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (vector, n) = Option::<VersionVector>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { value, lamport_ts, origin, seq, vector }, offset))
    }
}

/// What a client-facing read resolves to: the winning value plus any
/// still-unresolved concurrent siblings (always empty outside vector
/// mode).
#[derive(Debug, Clone)]
pub struct Record {
    pub value: Vec<u8>,
    pub siblings: Vec<Vec<u8>>,
    pub lamport_ts: u64,
    pub origin: u64,
    pub vector: Option<VersionVector>,
}

fn encode_siblings(siblings: &[SiblingValue]) -> QuorumResult<Vec<u8>> {
    Ok(encoding::encode_to_vec(&siblings.to_vec())?)
}

fn decode_siblings(bytes: &[u8]) -> QuorumResult<Vec<SiblingValue>> {
    let (siblings, _) = encoding::decode_from_slice::<Vec<SiblingValue>>(bytes)?;
    Ok(siblings)
}

impl Encode for Vec<SiblingValue> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::encode_vec(self, buf)
    }
}

impl Decode for Vec<SiblingValue> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        encoding::decode_vec::<SiblingValue>(buf)
    }
}

/// Folds one set of known values for a key through the node's
/// configured [`MergeStrategy`], yielding the surviving sibling(s).
/// Vector mode keeps the maximal concurrent antichain. LWW collapses
/// `values` to a single winner by `(lamport_ts, origin)`. CRDT mode
/// instead joins every live value's decoded [`GCounter`] state (§3:
/// "the join of CRDT states") rather than picking one and discarding
/// the rest — see [`merge_crdt_siblings`].
pub fn merge_siblings(strategy: MergeStrategy, values: Vec<SiblingValue>) -> QuorumResult<Vec<SiblingValue>> {
    if values.is_empty() {
        return Ok(values);
    }
    if matches!(strategy, MergeStrategy::Crdt) {
        return merge_crdt_siblings(values);
    }
    let candidates: Vec<Candidate<SiblingValue>> = values
        .into_iter()
        .map(|s| Candidate { lamport_ts: s.lamport_ts, origin: s.origin, vector: s.vector.clone(), value: s })
        .collect();
    Ok(match strategy.resolve(candidates) {
        Resolution::Winner(w) => vec![w],
        Resolution::Siblings(s) => s,
    })
}

/// CRDT-mode merge: values are the serialized state of a [`GCounter`]
/// (distilled spec §3), so resolving a sibling set means decoding and
/// joining every live value rather than taking an LWW winner, which
/// would silently drop concurrent increments. A tombstone still wins
/// outright if its `lamport_ts` exceeds every live value's — a delete
/// strictly newer than all known increments — otherwise stale deletes
/// are folded away and the joined counter survives.
fn merge_crdt_siblings(values: Vec<SiblingValue>) -> QuorumResult<Vec<SiblingValue>> {
    let max_alive_ts = values.iter().filter(|s| s.value.is_some()).map(|s| s.lamport_ts).max();
    let dominant_tombstone = values
        .iter()
        .filter(|s| s.value.is_none())
        .filter(|s| max_alive_ts.is_none_or(|alive_ts| s.lamport_ts > alive_ts))
        .max_by(|a, b| a.lamport_ts.cmp(&b.lamport_ts).then(a.origin.cmp(&b.origin)))
        .cloned();
    if let Some(winner) = dominant_tombstone {
        return Ok(vec![winner]);
    }

    let alive: Vec<&SiblingValue> = values.iter().filter(|s| s.value.is_some()).collect();
    let mut joined = GCounter::new();
    for s in &alive {
        let bytes = s.value.as_deref().expect("filtered to alive above");
        let (counter, _) = encoding::decode_from_slice::<GCounter>(bytes)?;
        joined = joined.merge(&counter);
    }
    let primary = alive
        .iter()
        .copied()
        .max_by(|a, b| a.lamport_ts.cmp(&b.lamport_ts).then(a.origin.cmp(&b.origin)))
        .expect("alive non-empty: no dominant tombstone implies at least one live value");
    let vector = alive.iter().fold(None::<VersionVector>, |acc, s| match (acc, &s.vector) {
        (Some(a), Some(b)) => Some(a.merge(b)),
        (Some(a), None) => Some(a),
        (None, v) => v.clone(),
    });

    Ok(vec![SiblingValue {
        value: Some(encoding::encode_to_vec(&joined)?),
        lamport_ts: primary.lamport_ts,
        origin: primary.origin,
        seq: primary.seq,
        vector,
    }])
}

/// Picks one definite value out of a sibling set for ergonomic
/// single-value access, LWW-ordered regardless of the active strategy
/// (a deterministic tie-break is all that's needed here; the full
/// sibling set is still exposed via [`Record::siblings`]).
fn to_record(siblings: Vec<SiblingValue>) -> Option<Record> {
    let mut alive: Vec<SiblingValue> = siblings.into_iter().filter(|s| s.value.is_some()).collect();
    if alive.is_empty() {
        return None;
    }
    alive.sort_by(|a, b| a.lamport_ts.cmp(&b.lamport_ts).then(a.origin.cmp(&b.origin)));
    let primary = alive.pop().expect("checked non-empty above");
    let rest = alive.into_iter().filter_map(|s| s.value).collect();
    Some(Record {
        value: primary.value.expect("filtered to Some above"),
        siblings: rest,
        lamport_ts: primary.lamport_ts,
        origin: primary.origin,
        vector: primary.vector,
    })
}

/// Coordinates reads and writes across a key's preference list:
/// Lamport/vector clock bookkeeping, local apply, synchronous
/// replication, sloppy quorum with hinted handoff, and read repair.
pub struct QuorumCoordinator {
    self_id: u64,
    replication_factor: usize,
    write_quorum: usize,
    read_quorum: usize,
    strong_consistency: bool,
    strategy: MergeStrategy,
    clock: Arc<LamportClock>,
    engine: Arc<Engine>,
    meta: Arc<MetaTable>,
    replog: Arc<ReplicationLog>,
    partitioner: Arc<RwLock<Partitioner>>,
    transport: Arc<dyn PeerRpc>,
    heartbeat: Arc<Heartbeat>,
    hinted: Arc<HintedHandoff>,
}

impl QuorumCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: u64,
        replication_factor: usize,
        write_quorum: usize,
        read_quorum: usize,
        strong_consistency: bool,
        strategy: MergeStrategy,
        clock: Arc<LamportClock>,
        engine: Arc<Engine>,
        meta: Arc<MetaTable>,
        replog: Arc<ReplicationLog>,
        partitioner: Arc<RwLock<Partitioner>>,
        transport: Arc<dyn PeerRpc>,
        heartbeat: Arc<Heartbeat>,
        hinted: Arc<HintedHandoff>,
    ) -> Self {
        Self {
            self_id,
            replication_factor,
            write_quorum,
            read_quorum,
            strong_consistency,
            strategy,
            clock,
            engine,
            meta,
            replog,
            partitioner,
            transport,
            heartbeat,
            hinted,
        }
    }

    fn owners(&self, key: &[u8]) -> Vec<u64> {
        let partitioner = self.partitioner.read().expect("partitioner lock poisoned");
        partitioner.owners_for_key(key, self.replication_factor)
    }

    fn map_epoch(&self) -> u64 {
        self.partitioner.read().expect("partitioner lock poisoned").map_epoch()
    }

    fn require_owner(&self, key: &[u8]) -> QuorumResult<Vec<u64>> {
        let owners = self.owners(key);
        if owners.is_empty() {
            return Err(QuorumError::NoOwners);
        }
        if !owners.contains(&self.self_id) {
            return Err(QuorumError::NotOwner { owner: owners[0], epoch: self.map_epoch() });
        }
        Ok(owners)
    }

    /// `Put(key, value)`: stamps a write with the local Lamport clock
    /// (or folds in `client_ts` if the caller supplied one, e.g. a
    /// replayed import) and drives it to quorum.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, client_ts: Option<u64>) -> QuorumResult<()> {
        self.write(key, Some(value), client_ts)
    }

    /// `Delete(key)`: a tombstone write, ordered and merged exactly like
    /// a put so a concurrent put on another replica is resolved the
    /// same way (distilled spec §4.11's "delete wins only if it's
    /// newer" rule falls out of the shared Lamport/vector ordering).
    pub fn delete(&self, key: Vec<u8>) -> QuorumResult<()> {
        self.write(key, None, None)
    }

    fn write(&self, key: Vec<u8>, value: Option<Vec<u8>>, client_ts: Option<u64>) -> QuorumResult<()> {
        let owners = self.require_owner(&key)?;

        let lamport_ts = match client_ts {
            Some(ts) => self.clock.update(ts),
            None => self.clock.tick(),
        };

        let appended = self.replog.append(
            self.self_id,
            LogOp {
                origin: self.self_id,
                seq: 0,
                key: key.clone(),
                value: value.clone(),
                lamport_ts,
                vector: None,
                hinted_for: None,
                tx_id: None,
            },
        )?;

        let vector = if matches!(self.strategy, MergeStrategy::Vector) {
            let mut vv = self.meta.get(&key)?.and_then(|e| e.vector).unwrap_or_default();
            vv.observe(appended.origin, appended.seq);
            Some(vv)
        } else {
            None
        };

        let op = LogOp { vector, ..appended };

        self.apply_local(&op)?;
        let mut acks = 1usize;

        for &owner in owners.iter().filter(|&&o| o != self.self_id) {
            if self.push_to_owner(owner, &op) {
                acks += 1;
            } else if self.strong_consistency {
                // Strong consistency requires every preferred replica to
                // ack for real; an unreachable owner cannot be papered
                // over with a hint, so this counts as a miss.
            } else {
                self.hinted.accept(owner, LogOp { hinted_for: Some(owner), ..op.clone() })?;
                acks += 1;
            }
        }

        let needed = if self.strong_consistency { owners.len() } else { self.write_quorum };
        if acks >= needed {
            Ok(())
        } else {
            Err(QuorumError::NotMet { needed, got: acks })
        }
    }

    /// Skips the RPC (and its timeout) for a peer the heartbeat already
    /// knows is dead; an unknown peer (not yet tracked, or this node
    /// itself) is always attempted.
    fn known_dead(&self, peer: u64) -> bool {
        matches!(self.heartbeat.status_of(peer), Some(crate::replication::heartbeat::NodeStatus::Dead))
    }

    fn push_to_owner(&self, owner: u64, op: &LogOp) -> bool {
        if self.known_dead(owner) {
            return false;
        }
        let result = if op.is_tombstone() {
            self.transport.delete(
                owner,
                DeleteRequest {
                    key: op.key.clone(),
                    lamport_ts: op.lamport_ts,
                    origin: op.origin,
                    seq: op.seq,
                    vector: op.vector.clone(),
                    hinted_for: None,
                    tx_id: op.tx_id,
                },
            )
        } else {
            self.transport.put(
                owner,
                PutRequest {
                    key: op.key.clone(),
                    value: op.value.clone().unwrap_or_default(),
                    lamport_ts: op.lamport_ts,
                    origin: op.origin,
                    seq: op.seq,
                    vector: op.vector.clone(),
                    hinted_for: None,
                    tx_id: op.tx_id,
                },
            )
        };
        result.is_ok()
    }

    /// Applies a write to local storage: merges it against whatever
    /// this replica already holds for the key via [`merge_siblings`],
    /// deduplicating on `(origin, seq)` first so at-least-once delivery
    /// (background replication, anti-entropy, hinted handoff) is
    /// idempotent for free — re-delivering an already-applied op just
    /// reaches the same fixed point.
    pub fn apply_local(&self, op: &LogOp) -> QuorumResult<()> {
        if let Some(existing) = self.meta.get(&op.key)? {
            if existing.origin == op.origin && existing.seq == op.seq {
                return Ok(());
            }
        }

        let existing_siblings = match self.engine.get(op.key.clone())? {
            Some(blob) => decode_siblings(&blob)?,
            None => Vec::new(),
        };

        let incoming = SiblingValue {
            value: op.value.clone(),
            lamport_ts: op.lamport_ts,
            origin: op.origin,
            seq: op.seq,
            vector: op.vector.clone(),
        };

        let mut merged = existing_siblings;
        merged.push(incoming.clone());
        let resolved = merge_siblings(self.strategy, merged)?;

        let all_dead = resolved.iter().all(|s| s.value.is_none());
        let primary = resolved
            .iter()
            .max_by(|a, b| a.lamport_ts.cmp(&b.lamport_ts).then(a.origin.cmp(&b.origin)))
            .cloned()
            .unwrap_or(incoming);
        let vector = resolved.iter().fold(None::<VersionVector>, |acc, s| match (acc, &s.vector) {
            (Some(a), Some(b)) => Some(a.merge(b)),
            (Some(a), None) => Some(a),
            (None, v) => v.clone(),
        });

        if all_dead {
            self.engine.delete(op.key.clone())?;
        } else {
            self.engine.put(op.key.clone(), encode_siblings(&resolved)?)?;
        }

        self.meta.put(
            op.key.clone(),
            MetaEntry { origin: primary.origin, lamport_ts: primary.lamport_ts, seq: primary.seq, vector, tombstone: all_dead },
        )?;
        Ok(())
    }

    /// `Get(key)`: queries the preference list for `Vec<RecordReply>`
    /// per replica, merges every reply through [`merge_siblings`], and
    /// read-repairs replicas whose answer disagreed with the merge.
    pub fn get(&self, key: &[u8]) -> QuorumResult<Option<Record>> {
        let owners = self.owners(key);
        if owners.is_empty() {
            return Err(QuorumError::NoOwners);
        }

        let needed = if self.strong_consistency { owners.len() } else { self.read_quorum };
        let mut responded = 0usize;
        let mut per_owner: HashMap<u64, Vec<RecordReply>> = HashMap::new();

        for &owner in &owners {
            if owner != self.self_id && self.known_dead(owner) {
                continue;
            }
            let reply = if owner == self.self_id {
                Ok(self.local_get(key)?)
            } else {
                self.transport.get(owner, key)
            };
            if let Ok(replies) = reply {
                responded += 1;
                per_owner.insert(owner, replies);
            }
        }

        if responded < needed {
            return Err(QuorumError::NotMet { needed, got: responded });
        }

        let all: Vec<SiblingValue> = per_owner
            .values()
            .flatten()
            .map(|r| SiblingValue { value: r.value.clone(), lamport_ts: r.lamport_ts, origin: r.origin, seq: 0, vector: r.vector.clone() })
            .collect();

        if all.is_empty() {
            return Ok(None);
        }

        let resolved = merge_siblings(self.strategy, all)?;
        self.read_repair(key, &owners, &per_owner, &resolved);
        Ok(to_record(resolved))
    }

    /// Reads this replica's locally held siblings for `key`, used both
    /// for local quorum participation and to answer `PeerHandler::handle_get`.
    pub fn local_get(&self, key: &[u8]) -> QuorumResult<Vec<RecordReply>> {
        let Some(blob) = self.engine.get(key.to_vec())? else { return Ok(Vec::new()) };
        let siblings = decode_siblings(&blob)?;
        Ok(siblings
            .into_iter()
            .map(|s| RecordReply { value: s.value, lamport_ts: s.lamport_ts, origin: s.origin, vector: s.vector })
            .collect())
    }

    /// Best-effort repair: a replica whose reply doesn't match the
    /// merged result gets the winner pushed back to it. Repairs only
    /// the resolved primary value; a lagging replica that's still
    /// missing other surviving vector-mode siblings converges on the
    /// next anti-entropy sweep instead of a second repair round-trip.
    fn read_repair(&self, key: &[u8], owners: &[u64], per_owner: &HashMap<u64, Vec<RecordReply>>, resolved: &[SiblingValue]) {
        let Some(primary) = resolved.iter().max_by(|a, b| a.lamport_ts.cmp(&b.lamport_ts).then(a.origin.cmp(&b.origin))) else {
            return;
        };

        for &owner in owners {
            let up_to_date = per_owner
                .get(&owner)
                .map(|replies| replies.iter().any(|r| r.origin == primary.origin && r.lamport_ts == primary.lamport_ts))
                .unwrap_or(false);
            if up_to_date {
                continue;
            }

            let op = LogOp {
                origin: primary.origin,
                seq: 0,
                key: key.to_vec(),
                value: primary.value.clone(),
                lamport_ts: primary.lamport_ts,
                vector: primary.vector.clone(),
                hinted_for: None,
                tx_id: None,
            };
            if owner == self.self_id {
                let _ = self.apply_local(&op);
            } else {
                self.push_to_owner(owner, &op);
            }
        }
    }

    /// Applies an op delivered through `Replicate`, anti-entropy's
    /// `FetchUpdates` reconciliation, or a redelivered hint. Shares the
    /// same merge path as a local coordinated write.
    pub fn apply_incoming(&self, op: LogOp) -> QuorumResult<()> {
        self.apply_local(&op)
    }

    /// `Scan(partition, low, high)`: a local range read over this
    /// replica's own storage, resolved through the same merge path as
    /// `get`. Unlike `put`/`get`, a scan is never fanned out to a
    /// preference list — cross-partition scans are an out-of-scope
    /// query-planner concern (distilled spec §1); this is the "ask the
    /// owner directly" primitive that planner builds on. If `partition`
    /// names a pid this node does not own, the caller is pointed at the
    /// owner exactly as a single-key write would.
    pub fn scan(&self, partition: Option<u64>, low: &[u8], high: &[u8]) -> QuorumResult<Vec<(Vec<u8>, Record)>> {
        if let Some(pid) = partition {
            let partitioner = self.partitioner.read().expect("partitioner lock poisoned");
            if let Some(p) = partitioner.partition(pid) {
                if p.owner != self.self_id {
                    return Err(QuorumError::NotOwner { owner: p.owner, epoch: self.map_epoch() });
                }
            }
        }

        let mut out = Vec::new();
        for (key, blob) in self.engine.scan(low, high)? {
            let siblings = decode_siblings(&blob)?;
            if let Some(record) = to_record(siblings) {
                out.push((key, record));
            }
        }
        Ok(out)
    }

    /// `FetchUpdates(last_seen) -> stream[Op]`: every key this replica
    /// knows about whose currently-recorded `(origin, seq)` the
    /// requester's vector does not already dominate, ordered by
    /// `(origin, seq)` (distilled spec §4.6). Driven by a peer's
    /// restart recovery or by [`crate::replication::anti_entropy::AntiEntropy`]
    /// on divergence.
    pub fn fetch_updates(&self, requester_last_seen: &VersionVector) -> QuorumResult<Vec<LogOp>> {
        let mut ops = Vec::new();
        for (key, entry) in self.meta.entries_in_range(&[], None)? {
            if requester_last_seen.already_applied(entry.origin, entry.seq) {
                continue;
            }
            let value = if entry.tombstone {
                None
            } else {
                match self.engine.get(key.clone())? {
                    Some(blob) => to_record(decode_siblings(&blob)?).map(|r| r.value),
                    None => None,
                }
            };
            ops.push(LogOp {
                origin: entry.origin,
                seq: entry.seq,
                key,
                value,
                lamport_ts: entry.lamport_ts,
                vector: entry.vector,
                hinted_for: None,
                tx_id: None,
            });
        }
        ops.sort_by(|a, b| a.origin.cmp(&b.origin).then(a.seq.cmp(&b.seq)));
        Ok(ops)
    }
}
