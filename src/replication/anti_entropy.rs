//! Merkle anti-entropy: a low-frequency background sweep that catches
//! divergence quorum reads and read repair miss (distilled spec §4.9).
//!
//! Entries are bucketed into `segments` leaves by `sha1(key) mod
//! segments`, matching [`crate::config::DbConfig::anti_entropy_segments`].
//! A segment's digest is the `Sha1` of its sorted `(key, entry)` pairs;
//! the root digest is the `Sha1` of the concatenated segment digests.
//! `merkle_digest(0, [])` returns the root plus every segment digest in
//! one round trip (`anti_entropy_segments` is small, typically in the
//! low hundreds, so this is cheaper than a recursive trie descent over
//! the wire). A peer whose root differs is asked, via the segment
//! indices that actually differ, to stream a full reconciliation using
//! the existing `FetchUpdates`/`LogOp` replay path rather than a new
//! key-listing RPC.


use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::clock::VersionVector;
use crate::quorum::QuorumCoordinator;
use crate::replication::meta_table::{MetaEntry, MetaTable};
use crate::replication::transport::PeerRpc;

/// Digest of one segment: a `Sha1` over every `(key, entry)` pair it
/// currently holds, sorted by key (guaranteed already, since `MetaTable`
/// iterates a `BTreeMap`).
fn segment_index(key: &[u8], segments: usize) -> usize {
    let hash = Sha1::digest(key);
    let n = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]) as usize;
    n % segments.max(1)
}

fn segment_digest(entries: &[(Vec<u8>, MetaEntry)]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for (key, entry) in entries {
        hasher.update(key);
        hasher.update(entry.origin.to_be_bytes());
        hasher.update(entry.lamport_ts.to_be_bytes());
        hasher.update(entry.seq.to_be_bytes());
        hasher.update([entry.tombstone as u8]);
    }
    hasher.finalize().into()
}

fn root_digest(segments: &[[u8; 20]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for s in segments {
        hasher.update(s);
    }
    hasher.finalize().into()
}

/// All segment digests for the current table contents, computed once
/// per round so local and remote comparisons use a consistent snapshot.
pub fn local_segment_digests(meta: &MetaTable, segments: usize) -> Result<Vec<[u8; 20]>, AntiEntropyError> {
    let mut buckets: Vec<Vec<(Vec<u8>, MetaEntry)>> = vec![Vec::new(); segments.max(1)];
    for (key, entry) in meta.entries_in_range(&[], None)? {
        let idx = segment_index(&key, segments);
        buckets[idx].push((key, entry));
    }
    Ok(buckets.iter().map(|b| segment_digest(b)).collect())
}

/// Root digest plus every segment digest, for answering the
/// `MerkleDigest` RPC in one round trip (see the module doc above).
pub fn local_root_and_segments(meta: &MetaTable, segments: usize) -> Result<([u8; 20], Vec<[u8; 20]>), AntiEntropyError> {
    let segment_digests = local_segment_digests(meta, segments)?;
    let root = root_digest(&segment_digests);
    Ok((root, segment_digests))
}

#[derive(Debug, thiserror::Error)]
pub enum AntiEntropyError {
    #[error("meta table error: {0}")]
    MetaTable(#[from] crate::replication::meta_table::MetaTableError),

    #[error("quorum error: {0}")]
    Quorum(#[from] crate::quorum::QuorumError),

    #[error("transport error: {0}")]
    Transport(#[from] crate::replication::transport::TransportError),
}

/// Drives periodic root-digest exchange with a randomly chosen live
/// peer and reconciles on divergence.
///
/// Reconciliation is applied through [`QuorumCoordinator::apply_incoming`]
/// rather than writing the engine directly — the engine's on-disk blob
/// for a key is always an encoded sibling set (see `quorum`'s module
/// doc), and going through the same merge path a coordinated write uses
/// keeps that invariant intact instead of duplicating it here.
pub struct AntiEntropy {
    self_id: u64,
    quorum: Arc<QuorumCoordinator>,
    meta: Arc<MetaTable>,
    transport: Arc<dyn PeerRpc>,
    segments: usize,
}

impl AntiEntropy {
    pub fn new(
        self_id: u64,
        quorum: Arc<QuorumCoordinator>,
        meta: Arc<MetaTable>,
        transport: Arc<dyn PeerRpc>,
        segments: usize,
    ) -> Self {
        Self { self_id, quorum, meta, transport, segments }
    }

    /// One round against a single peer: compares root digests and, on
    /// mismatch, fetches and applies updates the peer knows about that
    /// this node doesn't. Returns the number of divergent segments
    /// found (0 means the peer was already fully in sync).
    pub fn sync_with(&self, peer_id: u64) -> Result<usize, AntiEntropyError> {
        let local_segments = local_segment_digests(&self.meta, self.segments)?;
        let local_root = root_digest(&local_segments);

        let reply = self.transport.merkle_digest(peer_id, 0, Vec::new())?;
        if reply.hash == local_root {
            return Ok(0);
        }

        let Some(remote_segments) = reply.children else {
            warn!(peer_id, "root digest mismatch but peer returned no segment digests");
            return Ok(0);
        };

        let diverged = local_segments
            .iter()
            .zip(remote_segments.iter())
            .filter(|(a, b)| a != b)
            .count();
        if diverged == 0 {
            return Ok(0);
        }

        info!(peer_id, diverged, "anti-entropy divergence detected, fetching updates");
        let last_seen = self.local_version_vector()?;
        let remote_ops = self.transport.fetch_updates(peer_id, last_seen)?;
        for op in remote_ops {
            self.quorum.apply_incoming(op)?;
        }
        Ok(diverged)
    }

    fn local_version_vector(&self) -> Result<VersionVector, AntiEntropyError> {
        let mut vv = VersionVector::new();
        for (_, entry) in self.meta.entries_in_range(&[], None)? {
            vv.observe(entry.origin, entry.seq);
            if let Some(v) = &entry.vector {
                vv = vv.merge(v);
            }
        }
        Ok(vv)
    }

    /// Runs `sync_with` against each of `live_peers()` on `interval`
    /// until shutdown.
    pub async fn run(
        self: Arc<Self>,
        live_peers: impl Fn() -> Vec<u64> + Send + Sync + 'static,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let peers = live_peers();
                    for peer_id in peers {
                        if peer_id == self.self_id {
                            continue;
                        }
                        let this = self.clone();
                        tokio::task::spawn_blocking(move || {
                            if let Err(e) = this.sync_with(peer_id) {
                                warn!(peer_id, error = %e, "anti-entropy round failed");
                            }
                        })
                        .await
                        .ok();
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
