//! 160-bit token ring with virtual nodes (distilled spec §4.10).
//!
//! Each physical node is assigned `partitions_per_node` tokens drawn
//! deterministically (via `Sha1`) from the 160-bit token space. Given a
//! key, its token is `sha1(partition_key)`; walking clockwise from that
//! token collects the first `N` distinct physical nodes as the
//! preference list.

use sha1::{Digest, Sha1};

/// A point on the ring: a 160-bit token and the physical node it maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RingEntry {
    token: [u8; 20],
    node_id: u64,
}

/// Consistent hash ring over physical node ids.
///
/// Tokens are kept sorted so that "walk clockwise" is just "scan
/// forward from the insertion point, wrapping at the end".
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    entries: Vec<RingEntry>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// SHA-1 token for an arbitrary byte string (a key, or a synthetic
    /// `"<node_id>:<vnode_idx>"` label used to seed virtual nodes).
    pub fn token_for(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    /// Adds `node_id` to the ring with `vnodes` virtual nodes, each
    /// placed at a deterministic pseudorandom token. Idempotent: calling
    /// twice with the same arguments leaves the ring unchanged.
    pub fn add_node(&mut self, node_id: u64, vnodes: usize) {
        self.remove_node(node_id);
        for i in 0..vnodes {
            let label = format!("{node_id}:{i}");
            let token = Self::token_for(label.as_bytes());
            self.entries.push(RingEntry { token, node_id });
        }
        self.entries.sort_by_key(|e| e.token);
    }

    /// Removes every virtual node owned by `node_id`.
    pub fn remove_node(&mut self, node_id: u64) {
        self.entries.retain(|e| e.node_id != node_id);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct physical nodes currently on the ring.
    pub fn node_count(&self) -> usize {
        let mut ids: Vec<u64> = self.entries.iter().map(|e| e.node_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    /// Returns the first `n` distinct physical nodes walking clockwise
    /// from `key`'s token, i.e. the preference list for `key`.
    pub fn owners_for_key(&self, key: &[u8], n: usize) -> Vec<u64> {
        if self.entries.is_empty() || n == 0 {
            return Vec::new();
        }
        let token = Self::token_for(key);
        let start = self
            .entries
            .partition_point(|e| e.token < token)
            % self.entries.len();

        let mut owners = Vec::with_capacity(n);
        let mut idx = start;
        for _ in 0..self.entries.len() {
            let node_id = self.entries[idx].node_id;
            if !owners.contains(&node_id) {
                owners.push(node_id);
                if owners.len() == n {
                    break;
                }
            }
            idx = (idx + 1) % self.entries.len();
        }
        owners
    }

    /// Index of the virtual-node segment that `key`'s token falls into,
    /// i.e. the index of the first ring entry at or after the token,
    /// wrapping to 0. Used by the partitioner to assign hash-mode
    /// partition ids at a vnode granularity.
    pub fn segment_for_key(&self, key: &[u8]) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let token = Self::token_for(key);
        let idx = self.entries.partition_point(|e| e.token < token) % self.entries.len();
        Some(idx)
    }

    pub fn segment_count(&self) -> usize {
        self.entries.len()
    }

    pub fn segment_owner(&self, idx: usize) -> Option<u64> {
        self.entries.get(idx).map(|e| e.node_id)
    }

    /// Expected fraction of keys that move when the `(k+1)`-th node is
    /// added to a `k`-node ring with `vnodes` virtual nodes each: the
    /// new node claims `vnodes` of the `k*vnodes` existing segments plus
    /// its own, i.e. `~1/(k+1)` of the ring in expectation (distilled
    /// spec §8, property 10).
    pub fn expected_rebalance_fraction(k: usize) -> f64 {
        if k == 0 { 1.0 } else { 1.0 / (k as f64 + 1.0) }
    }
}
