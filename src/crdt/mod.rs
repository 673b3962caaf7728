//! Conflict-free replicated data types and the merge-strategy dispatch
//! used in CRDT consistency mode.
//!
//! The "dynamic dispatch / mixins" design note (distilled spec §9) asks
//! for the three consistency modes to be a tagged variant over a shared
//! merge capability rather than trait objects chosen at runtime per
//! call. [`MergeStrategy`] is that tagged variant; [`GCounter`] is the
//! one concrete CRDT type the spec names.

use std::collections::BTreeMap;

use crate::clock::{VectorOrdering, VersionVector};
use crate::config::ConsistencyMode;
use crate::encoding::{self, Decode, Encode, EncodingError};

/// Grow-only counter CRDT: per-origin partial counts, total = sum.
///
/// Merge is `max` per origin, which is commutative, associative, and
/// idempotent — the three properties a CRDT merge must have.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GCounter {
    shards: BTreeMap<u64, u64>,
}

impl GCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments this node's shard by `amount` and returns the new total.
    pub fn increment(&mut self, origin: u64, amount: u64) -> u64 {
        let slot = self.shards.entry(origin).or_insert(0);
        *slot += amount;
        self.value()
    }

    pub fn value(&self) -> u64 {
        self.shards.values().sum()
    }

    /// State-based merge: `max` per shard. Commutative, associative,
    /// idempotent.
    pub fn merge(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (&origin, &count) in &other.shards {
            let slot = out.shards.entry(origin).or_insert(0);
            if count > *slot {
                *slot = count;
            }
        }
        out
    }
}

impl Encode for GCounter {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let pairs: Vec<(u64, u64)> = self.shards.iter().map(|(&o, &c)| (o, c)).collect();
        encoding::encode_vec(&pairs, buf)
    }
}

impl Decode for GCounter {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (pairs, n) = encoding::decode_vec::<(u64, u64)>(buf)?;
        Ok((
            Self {
                shards: pairs.into_iter().collect(),
            },
            n,
        ))
    }
}

/// Outcome of resolving two candidate values for the same key.
pub enum Resolution<T> {
    /// A single value won outright.
    Winner(T),
    /// Vector mode: the two values are concurrent, kept as siblings.
    Siblings(Vec<T>),
}

/// A candidate record observed at a single replica, carrying enough
/// metadata to resolve conflicts under any of the three consistency
/// modes.
#[derive(Debug, Clone)]
pub struct Candidate<T> {
    pub value: T,
    pub lamport_ts: u64,
    pub origin: u64,
    pub vector: Option<VersionVector>,
}

/// Tagged variant over the three merge capabilities named in the spec.
/// Chosen once at node construction from [`ConsistencyMode`].
#[derive(Debug, Clone, Copy)]
pub enum MergeStrategy {
    Lww,
    Vector,
    Crdt,
}

impl MergeStrategy {
    pub fn from_mode(mode: ConsistencyMode) -> Self {
        match mode {
            ConsistencyMode::Lww => MergeStrategy::Lww,
            ConsistencyMode::Vector => MergeStrategy::Vector,
            ConsistencyMode::Crdt => MergeStrategy::Crdt,
        }
    }

    /// Resolves a set of candidate values observed across replicas for
    /// the same key, per distilled spec §4.11's tie-break rule: higher
    /// Lamport timestamp wins; ties broken by higher origin id. In
    /// vector mode, concurrent candidates survive as siblings. In CRDT
    /// mode `merge_crdt` must be supplied by the caller (CRDT merge is
    /// type-specific and not representable generically over `T`).
    pub fn resolve<T: Clone>(&self, mut candidates: Vec<Candidate<T>>) -> Resolution<T> {
        match self {
            MergeStrategy::Lww => {
                candidates.sort_by(|a, b| {
                    a.lamport_ts
                        .cmp(&b.lamport_ts)
                        .then(a.origin.cmp(&b.origin))
                });
                let winner = candidates
                    .pop()
                    .expect("resolve called with no candidates")
                    .value;
                Resolution::Winner(winner)
            }
            MergeStrategy::Vector => {
                let mut maximal: Vec<Candidate<T>> = Vec::new();
                'outer: for cand in candidates {
                    let cand_vec = cand.vector.clone().unwrap_or_default();
                    let mut keep = Vec::with_capacity(maximal.len());
                    for existing in maximal.drain(..) {
                        let existing_vec = existing.vector.clone().unwrap_or_default();
                        match cand_vec.compare(&existing_vec) {
                            VectorOrdering::Greater => {
                                // existing is dominated, drop it
                            }
                            VectorOrdering::Less => {
                                // cand is dominated by an existing entry
                                keep.push(existing);
                                maximal = keep;
                                continue 'outer;
                            }
                            VectorOrdering::Equal | VectorOrdering::Concurrent => {
                                keep.push(existing);
                            }
                        }
                    }
                    keep.push(cand);
                    maximal = keep;
                }
                if maximal.len() == 1 {
                    Resolution::Winner(maximal.pop().expect("len checked above").value)
                } else {
                    Resolution::Siblings(maximal.into_iter().map(|c| c.value).collect())
                }
            }
            MergeStrategy::Crdt => {
                // `resolve` is generic over T and can't decode an
                // opaque CRDT-state blob to join it; the byte-level
                // join lives in `quorum::merge_crdt_siblings`, which
                // decodes the value as a `GCounter` before reaching
                // for this dispatch at all. This arm only runs for a
                // caller that invokes `resolve` directly on non-blob
                // candidates, where it degrades to LWW ordering.
                candidates.sort_by(|a, b| {
                    a.lamport_ts
                        .cmp(&b.lamport_ts)
                        .then(a.origin.cmp(&b.origin))
                });
                let winner = candidates
                    .pop()
                    .expect("resolve called with no candidates")
                    .value;
                Resolution::Winner(winner)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcounter_merge_is_commutative_and_idempotent() {
        let mut a = GCounter::new();
        a.increment(1, 5);
        let mut b = GCounter::new();
        b.increment(2, 3);

        let ab = a.merge(&b);
        let ba = b.merge(&a);
        assert_eq!(ab, ba);
        assert_eq!(ab.value(), 8);

        let idempotent = ab.merge(&ab);
        assert_eq!(idempotent, ab);
    }

    #[test]
    fn lww_tiebreak_prefers_higher_origin_on_equal_timestamp() {
        let candidates = vec![
            Candidate { value: "v1", lamport_ts: 7, origin: 1, vector: None },
            Candidate { value: "v2", lamport_ts: 7, origin: 2, vector: None },
        ];
        match MergeStrategy::Lww.resolve(candidates) {
            Resolution::Winner(v) => assert_eq!(v, "v2"),
            _ => panic!("expected a single winner"),
        }
    }

    #[test]
    fn vector_mode_keeps_concurrent_siblings() {
        let mut va = VersionVector::new();
        va.observe(1, 1);
        let mut vb = VersionVector::new();
        vb.observe(2, 1);

        let candidates = vec![
            Candidate { value: "v1", lamport_ts: 1, origin: 1, vector: Some(va) },
            Candidate { value: "v2", lamport_ts: 1, origin: 2, vector: Some(vb) },
        ];
        match MergeStrategy::Vector.resolve(candidates) {
            Resolution::Siblings(mut vs) => {
                vs.sort();
                assert_eq!(vs, vec!["v1", "v2"]);
            }
            _ => panic!("expected concurrent siblings"),
        }
    }
}
