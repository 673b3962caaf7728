//! Logical clocks: a Lamport scalar clock and per-origin version vectors.
//!
//! Both are serialized with every replicated op (distilled spec §4.5).
//! Neither type is fallible in normal operation; the module carries no
//! error type of its own.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::encoding::{self, Decode, Encode, EncodingError};

/// Monotonic scalar Lamport clock, one per node.
#[derive(Debug, Default)]
pub struct LamportClock {
    value: AtomicU64,
}

impl LamportClock {
    pub fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
        }
    }

    /// Increments and returns the new local timestamp.
    pub fn tick(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Folds in a timestamp observed from a remote op: `self <- max(self,
    /// remote) + 1`, then returns the new local value.
    pub fn update(&self, remote: u64) -> u64 {
        let mut cur = self.value.load(Ordering::SeqCst);
        loop {
            let next = cur.max(remote) + 1;
            match self
                .value
                .compare_exchange_weak(cur, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Current value without advancing the clock.
    pub fn peek(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

/// Result of comparing two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOrdering {
    Less,
    Greater,
    Equal,
    Concurrent,
}

/// Mapping origin node id → highest sequence number observed from that
/// origin. Used both as `last_seen` (replica-local dedup state) and as
/// the per-record vector carried in vector-consistency mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionVector {
    entries: BTreeMap<u64, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number known for `origin`, or 0 if never observed.
    pub fn get(&self, origin: u64) -> u64 {
        self.entries.get(&origin).copied().unwrap_or(0)
    }

    /// Records that `seq` has been applied from `origin`, provided it is
    /// newer than what is already recorded (non-decreasing invariant).
    pub fn observe(&mut self, origin: u64, seq: u64) {
        let slot = self.entries.entry(origin).or_insert(0);
        if seq > *slot {
            *slot = seq;
        }
    }

    /// True when `seq` has already been applied from `origin` (used for
    /// at-least-once delivery dedup: incoming op with `seq <=
    /// last_seen[origin]` is discarded).
    pub fn already_applied(&self, origin: u64, seq: u64) -> bool {
        seq <= self.get(origin)
    }

    /// Merges two version vectors: `merge(a, b)[o] = max(a[o], b[o])`.
    pub fn merge(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (&origin, &seq) in &other.entries {
            out.observe(origin, seq);
        }
        out
    }

    /// Compares two vectors for the standard partial order.
    pub fn compare(&self, other: &Self) -> VectorOrdering {
        let mut self_ahead = false;
        let mut other_ahead = false;

        let origins = self.entries.keys().chain(other.entries.keys());
        let mut seen = std::collections::BTreeSet::new();
        for &origin in origins {
            if !seen.insert(origin) {
                continue;
            }
            let a = self.get(origin);
            let b = other.get(origin);
            if a > b {
                self_ahead = true;
            } else if b > a {
                other_ahead = true;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => VectorOrdering::Equal,
            (true, false) => VectorOrdering::Greater,
            (false, true) => VectorOrdering::Less,
            (true, true) => VectorOrdering::Concurrent,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.entries.iter().map(|(&o, &s)| (o, s))
    }
}

impl Encode for VersionVector {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let pairs: Vec<(u64, u64)> = self.entries.iter().map(|(&o, &s)| (o, s)).collect();
        encoding::encode_vec(&pairs, buf)
    }
}

impl Decode for VersionVector {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (pairs, n) = encoding::decode_vec::<(u64, u64)>(buf)?;
        let entries = pairs.into_iter().collect();
        Ok((Self { entries }, n))
    }
}

impl Encode for (u64, u64) {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.0.encode_to(buf)?;
        self.1.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for (u64, u64) {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (a, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (b, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok(((a, b), offset))
    }
}

/// Formats the canonical `"<origin>:<seq>"` operation id.
pub fn op_id(origin: u64, seq: u64) -> String {
    format!("{origin}:{seq}")
}
