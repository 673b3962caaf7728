//! Crate-wide error taxonomy.
//!
//! Every module keeps its own `thiserror` error type close to the code
//! that produces it (`WalError`, `SSTableError`, `ManifestError`,
//! `CompactionError`, `EngineError`, ...). [`DbError`] is the type
//! surfaced across node/quorum/transport boundaries; it aggregates the
//! module errors and adds the distributed-systems error kinds named in
//! the error handling design (`NotOwner`, `QuorumNotMet`, `Timeout`,
//! `SerializationConflict`, `StaleEpoch`, `DuplicateOp`,
//! `TombstoneRespected`, `UnknownKey`, `RateLimited`, `Shutdown`).

use crate::cluster::partitioner::PartitionError;
use crate::compaction::CompactionError;
use crate::engine::EngineError;
use crate::index::IndexError;
use crate::manifest::ManifestError;
use crate::quorum::QuorumError;
use crate::replication::anti_entropy::AntiEntropyError;
use crate::replication::hinted_handoff::HintError;
use crate::replication::log::ReplicationLogError;
use crate::replication::meta_table::MetaTableError;
use crate::replication::transport::TransportError;
use crate::sstable::SSTableError;
use crate::txn::TxnError;
use crate::wal::WalError;

/// Unified error type returned at the node/quorum/transport boundary.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("partition error: {0}")]
    Partition(#[from] PartitionError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("quorum error: {0}")]
    Quorum(#[from] QuorumError),

    #[error("transaction error: {0}")]
    Txn(#[from] TxnError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("meta table error: {0}")]
    MetaTable(#[from] MetaTableError),

    #[error("hint store error: {0}")]
    Hint(#[from] HintError),

    #[error("replication log error: {0}")]
    ReplicationLog(#[from] ReplicationLogError),

    #[error("anti-entropy error: {0}")]
    AntiEntropy(#[from] AntiEntropyError),

    #[error("not the owner of this key; owner={owner}, epoch={epoch}")]
    NotOwner { owner: u64, epoch: u64 },

    #[error("quorum not met: needed {needed}, got {got}")]
    QuorumNotMet { needed: usize, got: usize },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("serialization conflict: read set invalidated since snapshot")]
    SerializationConflict,

    #[error("stale epoch: local={local}, remote={remote}")]
    StaleEpoch { local: u64, remote: u64 },

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("duplicate operation {0}, ignored")]
    DuplicateOp(String),

    #[error("key is shadowed by a tombstone")]
    TombstoneRespected,

    #[error("unknown key")]
    UnknownKey,

    #[error("rate limited")]
    RateLimited,

    #[error("shutting down")]
    Shutdown,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type DbResult<T> = Result<T, DbError>;
