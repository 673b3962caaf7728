//! # driftdb
//!
//! The core of a distributed, eventually-consistent key-value store with
//! relational capabilities layered on top elsewhere (this crate stops at
//! the storage/replication/partitioning boundary — no HTTP surface, SQL
//! planner, or UI lives here; see `SPEC_FULL.md` §1).
//!
//! Three subsystems, leaves first:
//!
//! 1. **Local LSM storage engine** — [`wal`], [`memtable`], [`sstable`],
//!    [`manifest`], [`compaction`], composed by [`engine`].
//! 2. **Replication and consistency core** — [`clock`] (Lamport + version
//!    vectors), [`crdt`] (merge-strategy dispatch), [`replication`]
//!    (replication log, peer transport, heartbeat, hinted handoff,
//!    anti-entropy), [`quorum`] (N/R/W coordination, read repair),
//!    [`txn`] (snapshot-isolation transactions).
//! 3. **Partitioning and routing** — [`cluster`] (consistent hash ring,
//!    partitioner, transfer rate limiting).
//!
//! [`node::Node`] composes all three into the library-level entry point
//! named in the external interfaces (`put`/`get`/`delete`/`scan`/
//! `begin_tx`/`commit_tx`/`abort_tx`/`query_index`, plus the
//! administrative hooks).
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                             Node                                │
//! │  ┌──────────┐   ┌───────────────┐   ┌──────────────────────┐   │
//! │  │ Quorum   │──▶│ cluster::Ring  │   │ txn::TransactionMgr  │   │
//! │  │ Coordinator│ │  + Partitioner │   └──────────┬───────────┘   │
//! │  └────┬─────┘  └───────┬────────┘              │               │
//! │       │                │                       ▼               │
//! │       ▼                ▼              ┌──────────────────┐     │
//! │  ┌─────────┐    ┌───────────────┐     │   engine::Engine  │     │
//! │  │ replication::│ heartbeat,    │     │ (WAL+MemTable+    │     │
//! │  │ transport,   │ hinted_handoff│────▶│  SSTables+compact)│     │
//! │  │ log,         │ anti_entropy  │     └──────────────────┘     │
//! │  └─────────┘    └───────────────┘              ▲               │
//! │                                                 │               │
//! │                                   replication::meta_table       │
//! │                              (lamport_ts/origin/seq/vector)      │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Features
//!
//! - **Write-ahead logging** — every mutation is persisted to a WAL before
//!   being acknowledged, guaranteeing durability and crash recovery.
//! - **Multi-version concurrency** — multiple versions per key, ordered by
//!   log sequence number locally and `(lamport_ts, origin)` across replicas.
//! - **Point and range tombstones** — efficient delete semantics for both
//!   individual keys and key ranges.
//! - **Pluggable consistency** — last-write-wins, version-vector siblings,
//!   or state-based CRDT merge, chosen once per node.
//! - **Sloppy quorum + hinted handoff** — writes keep succeeding through
//!   transient unavailability; anti-entropy repairs the rest.
//! - **Consistent hashing with virtual nodes** — adding/removing a node
//!   moves a bounded fraction of keys.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use driftdb::config::DbConfig;
//! use driftdb::node::Node;
//!
//! let config = DbConfig {
//!     data_dir: "/tmp/driftdb-node-1".into(),
//!     ..DbConfig::default()
//! };
//!
//! let node = Node::open(1, "127.0.0.1:9001".parse().unwrap(), config).unwrap();
//!
//! node.put(b"hello".to_vec(), b"world".to_vec(), None).unwrap();
//! assert_eq!(node.get(b"hello").unwrap().map(|r| r.value), Some(b"world".to_vec()));
//! node.delete(b"hello".to_vec()).unwrap();
//! assert_eq!(node.get(b"hello").unwrap(), None);
//!
//! node.close().unwrap();
//! ```

#![allow(dead_code)]

pub mod clock;
pub mod cluster;
pub mod compaction;
pub mod config;
pub mod crdt;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod index;
pub mod manifest;
pub mod memtable;
pub mod node;
pub mod quorum;
pub mod replication;
pub mod sstable;
pub mod txn;
pub mod wal;

pub use config::DbConfig;
pub use error::{DbError, DbResult};
pub use index::IndexTable;
pub use node::Node;
