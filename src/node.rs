//! [`Node`]: the library-level entry point that composes the engine,
//! replication core, and partitioning layer into the external
//! interface named in `SPEC_FULL.md` §6 — `put`/`get`/`delete`/`scan`,
//! transactions, `query_index`, and the administrative hooks.
//!
//! Construction resolves a genuine cyclic reference: [`TcpTransport`]
//! needs a `PeerHandler` to serve incoming RPCs, and that handler needs
//! to reach back into the very `Node` whose transport it is. `Node`
//! uses [`Arc::new_cyclic`] for this rather than an `Option<Weak<_>>`
//! filled in after the fact, per `transport.rs`'s own note on the
//! subject. Every fallible step (opening the engine, the replication
//! log, binding the listening socket) runs before the cyclic closure;
//! the closure itself only wires already-constructed pieces together.
//!
//! `Node` owns a private `tokio` runtime and spawns one task per
//! background subsystem (`heartbeat`, `hinted_handoff`, `anti_entropy`)
//! plus two more it is itself responsible for driving, since neither
//! `engine::Engine` nor `replication::log::ReplicationLog` runs its own
//! background loop: a replication sender that drains
//! `ReplicationLog::pending_for_peer` to every live peer, and a
//! maintenance sweep that flushes frozen memtables, runs compaction,
//! and reaps expired tombstones out of the meta table. All of them
//! watch the same `tokio::sync::watch::Receiver<bool>` for cooperative
//! shutdown.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tracing::info;

use crate::clock::{LamportClock, VersionVector};
use crate::cluster::{HashRing, Partition, Partitioner, TransferLimiter};
use crate::config::DbConfig;
use crate::crdt::MergeStrategy;
use crate::engine::{Engine, EngineConfig};
use crate::error::{DbError, DbResult};
use crate::index::IndexTable;
use crate::quorum::{QuorumCoordinator, Record};
use crate::replication::anti_entropy::{self, AntiEntropy};
use crate::replication::heartbeat::Heartbeat;
use crate::replication::hinted_handoff::{HintStore, HintedHandoff};
use crate::replication::log::{LogOp, ReplicationLog};
use crate::replication::meta_table::MetaTable;
use crate::replication::transport::{
    Ack, DeleteRequest, MerkleReply, PeerHandler, PeerRpc, Pong, PutRequest, RecordReply, TcpTransport, TransportError, TransportResult,
};
use crate::txn::{CommitOutcome, TransactionManager};

/// Per-key salting configuration installed by [`Node::mark_hot_key`]:
/// writes fan out across `buckets` salted sub-keys instead of landing
/// on a single partition owner (distilled spec §6's "enable salting").
#[derive(Debug, Clone, Copy)]
struct HotKeyConfig {
    buckets: u32,
}

/// The node-level entry point: composes the storage engine,
/// replication/consistency core, and partitioning layer behind the
/// external operation set.
pub struct Node {
    node_id: u64,
    addr: SocketAddr,
    config: DbConfig,

    clock: Arc<LamportClock>,
    engine: Arc<Engine>,
    meta: Arc<MetaTable>,
    replog: Arc<ReplicationLog>,
    index: IndexTable,
    partitioner: Arc<RwLock<Partitioner>>,

    transport: Arc<TcpTransport>,
    heartbeat: Arc<Heartbeat>,
    hinted: Arc<HintedHandoff>,
    anti_entropy: Arc<AntiEntropy>,
    quorum: Arc<QuorumCoordinator>,
    txn: Arc<TransactionManager>,

    transfer_limiter: Arc<TransferLimiter>,
    hot_keys: DashMap<Vec<u8>, HotKeyConfig>,

    runtime: Runtime,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Delegates incoming peer RPCs back to the owning [`Node`] through a
/// [`Weak`] reference, resolved inside [`Arc::new_cyclic`].
struct NodeHandler(Weak<Node>);

impl NodeHandler {
    fn node(&self) -> Arc<Node> {
        self.0.upgrade().expect("transport outlived its node")
    }
}

impl PeerHandler for NodeHandler {
    fn node_id(&self) -> u64 {
        self.node().node_id
    }
    fn handle_put(&self, req: PutRequest) -> TransportResult<Ack> {
        self.node().handle_put(req)
    }
    fn handle_delete(&self, req: DeleteRequest) -> TransportResult<Ack> {
        self.node().handle_delete(req)
    }
    fn handle_get(&self, key: &[u8]) -> TransportResult<Vec<RecordReply>> {
        self.node().handle_get(key)
    }
    fn handle_replicate(&self, batch: Vec<LogOp>) -> TransportResult<Vec<Ack>> {
        self.node().handle_replicate(batch)
    }
    fn handle_fetch_updates(&self, last_seen: VersionVector) -> TransportResult<Vec<LogOp>> {
        self.node().handle_fetch_updates(last_seen)
    }
    fn handle_ping(&self) -> TransportResult<Pong> {
        self.node().handle_ping()
    }
    fn handle_update_partition_map(&self, partitions: Vec<Partition>, epoch: u64) -> TransportResult<Ack> {
        self.node().handle_update_partition_map(partitions, epoch)
    }
    fn handle_update_hash_ring(&self, tokens: Vec<(u64, usize)>, epoch: u64) -> TransportResult<Ack> {
        self.node().handle_update_hash_ring(tokens, epoch)
    }
    fn handle_merkle_digest(&self, level: u32, prefix: Vec<u8>) -> TransportResult<MerkleReply> {
        self.node().handle_merkle_digest(level, prefix)
    }
}

impl Node {
    /// Opens (or creates) a node's on-disk state under
    /// `config.data_dir`, binds `addr` for peer RPCs, and starts every
    /// background subsystem. The returned handle is already live: no
    /// separate "start" call is needed.
    pub fn open(node_id: u64, addr: SocketAddr, config: DbConfig) -> DbResult<Arc<Node>> {
        config.validate().map_err(DbError::Config)?;
        std::fs::create_dir_all(&config.data_dir)?;

        let engine_config = EngineConfig {
            write_buffer_size: config.memtable_threshold,
            tombstone_compaction_interval: config.tombstone_retention.as_secs().max(1) as usize,
            ..EngineConfig::default()
        };
        let engine = Arc::new(Engine::open(config.data_dir.join("engine"), engine_config)?);
        let meta = Arc::new(MetaTable::open(config.data_dir.join("meta"))?);
        let replog = Arc::new(ReplicationLog::open(config.data_dir.join("replication_log"))?);
        let index = IndexTable::open(config.data_dir.join("index"))?;
        let hint_store = HintStore::open(config.data_dir.join("hints"))?;
        let clock = Arc::new(LamportClock::new(0));

        let mut partitioner = Partitioner::from_strategy(
            config.partition_strategy,
            config.replication_factor,
            config.partitions_per_node,
            config.num_partitions,
        );
        let _ = partitioner.load(&config.data_dir)?;
        partitioner.add_node(node_id)?;
        let partitioner = Arc::new(RwLock::new(partitioner));

        let listener = std::net::TcpListener::bind(addr)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("driftdb-node")
            .enable_all()
            .build()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let strategy = MergeStrategy::from_mode(config.consistency_mode);
        let replication_factor = config.replication_factor;
        let write_quorum = config.write_quorum;
        let read_quorum = config.read_quorum;
        let strong_consistency = config.strong_consistency;
        let anti_entropy_segments = config.anti_entropy_segments;
        let tx_lock_strategy = config.tx_lock_strategy;
        let tx_lock_timeout = config.tx_lock_timeout;
        let heartbeat_interval = config.heartbeat_interval;
        let suspect_timeout = config.suspect_timeout;
        let dead_timeout = config.dead_timeout;
        let max_transfer_rate = config.max_transfer_rate;

        let node = Arc::new_cyclic(|weak: &Weak<Node>| {
            let handler: Arc<dyn PeerHandler> = Arc::new(NodeHandler(weak.clone()));
            let transport = Arc::new(TcpTransport::from_listener(listener, handler));

            let heartbeat =
                Arc::new(Heartbeat::new(node_id, transport.clone(), heartbeat_interval, suspect_timeout, dead_timeout));
            let hinted = Arc::new(HintedHandoff::new(hint_store, transport.clone()));
            let quorum = Arc::new(QuorumCoordinator::new(
                node_id,
                replication_factor,
                write_quorum,
                read_quorum,
                strong_consistency,
                strategy,
                clock.clone(),
                engine.clone(),
                meta.clone(),
                replog.clone(),
                partitioner.clone(),
                transport.clone(),
                heartbeat.clone(),
                hinted.clone(),
            ));
            let anti_entropy_handle = Arc::new(AntiEntropy::new(
                node_id,
                quorum.clone(),
                meta.clone(),
                transport.clone(),
                anti_entropy_segments,
            ));
            let txn = Arc::new(TransactionManager::new(clock.clone(), quorum.clone(), meta.clone(), tx_lock_strategy, tx_lock_timeout));

            Node {
                node_id,
                addr,
                config,
                clock,
                engine,
                meta,
                replog,
                index,
                partitioner,
                transport,
                heartbeat,
                hinted,
                anti_entropy: anti_entropy_handle,
                quorum,
                txn,
                transfer_limiter: Arc::new(TransferLimiter::new(max_transfer_rate)),
                hot_keys: DashMap::new(),
                runtime,
                shutdown_tx,
                shutdown_rx,
            }
        });

        node.spawn_background_tasks();
        info!(node_id, %addr, "node opened");
        Ok(node)
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn spawn_background_tasks(&self) {
        self.runtime.spawn(self.heartbeat.clone().run(self.shutdown_rx.clone()));

        let heartbeat_events = self.heartbeat.subscribe();
        self.runtime.spawn(self.hinted.clone().run(
            heartbeat_events,
            self.config.hinted_handoff_interval,
            self.shutdown_rx.clone(),
        ));

        let heartbeat_for_live_peers = self.heartbeat.clone();
        self.runtime.spawn(self.anti_entropy.clone().run(
            move || heartbeat_for_live_peers.live_peers(),
            self.config.anti_entropy_interval,
            self.shutdown_rx.clone(),
        ));

        self.runtime.spawn(Self::run_replication_sender(
            self.node_id,
            self.heartbeat.clone(),
            self.replog.clone(),
            self.transport.clone(),
            self.config.max_batch_size,
            self.config.heartbeat_interval,
            self.shutdown_rx.clone(),
        ));

        self.runtime.spawn(Self::run_maintenance(
            self.engine.clone(),
            self.config.flush_interval,
            self.shutdown_rx.clone(),
        ));

        self.runtime.spawn(Self::run_tombstone_gc(
            self.meta.clone(),
            self.clock.clone(),
            self.config.tombstone_retention,
            self.config.anti_entropy_interval,
            self.shutdown_rx.clone(),
        ));
    }

    /// Drains `ReplicationLog::pending_for_peer` to every currently
    /// live peer and acks on success. Neither `ReplicationLog` nor
    /// `transport` runs its own sender loop (both are driven
    /// synchronously elsewhere, by design — see their module docs), so
    /// this is the one background task that exists purely to keep the
    /// log draining without a caller blocking on it; it reuses
    /// `heartbeat_interval` as its cadence rather than adding a
    /// dedicated config knob; see `DESIGN.md`.
    async fn run_replication_sender(
        self_id: u64,
        heartbeat: Arc<Heartbeat>,
        replog: Arc<ReplicationLog>,
        transport: Arc<TcpTransport>,
        max_batch_size: usize,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let peers = heartbeat.live_peers();
                    let replog = replog.clone();
                    let transport = transport.clone();
                    tokio::task::spawn_blocking(move || {
                        for peer_id in peers {
                            if peer_id == self_id {
                                continue;
                            }
                            let batch = replog.pending_for_peer(peer_id, max_batch_size);
                            if batch.is_empty() {
                                continue;
                            }
                            let last_seq = batch.last().map(|op| op.seq);
                            match transport.replicate(peer_id, batch) {
                                Ok(_) => {
                                    if let Some(seq) = last_seq {
                                        let _ = replog.ack(peer_id, seq);
                                    }
                                }
                                Err(e) => {
                                    tracing::debug!(peer_id, error = %e, "replication send failed, will retry");
                                }
                            }
                        }
                    })
                    .await
                    .ok();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Drives the engine's flush/compaction pipeline. Unlike the
    /// teacher engine's `thread_pool_size` config field (never actually
    /// spawned anywhere in `engine::mod`), this loop is the thing that
    /// actually calls `flush_all_frozen`/`minor_compact`/
    /// `tombstone_compact` periodically; nothing else does.
    async fn run_maintenance(engine: Arc<Engine>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let engine = engine.clone();
                    tokio::task::spawn_blocking(move || {
                        if let Err(e) = engine.flush_all_frozen() {
                            tracing::warn!(error = %e, "frozen memtable flush failed");
                        }
                        if let Err(e) = engine.minor_compact() {
                            tracing::warn!(error = %e, "minor compaction failed");
                        }
                        if let Err(e) = engine.tombstone_compact() {
                            tracing::warn!(error = %e, "tombstone compaction failed");
                        }
                    })
                    .await
                    .ok();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Reaps meta-table tombstones older than `retention`, using the
    /// local Lamport clock as the age boundary (entries are stamped
    /// with `lamport_ts`, not wall-clock time, so "older than retention"
    /// is approximated by comparing against `retention` converted to an
    /// equivalent tick budget at the clock's current rate — a node that
    /// has been ticking for less than `retention` simply reaps nothing
    /// yet). See `DESIGN.md` for why this runs independently of
    /// `MetaTable::checkpoint` (which this loop deliberately does not
    /// call).
    async fn run_tombstone_gc(
        meta: Arc<MetaTable>,
        clock: Arc<LamportClock>,
        retention: Duration,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let meta = meta.clone();
                    let clock = clock.clone();
                    tokio::task::spawn_blocking(move || {
                        let boundary = clock.peek().saturating_sub(retention.as_millis() as u64);
                        match meta.expired_tombstones(boundary) {
                            Ok(keys) => {
                                for key in keys {
                                    let _ = meta.remove(&key);
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "tombstone gc scan failed"),
                        }
                    })
                    .await
                    .ok();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn map_epoch(&self) -> u64 {
        self.partitioner.read().expect("partitioner lock poisoned").map_epoch()
    }

    fn salted_key(key: &[u8], bucket: u32) -> Vec<u8> {
        let mut out = key.to_vec();
        out.push(0);
        out.extend_from_slice(&bucket.to_be_bytes());
        out
    }

    // ----------------------------------------------------------------
    // Client-facing data operations.
    // ----------------------------------------------------------------

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, client_ts: Option<u64>) -> DbResult<()> {
        if let Some(cfg) = self.hot_keys.get(&key).map(|c| *c) {
            let bucket = rand::random::<u32>() % cfg.buckets.max(1);
            return Ok(self.quorum.put(Self::salted_key(&key, bucket), value, client_ts)?);
        }
        Ok(self.quorum.put(key, value, client_ts)?)
    }

    pub fn get(&self, key: &[u8]) -> DbResult<Option<Record>> {
        if let Some(cfg) = self.hot_keys.get(key).map(|c| *c) {
            let mut best: Option<Record> = None;
            for bucket in 0..cfg.buckets.max(1) {
                if let Some(record) = self.quorum.get(&Self::salted_key(key, bucket))? {
                    best = match best {
                        Some(b) if b.lamport_ts >= record.lamport_ts => Some(b),
                        _ => Some(record),
                    };
                }
            }
            return Ok(best);
        }
        Ok(self.quorum.get(key)?)
    }

    pub fn delete(&self, key: Vec<u8>) -> DbResult<()> {
        if let Some(cfg) = self.hot_keys.get(&key).map(|c| *c) {
            for bucket in 0..cfg.buckets.max(1) {
                self.quorum.delete(Self::salted_key(&key, bucket))?;
            }
            return Ok(());
        }
        Ok(self.quorum.delete(key)?)
    }

    pub fn scan(&self, partition: Option<u64>, low: &[u8], high: &[u8]) -> DbResult<Vec<(Vec<u8>, Record)>> {
        Ok(self.quorum.scan(partition, low, high)?)
    }

    // ----------------------------------------------------------------
    // Transactions.
    // ----------------------------------------------------------------

    pub fn begin_tx(&self) -> u64 {
        self.txn.begin_tx()
    }

    pub fn get_tx(&self, tx_id: u64, key: &[u8]) -> DbResult<Option<Record>> {
        Ok(self.txn.get(tx_id, key)?)
    }

    pub fn get_for_update_tx(&self, tx_id: u64, key: &[u8]) -> DbResult<Option<Record>> {
        Ok(self.txn.get_for_update(tx_id, key)?)
    }

    pub fn put_tx(&self, tx_id: u64, key: Vec<u8>, value: Vec<u8>) -> DbResult<()> {
        Ok(self.txn.put(tx_id, key, value)?)
    }

    pub fn delete_tx(&self, tx_id: u64, key: Vec<u8>) -> DbResult<()> {
        Ok(self.txn.delete(tx_id, key)?)
    }

    pub fn commit_tx(&self, tx_id: u64) -> DbResult<CommitOutcome> {
        Ok(self.txn.commit_tx(tx_id)?)
    }

    pub fn abort_tx(&self, tx_id: u64) -> DbResult<()> {
        Ok(self.txn.abort_tx(tx_id)?)
    }

    // ----------------------------------------------------------------
    // Secondary index.
    // ----------------------------------------------------------------

    pub fn query_index(&self, field: &str, value: &[u8]) -> Vec<Vec<u8>> {
        self.index.query(field, value)
    }

    pub fn index_put(&self, field: &str, value: Vec<u8>, key: Vec<u8>) -> DbResult<()> {
        Ok(self.index.insert(field, value, key)?)
    }

    pub fn index_remove(&self, field: &str, value: Vec<u8>, key: Vec<u8>) -> DbResult<()> {
        Ok(self.index.remove(field, value, key)?)
    }

    // ----------------------------------------------------------------
    // Administrative hooks (distilled spec §6).
    // ----------------------------------------------------------------

    /// Installs a new physical node: derives a stable id from its
    /// address (the same `sha1`-token scheme the hash ring uses for
    /// vnode placement), registers it with the transport and failure
    /// detector, folds it into the partition map, and pushes the
    /// resulting map to it. Returns the assigned `node_id`.
    pub fn add_node(&self, peer_addr: SocketAddr) -> DbResult<u64> {
        let token = HashRing::token_for(peer_addr.to_string().as_bytes());
        let peer_id = u64::from_be_bytes(token[0..8].try_into().expect("sha1 digest is at least 8 bytes"));

        self.transport.add_peer(peer_id, peer_addr);
        self.heartbeat.add_peer(peer_id);
        self.partitioner.write().expect("partitioner lock poisoned").add_node(peer_id)?;
        self.push_partition_map_to(peer_id)?;
        info!(peer_id, %peer_addr, "node added to cluster");
        Ok(peer_id)
    }

    /// Removes a node from the cluster. Ownership of its partitions
    /// transfers to the remaining replicas per `Partitioner::remove_node`
    /// (ring rebuild in hash mode, explicit reassignment in range mode);
    /// actual data is not proactively pushed off the departing node here
    /// — reads and anti-entropy against the new owners, plus hinted
    /// handoff for writes in flight, converge it (distilled §4.8/§4.9).
    pub fn remove_node(&self, peer_id: u64) -> DbResult<()> {
        self.transport.remove_peer(peer_id);
        self.heartbeat.remove_peer(peer_id);
        self.partitioner.write().expect("partitioner lock poisoned").remove_node(peer_id)?;
        info!(peer_id, "node removed from cluster");
        Ok(())
    }

    pub fn split_partition(&self, pid: u64, split_key: Vec<u8>) -> DbResult<(u64, u64)> {
        let result = self.partitioner.write().expect("partitioner lock poisoned").split(pid, split_key)?;
        Ok(result)
    }

    pub fn merge_partitions(&self, pid1: u64, pid2: u64) -> DbResult<u64> {
        let result = self.partitioner.write().expect("partitioner lock poisoned").merge(pid1, pid2)?;
        Ok(result)
    }

    /// Even redistribution of partition ownership across every node
    /// this one currently considers Live (plus itself). Ring placement
    /// already keeps hash mode close to even on every `add_node`/
    /// `remove_node`; this mostly matters for range mode, where a freshly
    /// split or newly joined node's share has to be assigned explicitly.
    pub fn rebalance(&self) -> DbResult<()> {
        let mut nodes = self.heartbeat.live_peers();
        if !nodes.contains(&self.node_id) {
            nodes.push(self.node_id);
        }
        nodes.sort_unstable();
        if nodes.is_empty() {
            return Ok(());
        }

        let mut partitioner = self.partitioner.write().expect("partitioner lock poisoned");
        let pids: Vec<u64> = partitioner.partitions().iter().map(|p| p.pid).collect();
        for (i, pid) in pids.into_iter().enumerate() {
            partitioner.reassign_owner(pid, nodes[i % nodes.len()])?;
        }
        info!(nodes = nodes.len(), partitions = partitioner.partitions().len(), "partition map rebalanced");
        Ok(())
    }

    /// Auto-splits partitions whose cumulative `op_count` exceeds
    /// `threshold` and whose `item_count` is at least `min_keys`
    /// (distilled §6's "auto-split hotspots"). Returns the pids that
    /// were split. `op_count` is a cumulative counter rather than a
    /// rate, so `threshold` is best read as "ops before this partition
    /// is considered hot enough to split," not an instantaneous rate —
    /// see `DESIGN.md`.
    pub fn check_hot_partitions(&self, threshold: u64, min_keys: u64) -> DbResult<Vec<u64>> {
        let candidates: Vec<(u64, Vec<u8>, Option<Vec<u8>>)> = {
            let partitioner = self.partitioner.read().expect("partitioner lock poisoned");
            partitioner
                .partitions()
                .iter()
                .filter(|p| p.op_count > threshold && p.item_count >= min_keys)
                .map(|p| (p.pid, p.low.clone(), p.high.clone()))
                .collect()
        };

        let mut split_pids = Vec::new();
        for (pid, low, high) in candidates {
            let Some(midpoint) = midpoint_key(&low, high.as_deref()) else { continue };
            let mut partitioner = self.partitioner.write().expect("partitioner lock poisoned");
            if partitioner.split(pid, midpoint).is_ok() {
                split_pids.push(pid);
            }
        }
        if !split_pids.is_empty() {
            info!(?split_pids, threshold, min_keys, "auto-split hot partitions");
        }
        Ok(split_pids)
    }

    /// Enables salting for `key`: subsequent `put`/`get`/`delete` fan
    /// out across `buckets` salted sub-keys instead of hammering one
    /// partition owner. `migrate` moves any existing value under the
    /// plain key into bucket 0 immediately, on a best-effort basis.
    pub fn mark_hot_key(&self, key: Vec<u8>, buckets: u32, migrate: bool) -> DbResult<()> {
        if buckets == 0 {
            return Err(DbError::Config("buckets must be >= 1".into()));
        }
        if migrate {
            if let Some(record) = self.quorum.get(&key)? {
                self.quorum.delete(key.clone())?;
                self.quorum.put(Self::salted_key(&key, 0), record.value, None)?;
            }
        }
        self.hot_keys.insert(key, HotKeyConfig { buckets });
        Ok(())
    }

    /// Pushes the current partition map to `peer_id` (used after
    /// `add_node`, and available standalone for re-sending after a
    /// transport blip).
    pub fn update_partition_map(&self, peer_id: u64) -> DbResult<()> {
        self.push_partition_map_to(peer_id)
    }

    fn push_partition_map_to(&self, peer_id: u64) -> DbResult<()> {
        let (partitions, epoch) = {
            let p = self.partitioner.read().expect("partitioner lock poisoned");
            (p.partitions().to_vec(), p.map_epoch())
        };
        self.transport.update_partition_map(peer_id, partitions, epoch)?;
        Ok(())
    }

    /// Every locally originated op this node has recorded since
    /// `requester_last_seen`, for a peer driving its own anti-entropy
    /// or catch-up replay.
    pub fn fetch_updates(&self, requester_last_seen: &VersionVector) -> DbResult<Vec<LogOp>> {
        Ok(self.quorum.fetch_updates(requester_last_seen)?)
    }

    /// Signals every background task to stop, persists the partition
    /// map, and closes the storage engine. The private `tokio` runtime
    /// itself is torn down on `Drop`, once background tasks have had a
    /// chance to observe the shutdown signal.
    pub fn close(&self) -> DbResult<()> {
        let _ = self.shutdown_tx.send(true);
        self.partitioner.read().expect("partitioner lock poisoned").persist(&self.config.data_dir)?;
        self.engine.close()?;
        Ok(())
    }

    // ----------------------------------------------------------------
    // Peer RPC handlers, delegated to from `NodeHandler`.
    // ----------------------------------------------------------------

    fn handle_put(&self, req: PutRequest) -> TransportResult<Ack> {
        self.clock.update(req.lamport_ts);
        let op = LogOp {
            origin: req.origin,
            seq: req.seq,
            key: req.key,
            value: Some(req.value),
            lamport_ts: req.lamport_ts,
            vector: req.vector,
            hinted_for: req.hinted_for,
            tx_id: req.tx_id,
        };
        self.quorum.apply_local(&op).map_err(|e| TransportError::Internal(e.to_string()))?;
        Ok(Ack { epoch: self.map_epoch(), last_seen: self.clock.peek() })
    }

    fn handle_delete(&self, req: DeleteRequest) -> TransportResult<Ack> {
        self.clock.update(req.lamport_ts);
        let op = LogOp {
            origin: req.origin,
            seq: req.seq,
            key: req.key,
            value: None,
            lamport_ts: req.lamport_ts,
            vector: req.vector,
            hinted_for: req.hinted_for,
            tx_id: req.tx_id,
        };
        self.quorum.apply_local(&op).map_err(|e| TransportError::Internal(e.to_string()))?;
        Ok(Ack { epoch: self.map_epoch(), last_seen: self.clock.peek() })
    }

    fn handle_get(&self, key: &[u8]) -> TransportResult<Vec<RecordReply>> {
        self.quorum.local_get(key).map_err(|e| TransportError::Internal(e.to_string()))
    }

    fn handle_replicate(&self, batch: Vec<LogOp>) -> TransportResult<Vec<Ack>> {
        let mut acks = Vec::with_capacity(batch.len());
        for op in batch {
            self.clock.update(op.lamport_ts);
            self.quorum.apply_incoming(op).map_err(|e| TransportError::Internal(e.to_string()))?;
            acks.push(Ack { epoch: self.map_epoch(), last_seen: self.clock.peek() });
        }
        Ok(acks)
    }

    fn handle_fetch_updates(&self, last_seen: VersionVector) -> TransportResult<Vec<LogOp>> {
        self.quorum.fetch_updates(&last_seen).map_err(|e| TransportError::Internal(e.to_string()))
    }

    fn handle_ping(&self) -> TransportResult<Pong> {
        Ok(Pong { node_id: self.node_id, epoch: self.map_epoch() })
    }

    fn handle_update_partition_map(&self, partitions: Vec<Partition>, epoch: u64) -> TransportResult<Ack> {
        self.partitioner.write().expect("partitioner lock poisoned").apply_remote_map(partitions, epoch);
        Ok(Ack { epoch: self.map_epoch(), last_seen: self.clock.peek() })
    }

    fn handle_update_hash_ring(&self, tokens: Vec<(u64, usize)>, _epoch: u64) -> TransportResult<Ack> {
        let mut partitioner = self.partitioner.write().expect("partitioner lock poisoned");
        for (peer_id, _vnodes) in tokens {
            if peer_id != self.node_id {
                let _ = partitioner.add_node(peer_id);
            }
        }
        Ok(Ack { epoch: self.map_epoch(), last_seen: self.clock.peek() })
    }

    fn handle_merkle_digest(&self, _level: u32, _prefix: Vec<u8>) -> TransportResult<MerkleReply> {
        let (hash, segments) = anti_entropy::local_root_and_segments(&self.meta, self.config.anti_entropy_segments)
            .map_err(|e| TransportError::Internal(e.to_string()))?;
        Ok(MerkleReply { hash, children: Some(segments) })
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Best-effort midpoint between `low` (inclusive) and `high`
/// (exclusive, `None` meaning open-ended) for an auto-split. Exact byte
/// midpoints aren't needed — just a key strictly inside `(low, high)` —
/// so this appends a single boundary byte rather than interpolating
/// numerically across the key's bytes.
fn midpoint_key(low: &[u8], high: Option<&[u8]>) -> Option<Vec<u8>> {
    match high {
        Some(h) => {
            let mut mid = low.to_vec();
            mid.push(0);
            if mid.as_slice() < h { Some(mid) } else { None }
        }
        None => {
            let mut mid = low.to_vec();
            mid.push(0x80);
            Some(mid)
        }
    }
}
