//! Hinted handoff: a durable per-destination queue of writes accepted
//! on behalf of an unreachable owner, drained once the owner is
//! observed Live again (distilled spec §4.8).


use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::replication::heartbeat::{HeartbeatEvent, NodeStatus};
use crate::replication::log::LogOp;
use crate::replication::transport::PeerRpc;
use crate::wal::{Wal, WalError};

#[derive(Debug, Error)]
pub enum HintError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn hint_filename(original_owner: u64) -> String {
    format!("{original_owner}.log")
}

/// Durable queues, one `Wal<LogOp>` per original owner this node is
/// currently holding hints for.
pub struct HintStore {
    dir: PathBuf,
    queues: Mutex<HashMap<u64, Wal<LogOp>>>,
}

impl HintStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, HintError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut queues = HashMap::new();

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".log") else { continue };
            let Ok(original_owner) = stem.parse::<u64>() else { continue };
            let wal = Wal::<LogOp>::open(dir.join(&hint_filename(original_owner)), None)?;
            queues.insert(original_owner, wal);
        }

        Ok(Self { dir, queues: Mutex::new(queues) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Wal<LogOp>>> {
        self.queues.lock().expect("hint store mutex poisoned")
    }

    pub fn append(&self, original_owner: u64, op: LogOp) -> Result<(), HintError> {
        let mut queues = self.lock();
        let wal = match queues.entry(original_owner) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let wal = Wal::<LogOp>::open(self.dir.join(hint_filename(original_owner)), None)?;
                e.insert(wal)
            }
        };
        wal.append(&op)?;
        Ok(())
    }

    /// All currently-queued hints for `original_owner`, oldest first.
    pub fn pending(&self, original_owner: u64) -> Result<Vec<LogOp>, HintError> {
        let queues = self.lock();
        let Some(wal) = queues.get(&original_owner) else { return Ok(Vec::new()) };
        let mut out = Vec::new();
        for item in wal.replay_iter()? {
            match item {
                Ok(op) => out.push(op),
                Err(_) => break,
            }
        }
        Ok(out)
    }

    /// Drops every hint for `original_owner` (successful full delivery)
    /// and requeues any that are passed back undelivered.
    pub fn replace(&self, original_owner: u64, undelivered: Vec<LogOp>) -> Result<(), HintError> {
        let mut queues = self.lock();
        if let Some(wal) = queues.get_mut(&original_owner) {
            wal.truncate()?;
            for op in &undelivered {
                wal.append(op)?;
            }
        }
        Ok(())
    }

    pub fn owners_with_hints(&self) -> Vec<u64> {
        self.lock()
            .iter()
            .filter(|(_, wal)| wal.replay_iter().map(|mut it| it.next().is_some()).unwrap_or(false))
            .map(|(&id, _)| id)
            .collect()
    }
}

/// Ties [`HintStore`] to the transport and the heartbeat's liveness
/// events: accepts hints from the quorum coordinator's sloppy
/// substitution path, and drains them once the original owner is seen
/// Live again.
pub struct HintedHandoff {
    store: HintStore,
    transport: Arc<dyn PeerRpc>,
}

impl HintedHandoff {
    pub fn new(store: HintStore, transport: Arc<dyn PeerRpc>) -> Self {
        Self { store, transport }
    }

    pub fn accept(&self, original_owner: u64, op: LogOp) -> Result<(), HintError> {
        self.store.append(original_owner, op)
    }

    /// Streams every queued hint for `original_owner` to it via
    /// `Replicate`, deleting delivered hints and keeping any that fail.
    /// Returns the number of hints successfully delivered.
    pub fn deliver(&self, original_owner: u64) -> Result<usize, HintError> {
        let pending = self.store.pending(original_owner)?;
        if pending.is_empty() {
            return Ok(0);
        }

        match self.transport.replicate(original_owner, pending.clone()) {
            Ok(acks) if acks.len() == pending.len() => {
                self.store.replace(original_owner, Vec::new())?;
                info!(original_owner, delivered = pending.len(), "hints delivered");
                Ok(pending.len())
            }
            Ok(_) | Err(_) => {
                warn!(original_owner, "hint delivery incomplete, keeping queue");
                Ok(0)
            }
        }
    }

    /// Reacts to Live transitions by draining that peer's hints, and
    /// periodically re-sweeps every owner with pending hints (covers a
    /// missed or coalesced heartbeat event).
    pub async fn run(
        self: Arc<Self>,
        mut heartbeat_events: broadcast::Receiver<HeartbeatEvent>,
        sweep_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            tokio::select! {
                event = heartbeat_events.recv() => {
                    if let Ok(HeartbeatEvent { node_id, status: NodeStatus::Live }) = event {
                        let this = self.clone();
                        tokio::task::spawn_blocking(move || { let _ = this.deliver(node_id); }).await.ok();
                    }
                }
                _ = ticker.tick() => {
                    let owners = self.store.owners_with_hints();
                    for owner in owners {
                        let this = self.clone();
                        tokio::task::spawn_blocking(move || { let _ = this.deliver(owner); }).await.ok();
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
