//! Failure detector: periodic `Ping`, Live/Suspect/Dead classification,
//! and the pub/sub hub other subsystems subscribe to for liveness
//! transitions (distilled spec §4.7; the "cyclic references" design
//! note in §9 calling for events over direct callbacks).


use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::replication::transport::PeerRpc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    Live,
    Suspect,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatEvent {
    pub node_id: u64,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Copy)]
struct PeerState {
    status: NodeStatus,
    last_reply: Instant,
    epoch: u64,
}

/// Pings every known peer on an interval and classifies them
/// Live → Suspect → Dead by elapsed time since the last successful
/// reply. A reply at any point resets a peer straight back to Live.
pub struct Heartbeat {
    self_id: u64,
    transport: Arc<dyn PeerRpc>,
    heartbeat_interval: Duration,
    suspect_timeout: Duration,
    dead_timeout: Duration,
    peers: Mutex<HashMap<u64, PeerState>>,
    events: broadcast::Sender<HeartbeatEvent>,
}

impl Heartbeat {
    pub fn new(
        self_id: u64,
        transport: Arc<dyn PeerRpc>,
        heartbeat_interval: Duration,
        suspect_timeout: Duration,
        dead_timeout: Duration,
    ) -> Self {
        let (events, _rx) = broadcast::channel(256);
        Self {
            self_id,
            transport,
            heartbeat_interval,
            suspect_timeout,
            dead_timeout,
            peers: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PeerState>> {
        self.peers.lock().expect("heartbeat peer map poisoned")
    }

    pub fn add_peer(&self, peer_id: u64) {
        if peer_id == self.self_id {
            return;
        }
        self.lock().entry(peer_id).or_insert(PeerState {
            status: NodeStatus::Live,
            last_reply: Instant::now(),
            epoch: 0,
        });
    }

    pub fn remove_peer(&self, peer_id: u64) {
        self.lock().remove(&peer_id);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HeartbeatEvent> {
        self.events.subscribe()
    }

    pub fn status_of(&self, peer_id: u64) -> Option<NodeStatus> {
        self.lock().get(&peer_id).map(|s| s.status)
    }

    pub fn live_peers(&self) -> Vec<u64> {
        self.lock()
            .iter()
            .filter(|(_, s)| s.status == NodeStatus::Live)
            .map(|(&id, _)| id)
            .collect()
    }

    fn publish(&self, node_id: u64, status: NodeStatus) {
        let _ = self.events.send(HeartbeatEvent { node_id, status });
    }

    /// One round: ping every known peer, update and publish status
    /// transitions. Synchronous (blocking) per-peer RPC, matching the
    /// teacher's sync style; `run` drives this on a `tokio` interval.
    pub fn tick(&self) {
        let peer_ids: Vec<u64> = self.lock().keys().copied().collect();
        for peer_id in peer_ids {
            let now = Instant::now();
            match self.transport.ping(peer_id) {
                Ok(pong) => {
                    let mut peers = self.lock();
                    if let Some(state) = peers.get_mut(&peer_id) {
                        let was_live = state.status == NodeStatus::Live;
                        state.last_reply = now;
                        state.epoch = pong.epoch;
                        state.status = NodeStatus::Live;
                        if !was_live {
                            drop(peers);
                            info!(peer_id, "peer transitioned to Live");
                            self.publish(peer_id, NodeStatus::Live);
                        }
                    }
                }
                Err(_) => {
                    let transition = {
                        let mut peers = self.lock();
                        let Some(state) = peers.get_mut(&peer_id) else { continue };
                        let elapsed = now.duration_since(state.last_reply);
                        let next = if elapsed >= self.dead_timeout {
                            NodeStatus::Dead
                        } else if elapsed >= self.suspect_timeout {
                            NodeStatus::Suspect
                        } else {
                            state.status
                        };
                        if next != state.status {
                            state.status = next;
                            Some(next)
                        } else {
                            None
                        }
                    };
                    if let Some(status) = transition {
                        warn!(peer_id, ?status, "peer liveness transition");
                        self.publish(peer_id, status);
                    }
                }
            }
        }
    }

    /// Runs `tick` on `heartbeat_interval` until `shutdown` reports
    /// true, observed at every loop suspension point (distilled §5).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let this = self.clone();
                    tokio::task::spawn_blocking(move || this.tick()).await.ok();
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
