//! Peer transport: the RPC surface between nodes (distilled spec §4.6,
//! §6): `Put`, `Delete`, `Get`, `Replicate`, `FetchUpdates`, `Ping`,
//! `UpdatePartitionMap`, `UpdateHashRing`, `MerkleDigest`.
//!
//! [`PeerRpc`] is the caller-side trait background tasks (replication
//! senders, the heartbeat pinger, hint delivery, anti-entropy) and the
//! quorum coordinator dial through. [`PeerHandler`] is the receiver-side
//! trait a node implements to answer incoming RPCs. Two [`PeerRpc`]
//! implementations exist: [`InProcessTransport`], an in-memory router
//! used by tests to simulate a cluster without sockets, and
//! [`TcpTransport`], framed the way the WAL frames records
//! (length-prefix + CRC32) over a plain `TcpStream` — network I/O stays
//! synchronous, matching the teacher engine's sync-by-default style;
//! `tokio` supplies the timers, channels, and task scheduling for the
//! background task system around it (§5), not per-call async I/O.


use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crc32fast::Hasher as Crc32;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::VersionVector;
use crate::cluster::Partition;
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::replication::log::LogOp;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    PeerUnreachable(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("request timed out")]
    Timeout,

    #[error("frame checksum mismatch")]
    CorruptFrame,

    #[error("unexpected response for this request")]
    UnexpectedResponse,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub lamport_ts: u64,
    pub origin: u64,
    pub seq: u64,
    pub vector: Option<VersionVector>,
    pub hinted_for: Option<u64>,
    pub tx_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub key: Vec<u8>,
    pub lamport_ts: u64,
    pub origin: u64,
    pub seq: u64,
    pub vector: Option<VersionVector>,
    pub hinted_for: Option<u64>,
    pub tx_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub epoch: u64,
    pub last_seen: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordReply {
    pub value: Option<Vec<u8>>,
    pub lamport_ts: u64,
    pub origin: u64,
    pub vector: Option<VersionVector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub node_id: u64,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleReply {
    pub hash: [u8; 20],
    pub children: Option<Vec<[u8; 20]>>,
}

/// Receiver side: what a node answers incoming peer RPCs with.
pub trait PeerHandler: Send + Sync {
    fn node_id(&self) -> u64;
    fn handle_put(&self, req: PutRequest) -> TransportResult<Ack>;
    fn handle_delete(&self, req: DeleteRequest) -> TransportResult<Ack>;
    fn handle_get(&self, key: &[u8]) -> TransportResult<Vec<RecordReply>>;
    fn handle_replicate(&self, batch: Vec<LogOp>) -> TransportResult<Vec<Ack>>;
    fn handle_fetch_updates(&self, last_seen: VersionVector) -> TransportResult<Vec<LogOp>>;
    fn handle_ping(&self) -> TransportResult<Pong>;
    fn handle_update_partition_map(&self, partitions: Vec<Partition>, epoch: u64) -> TransportResult<Ack>;
    fn handle_update_hash_ring(&self, tokens: Vec<(u64, usize)>, epoch: u64) -> TransportResult<Ack>;
    fn handle_merkle_digest(&self, level: u32, prefix: Vec<u8>) -> TransportResult<MerkleReply>;
}

/// Caller side: what background tasks and the quorum coordinator dial.
pub trait PeerRpc: Send + Sync {
    fn put(&self, peer: u64, req: PutRequest) -> TransportResult<Ack>;
    fn delete(&self, peer: u64, req: DeleteRequest) -> TransportResult<Ack>;
    fn get(&self, peer: u64, key: &[u8]) -> TransportResult<Vec<RecordReply>>;
    fn replicate(&self, peer: u64, batch: Vec<LogOp>) -> TransportResult<Vec<Ack>>;
    fn fetch_updates(&self, peer: u64, last_seen: VersionVector) -> TransportResult<Vec<LogOp>>;
    fn ping(&self, peer: u64) -> TransportResult<Pong>;
    fn update_partition_map(&self, peer: u64, partitions: Vec<Partition>, epoch: u64) -> TransportResult<Ack>;
    fn update_hash_ring(&self, peer: u64, tokens: Vec<(u64, usize)>, epoch: u64) -> TransportResult<Ack>;
    fn merkle_digest(&self, peer: u64, level: u32, prefix: Vec<u8>) -> TransportResult<MerkleReply>;
}

// --------------------------------------------------------------------
// In-process transport: routes calls directly to registered handlers.
// Grounded in the teacher's own preference for testing real logic
// without real files via `tempfile::TempDir`; here, without real
// sockets via an in-memory registry.
// --------------------------------------------------------------------

#[derive(Default)]
pub struct InProcessTransport {
    handlers: DashMap<u64, Arc<dyn PeerHandler>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn PeerHandler>) {
        self.handlers.insert(handler.node_id(), handler);
    }

    pub fn unregister(&self, node_id: u64) {
        self.handlers.remove(&node_id);
    }

    pub fn is_registered(&self, node_id: u64) -> bool {
        self.handlers.contains_key(&node_id)
    }

    fn handler(&self, peer: u64) -> TransportResult<Arc<dyn PeerHandler>> {
        self.handlers.get(&peer).map(|h| h.clone()).ok_or(TransportError::PeerUnreachable(peer))
    }
}

impl PeerRpc for InProcessTransport {
    fn put(&self, peer: u64, req: PutRequest) -> TransportResult<Ack> {
        self.handler(peer)?.handle_put(req)
    }
    fn delete(&self, peer: u64, req: DeleteRequest) -> TransportResult<Ack> {
        self.handler(peer)?.handle_delete(req)
    }
    fn get(&self, peer: u64, key: &[u8]) -> TransportResult<Vec<RecordReply>> {
        self.handler(peer)?.handle_get(key)
    }
    fn replicate(&self, peer: u64, batch: Vec<LogOp>) -> TransportResult<Vec<Ack>> {
        self.handler(peer)?.handle_replicate(batch)
    }
    fn fetch_updates(&self, peer: u64, last_seen: VersionVector) -> TransportResult<Vec<LogOp>> {
        self.handler(peer)?.handle_fetch_updates(last_seen)
    }
    fn ping(&self, peer: u64) -> TransportResult<Pong> {
        self.handler(peer)?.handle_ping()
    }
    fn update_partition_map(&self, peer: u64, partitions: Vec<Partition>, epoch: u64) -> TransportResult<Ack> {
        self.handler(peer)?.handle_update_partition_map(partitions, epoch)
    }
    fn update_hash_ring(&self, peer: u64, tokens: Vec<(u64, usize)>, epoch: u64) -> TransportResult<Ack> {
        self.handler(peer)?.handle_update_hash_ring(tokens, epoch)
    }
    fn merkle_digest(&self, peer: u64, level: u32, prefix: Vec<u8>) -> TransportResult<MerkleReply> {
        self.handler(peer)?.handle_merkle_digest(level, prefix)
    }
}

// --------------------------------------------------------------------
// Wire framing: length-prefixed body + trailing CRC32, the same shape
// `wal::Wal<T>` uses for its own records.
// --------------------------------------------------------------------

#[derive(Debug)]
enum Message {
    PutReq(PutRequest),
    DeleteReq(DeleteRequest),
    GetReq(Vec<u8>),
    ReplicateReq(Vec<LogOp>),
    FetchUpdatesReq(VersionVector),
    PingReq,
    UpdatePartitionMapReq { partitions: Vec<Partition>, epoch: u64 },
    UpdateHashRingReq { tokens: Vec<(u64, usize)>, epoch: u64 },
    MerkleDigestReq { level: u32, prefix: Vec<u8> },

    AckResp(Ack),
    GetResp(Vec<RecordReply>),
    ReplicateResp(Vec<Ack>),
    FetchUpdatesResp(Vec<LogOp>),
    PingResp(Pong),
    MerkleResp(MerkleReply),
    ErrorResp(String),
}

impl Encode for Ack {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.epoch.encode_to(buf)?;
        self.last_seen.encode_to(buf)?;
        Ok(())
    }
}
impl Decode for Ack {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (epoch, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (last_seen, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { epoch, last_seen }, offset))
    }
}

impl Encode for Pong {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.node_id.encode_to(buf)?;
        self.epoch.encode_to(buf)?;
        Ok(())
    }
}
impl Decode for Pong {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (node_id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (epoch, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { node_id, epoch }, offset))
    }
}

impl Encode for RecordReply {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.value.encode_to(buf)?;
        self.lamport_ts.encode_to(buf)?;
        self.origin.encode_to(buf)?;
        self.vector.encode_to(buf)?;
        Ok(())
    }
}
impl Decode for RecordReply {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (value, n) = Option::<Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (lamport_ts, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (origin, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (vector, n) = Option::<VersionVector>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { value, lamport_ts, origin, vector }, offset))
    }
}

impl Encode for MerkleReply {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.hash.to_vec().encode_to(buf)?;
        match &self.children {
            None => false.encode_to(buf)?,
            Some(children) => {
                true.encode_to(buf)?;
                let flat: Vec<Vec<u8>> = children.iter().map(|c| c.to_vec()).collect();
                encoding::encode_vec(&flat, buf)?;
            }
        }
        Ok(())
    }
}
impl Decode for MerkleReply {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (hash_vec, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&hash_vec);
        let (has_children, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        let children = if has_children {
            let (flat, n) = encoding::decode_vec::<Vec<u8>>(&buf[offset..])?;
            offset += n;
            Some(
                flat.into_iter()
                    .map(|v| {
                        let mut arr = [0u8; 20];
                        arr.copy_from_slice(&v);
                        arr
                    })
                    .collect(),
            )
        } else {
            None
        };
        Ok((Self { hash, children }, offset))
    }
}

impl Encode for PutRequest {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        self.lamport_ts.encode_to(buf)?;
        self.origin.encode_to(buf)?;
        self.seq.encode_to(buf)?;
        self.vector.encode_to(buf)?;
        self.hinted_for.encode_to(buf)?;
        self.tx_id.encode_to(buf)?;
        Ok(())
    }
}
impl Decode for PutRequest {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (lamport_ts, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (origin, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (vector, n) = Option::<VersionVector>::decode_from(&buf[offset..])?;
        offset += n;
        let (hinted_for, n) = Option::<u64>::decode_from(&buf[offset..])?;
        offset += n;
        let (tx_id, n) = Option::<u64>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { key, value, lamport_ts, origin, seq, vector, hinted_for, tx_id }, offset))
    }
}

impl Encode for DeleteRequest {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.lamport_ts.encode_to(buf)?;
        self.origin.encode_to(buf)?;
        self.seq.encode_to(buf)?;
        self.vector.encode_to(buf)?;
        self.hinted_for.encode_to(buf)?;
        self.tx_id.encode_to(buf)?;
        Ok(())
    }
}
impl Decode for DeleteRequest {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (lamport_ts, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (origin, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (vector, n) = Option::<VersionVector>::decode_from(&buf[offset..])?;
        offset += n;
        let (hinted_for, n) = Option::<u64>::decode_from(&buf[offset..])?;
        offset += n;
        let (tx_id, n) = Option::<u64>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { key, lamport_ts, origin, seq, vector, hinted_for, tx_id }, offset))
    }
}

impl Encode for (u64, usize) {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.0.encode_to(buf)?;
        (self.1 as u64).encode_to(buf)?;
        Ok(())
    }
}
impl Decode for (u64, usize) {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (a, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (b, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok(((a, b as usize), offset))
    }
}

impl Encode for Message {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Message::PutReq(r) => { 0u8.encode_to(buf)?; r.encode_to(buf)?; }
            Message::DeleteReq(r) => { 1u8.encode_to(buf)?; r.encode_to(buf)?; }
            Message::GetReq(k) => { 2u8.encode_to(buf)?; k.encode_to(buf)?; }
            Message::ReplicateReq(batch) => { 3u8.encode_to(buf)?; encoding::encode_vec(batch, buf)?; }
            Message::FetchUpdatesReq(v) => { 4u8.encode_to(buf)?; v.encode_to(buf)?; }
            Message::PingReq => { 5u8.encode_to(buf)?; }
            Message::UpdatePartitionMapReq { partitions, epoch } => {
                6u8.encode_to(buf)?;
                encoding::encode_vec(partitions, buf)?;
                epoch.encode_to(buf)?;
            }
            Message::UpdateHashRingReq { tokens, epoch } => {
                7u8.encode_to(buf)?;
                encoding::encode_vec(tokens, buf)?;
                epoch.encode_to(buf)?;
            }
            Message::MerkleDigestReq { level, prefix } => {
                8u8.encode_to(buf)?;
                level.encode_to(buf)?;
                prefix.encode_to(buf)?;
            }
            Message::AckResp(a) => { 9u8.encode_to(buf)?; a.encode_to(buf)?; }
            Message::GetResp(rs) => { 10u8.encode_to(buf)?; encoding::encode_vec(rs, buf)?; }
            Message::ReplicateResp(acks) => { 11u8.encode_to(buf)?; encoding::encode_vec(acks, buf)?; }
            Message::FetchUpdatesResp(ops) => { 12u8.encode_to(buf)?; encoding::encode_vec(ops, buf)?; }
            Message::PingResp(p) => { 13u8.encode_to(buf)?; p.encode_to(buf)?; }
            Message::MerkleResp(m) => { 14u8.encode_to(buf)?; m.encode_to(buf)?; }
            Message::ErrorResp(s) => { 15u8.encode_to(buf)?; s.encode_to(buf)?; }
        }
        Ok(())
    }
}

impl Decode for Message {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (tag, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        macro_rules! field {
            ($ty:ty) => {{
                let (v, n) = <$ty>::decode_from(&buf[offset..])?;
                offset += n;
                v
            }};
        }
        let msg = match tag {
            0 => Message::PutReq(field!(PutRequest)),
            1 => Message::DeleteReq(field!(DeleteRequest)),
            2 => Message::GetReq(field!(Vec<u8>)),
            3 => {
                let (batch, n) = encoding::decode_vec::<LogOp>(&buf[offset..])?;
                offset += n;
                Message::ReplicateReq(batch)
            }
            4 => Message::FetchUpdatesReq(field!(VersionVector)),
            5 => Message::PingReq,
            6 => {
                let (partitions, n) = encoding::decode_vec::<Partition>(&buf[offset..])?;
                offset += n;
                let epoch = field!(u64);
                Message::UpdatePartitionMapReq { partitions, epoch }
            }
            7 => {
                let (tokens, n) = encoding::decode_vec::<(u64, usize)>(&buf[offset..])?;
                offset += n;
                let epoch = field!(u64);
                Message::UpdateHashRingReq { tokens, epoch }
            }
            8 => {
                let level = field!(u32);
                let prefix = field!(Vec<u8>);
                Message::MerkleDigestReq { level, prefix }
            }
            9 => Message::AckResp(field!(Ack)),
            10 => {
                let (rs, n) = encoding::decode_vec::<RecordReply>(&buf[offset..])?;
                offset += n;
                Message::GetResp(rs)
            }
            11 => {
                let (acks, n) = encoding::decode_vec::<Ack>(&buf[offset..])?;
                offset += n;
                Message::ReplicateResp(acks)
            }
            12 => {
                let (ops, n) = encoding::decode_vec::<LogOp>(&buf[offset..])?;
                offset += n;
                Message::FetchUpdatesResp(ops)
            }
            13 => Message::PingResp(field!(Pong)),
            14 => Message::MerkleResp(field!(MerkleReply)),
            15 => Message::ErrorResp(field!(String)),
            _ => return Err(EncodingError::InvalidTag { tag: tag as u32, type_name: "Message" }),
        };
        Ok((msg, offset))
    }
}

fn write_frame(stream: &mut TcpStream, msg: &Message) -> TransportResult<()> {
    let body = encoding::encode_to_vec(msg)?;
    let mut hasher = Crc32::new();
    hasher.update(&body);
    let checksum = hasher.finalize();

    stream.write_all(&(body.len() as u32).to_le_bytes())?;
    stream.write_all(&body)?;
    stream.write_all(&checksum.to_le_bytes())?;
    stream.flush()?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> TransportResult<Message> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;

    let mut crc_buf = [0u8; 4];
    stream.read_exact(&mut crc_buf)?;
    let expected = u32::from_le_bytes(crc_buf);

    let mut hasher = Crc32::new();
    hasher.update(&body);
    if hasher.finalize() != expected {
        return Err(TransportError::CorruptFrame);
    }

    let (msg, _) = encoding::decode_from_slice::<Message>(&body)?;
    Ok(msg)
}

/// Framed-TCP peer transport. Dials a fresh connection per call (no
/// pooling) — simple, at the cost of reconnect overhead per RPC; the
/// background senders this feeds already batch at a higher level
/// (`ReplicationLog::pending_for_peer`), so the per-call connection
/// cost is amortized over a batch rather than per op.
pub struct TcpTransport {
    local: Arc<dyn PeerHandler>,
    peers: Mutex<HashMap<u64, SocketAddr>>,
    dial_timeout: Duration,
    _listener_shutdown: Arc<Mutex<bool>>,
}

impl TcpTransport {
    /// Spawns a background accept loop serving `local`'s handlers on
    /// `bind_addr`. One thread per connection; each connection handles
    /// exactly one request/response pair then closes (callers do not
    /// keep connections open, per `write_frame`/`read_frame` above).
    pub fn serve(local: Arc<dyn PeerHandler>, bind_addr: SocketAddr) -> TransportResult<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        Ok(Self::from_listener(listener, local))
    }

    /// As [`Self::serve`], but over an already-bound listener. Lets a
    /// caller bind the socket (a fallible step) before constructing the
    /// handler that will serve it — [`crate::node::Node`] needs this to
    /// hand itself a reference to the very transport it is binding
    /// (distilled spec §9's "cyclic references" note, resolved here via
    /// `Arc::new_cyclic` rather than a callback hub, since the cycle is
    /// a single self-reference rather than node-to-peer).
    pub fn from_listener(listener: TcpListener, local: Arc<dyn PeerHandler>) -> Self {
        let shutdown = Arc::new(Mutex::new(false));
        let shutdown_clone = shutdown.clone();
        let handler = local.clone();

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                if *shutdown_clone.lock().expect("shutdown flag poisoned") {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let handler = handler.clone();
                        std::thread::spawn(move || {
                            if let Err(e) = Self::serve_one(handler, stream) {
                                debug!("peer connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("accept error: {}", e),
                }
            }
        });

        Self { local, peers: Mutex::new(HashMap::new()), dial_timeout: Duration::from_secs(5), _listener_shutdown: shutdown }
    }

    fn serve_one(handler: Arc<dyn PeerHandler>, mut stream: TcpStream) -> TransportResult<()> {
        let req = read_frame(&mut stream)?;
        let resp = Self::dispatch(&*handler, req);
        write_frame(&mut stream, &resp)
    }

    fn dispatch(handler: &dyn PeerHandler, req: Message) -> Message {
        let result = match req {
            Message::PutReq(r) => handler.handle_put(r).map(Message::AckResp),
            Message::DeleteReq(r) => handler.handle_delete(r).map(Message::AckResp),
            Message::GetReq(k) => handler.handle_get(&k).map(Message::GetResp),
            Message::ReplicateReq(batch) => handler.handle_replicate(batch).map(Message::ReplicateResp),
            Message::FetchUpdatesReq(v) => handler.handle_fetch_updates(v).map(Message::FetchUpdatesResp),
            Message::PingReq => handler.handle_ping().map(Message::PingResp),
            Message::UpdatePartitionMapReq { partitions, epoch } => {
                handler.handle_update_partition_map(partitions, epoch).map(Message::AckResp)
            }
            Message::UpdateHashRingReq { tokens, epoch } => {
                handler.handle_update_hash_ring(tokens, epoch).map(Message::AckResp)
            }
            Message::MerkleDigestReq { level, prefix } => {
                handler.handle_merkle_digest(level, prefix).map(Message::MerkleResp)
            }
            _ => Err(TransportError::UnexpectedResponse),
        };
        result.unwrap_or_else(|e| Message::ErrorResp(e.to_string()))
    }

    pub fn add_peer(&self, node_id: u64, addr: SocketAddr) {
        self.peers.lock().expect("peers mutex poisoned").insert(node_id, addr);
    }

    pub fn remove_peer(&self, node_id: u64) {
        self.peers.lock().expect("peers mutex poisoned").remove(&node_id);
    }

    fn call(&self, peer: u64, req: Message) -> TransportResult<Message> {
        let addr = *self
            .peers
            .lock()
            .expect("peers mutex poisoned")
            .get(&peer)
            .ok_or(TransportError::PeerUnreachable(peer))?;

        let mut stream = TcpStream::connect_timeout(&addr, self.dial_timeout)
            .map_err(|_| TransportError::PeerUnreachable(peer))?;
        stream.set_read_timeout(Some(self.dial_timeout))?;
        stream.set_write_timeout(Some(self.dial_timeout))?;

        write_frame(&mut stream, &req)?;
        let resp = read_frame(&mut stream)?;
        if let Message::ErrorResp(msg) = &resp {
            warn!("peer {} returned an error: {}", peer, msg);
        }
        Ok(resp)
    }
}

impl PeerRpc for TcpTransport {
    fn put(&self, peer: u64, req: PutRequest) -> TransportResult<Ack> {
        match self.call(peer, Message::PutReq(req))? {
            Message::AckResp(a) => Ok(a),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }
    fn delete(&self, peer: u64, req: DeleteRequest) -> TransportResult<Ack> {
        match self.call(peer, Message::DeleteReq(req))? {
            Message::AckResp(a) => Ok(a),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }
    fn get(&self, peer: u64, key: &[u8]) -> TransportResult<Vec<RecordReply>> {
        match self.call(peer, Message::GetReq(key.to_vec()))? {
            Message::GetResp(rs) => Ok(rs),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }
    fn replicate(&self, peer: u64, batch: Vec<LogOp>) -> TransportResult<Vec<Ack>> {
        match self.call(peer, Message::ReplicateReq(batch))? {
            Message::ReplicateResp(acks) => Ok(acks),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }
    fn fetch_updates(&self, peer: u64, last_seen: VersionVector) -> TransportResult<Vec<LogOp>> {
        match self.call(peer, Message::FetchUpdatesReq(last_seen))? {
            Message::FetchUpdatesResp(ops) => Ok(ops),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }
    fn ping(&self, peer: u64) -> TransportResult<Pong> {
        match self.call(peer, Message::PingReq)? {
            Message::PingResp(p) => Ok(p),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }
    fn update_partition_map(&self, peer: u64, partitions: Vec<Partition>, epoch: u64) -> TransportResult<Ack> {
        match self.call(peer, Message::UpdatePartitionMapReq { partitions, epoch })? {
            Message::AckResp(a) => Ok(a),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }
    fn update_hash_ring(&self, peer: u64, tokens: Vec<(u64, usize)>, epoch: u64) -> TransportResult<Ack> {
        match self.call(peer, Message::UpdateHashRingReq { tokens, epoch })? {
            Message::AckResp(a) => Ok(a),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }
    fn merkle_digest(&self, peer: u64, level: u32, prefix: Vec<u8>) -> TransportResult<MerkleReply> {
        match self.call(peer, Message::MerkleDigestReq { level, prefix })? {
            Message::MerkleResp(m) => Ok(m),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        *self._listener_shutdown.lock().expect("shutdown flag poisoned") = true;
    }
}
