//! Partitioning and routing: consistent hash ring with virtual nodes,
//! the hash/range partitioner, and inter-node transfer rate limiting.
//!
//! Grounded in distilled spec §4.10/§4.13: the ring maps a key to a
//! preference list of physical nodes; the partitioner additionally
//! assigns each key a partition id, and owns `split`/`merge`/`map_epoch`.

pub mod hash_ring;
pub mod partitioner;
pub mod transfer_limiter;

pub use hash_ring::HashRing;
pub use partitioner::{Partition, PartitionError, Partitioner};
pub use transfer_limiter::TransferLimiter;
