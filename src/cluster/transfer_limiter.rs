//! Token-bucket rate limiter gating inter-node SSTable segment transfer
//! during `add_node`/`remove_node` (distilled spec §5, `max_transfer_rate`).

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Bytes/second token bucket. `acquire` blocks (via `std::thread::sleep`)
/// until enough tokens are available rather than rejecting, matching
/// the spec's "throttled" wording rather than a hard admission-control
/// rejection.
#[derive(Debug)]
pub struct TransferLimiter {
    rate_bytes_per_sec: u64,
    capacity: u64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TransferLimiter {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        let capacity = rate_bytes_per_sec.max(1);
        Self {
            rate_bytes_per_sec: capacity,
            capacity,
            state: Mutex::new(BucketState { tokens: capacity as f64, last_refill: Instant::now() }),
        }
    }

    fn refill(state: &mut BucketState, rate: u64, capacity: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * rate as f64).min(capacity as f64);
        state.last_refill = now;
    }

    /// Blocks until `bytes` tokens are available, then consumes them.
    pub fn acquire(&self, bytes: u64) {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("transfer limiter mutex poisoned");
                Self::refill(&mut state, self.rate_bytes_per_sec, self.capacity);
                if state.tokens >= bytes as f64 {
                    state.tokens -= bytes as f64;
                    return;
                }
                let deficit = bytes as f64 - state.tokens;
                Duration::from_secs_f64(deficit / self.rate_bytes_per_sec as f64)
            };
            std::thread::sleep(wait.min(Duration::from_millis(250)));
        }
    }

    /// Non-blocking variant: returns `true` and consumes tokens if
    /// available, `false` (no tokens consumed) otherwise.
    pub fn try_acquire(&self, bytes: u64) -> bool {
        let mut state = self.state.lock().expect("transfer limiter mutex poisoned");
        Self::refill(&mut state, self.rate_bytes_per_sec, self.capacity);
        if state.tokens >= bytes as f64 {
            state.tokens -= bytes as f64;
            true
        } else {
            false
        }
    }
}
