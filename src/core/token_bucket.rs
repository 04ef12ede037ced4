//! Monotonic-clock token bucket rate limiter.
//!
//! Grounded on the teacher's `core::rate_limiter::TokenBucket`, narrowed to
//! the single-bucket semantics this engine needs: one bucket per process
//! (the interceptor's global admission control), not one per PID. Unlike the
//! teacher's policer, `consume` never sleeps and never accumulates debt —
//! "over budget" means "drop", never "delay" (spec.md §4.1).

use std::sync::Mutex;
use std::time::Instant;

use crate::error::NetShieldError;

/// Inner state protected by the bucket's mutex.
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    bytes_admitted: u64,
    bytes_throttled: u64,
    packets_admitted: u64,
    packets_throttled: u64,
}

/// A classical token bucket: rate `R` bytes/second, capacity `C` bytes,
/// initialized full. Thread-safe for any number of concurrent callers.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Builds a bucket with rate `rate_bytes_per_sec` and burst size
    /// `capacity_bytes`. Both must be strictly positive.
    pub fn new(rate_bytes_per_sec: f64, capacity_bytes: f64) -> Result<Self, NetShieldError> {
        if rate_bytes_per_sec <= 0.0 {
            return Err(NetShieldError::InvalidArgument(
                "token bucket rate must be > 0".into(),
            ));
        }
        if capacity_bytes <= 0.0 {
            return Err(NetShieldError::InvalidArgument(
                "token bucket capacity must be > 0".into(),
            ));
        }
        Ok(TokenBucket {
            rate: rate_bytes_per_sec,
            capacity: capacity_bytes,
            state: Mutex::new(BucketState {
                tokens: capacity_bytes,
                last_refill: Instant::now(),
                bytes_admitted: 0,
                bytes_throttled: 0,
                packets_admitted: 0,
                packets_throttled: 0,
            }),
        })
    }

    /// Refills to `min(capacity, tokens + elapsed * rate)`, then admits `n`
    /// bytes if enough tokens are available. Returns `(allowed,
    /// wait_seconds)`; `wait_seconds` is only meaningful when `allowed` is
    /// false and never causes this call to block.
    ///
    /// `n == 0` is always allowed and never decrements tokens beyond the
    /// refill that already happened.
    pub fn consume(&self, n: u64) -> (bool, f64) {
        let n = n as f64;
        let mut state = self.state.lock().expect("token bucket mutex poisoned");

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);

        if state.tokens >= n {
            state.tokens -= n;
            state.bytes_admitted += n as u64;
            state.packets_admitted += 1;
            (true, 0.0)
        } else {
            let wait = (n - state.tokens) / self.rate;
            state.bytes_throttled += n as u64;
            state.packets_throttled += 1;
            (false, wait)
        }
    }

    /// Cumulative counters since construction, for the session summary.
    pub fn stats(&self) -> TokenBucketStats {
        let state = self.state.lock().expect("token bucket mutex poisoned");
        TokenBucketStats {
            bytes_admitted: state.bytes_admitted,
            bytes_throttled: state.bytes_throttled,
            packets_admitted: state.packets_admitted,
            packets_throttled: state.packets_throttled,
        }
    }
}

/// Cumulative admission statistics exposed alongside `consume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketStats {
    pub bytes_admitted: u64,
    pub bytes_throttled: u64,
    pub packets_admitted: u64,
    pub packets_throttled: u64,
}
