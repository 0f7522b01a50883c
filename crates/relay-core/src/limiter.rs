//! Token-bucket admission control.
//!
//! One bucket per client session plus one global bucket shared by all
//! sessions. The bucket is not internally synchronized; owners wrap it in a
//! mutex.

use std::time::Instant;

/// A token bucket with a real-valued count.
///
/// Starts full, refills continuously at `rate` tokens per second, and caps
/// at `burst`. Each admitted packet costs one token.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            tokens: burst,
            capacity: burst,
            rate,
            last_refill: Instant::now(),
        }
    }

    /// Refill by elapsed time, then admit if at least one token remains.
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
