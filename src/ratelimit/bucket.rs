//! Token bucket implementation.

use std::time::Instant;

/// A token bucket that refills continuously and is advanced lazily.
///
/// The bucket is not synchronized; the owning entry serializes access.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Tokens currently available, possibly fractional
    tokens: f64,
    /// Maximum number of tokens the bucket holds
    capacity: f64,
    /// Tokens added per second
    refill_per_second: f64,
    /// When `tokens` was last brought up to date
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket that starts full.
    pub fn new(refill_per_second: f64, capacity: u32, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            tokens: capacity,
            capacity,
            refill_per_second,
            last_refill: now,
        }
    }

    /// Take one token if at least one is available.
    ///
    /// Returns `true` if the token was taken. A refusal leaves the bucket untouched.
    pub fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens available at `now`.
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Advance the bucket to `now`.
    ///
    /// A `now` earlier than the last refill is treated as no elapsed time.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }

        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_second)
            .min(self.capacity);
        self.last_refill = now;
    }
}
