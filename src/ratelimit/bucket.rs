//! Token bucket engine.
//!
//! Pure refill and decrement math over a [`BucketState`]. The same functions
//! run inside the store's atomic section and in-process for projections, so
//! nothing here touches a clock or shared state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tolerance for token comparisons, so a request within rounding error of
/// the available tokens is admitted.
pub const TOKEN_EPSILON: f64 = 1e-9;

/// Authoritative state of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Maximum tokens the bucket can hold
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
    /// Tokens currently available, in `0..=capacity`
    pub tokens: f64,
    /// Time of the last refill in epoch milliseconds
    pub last_refill_ms: u64,
}

/// The result of evaluating a request against a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// Whether the requested tokens were available
    pub allowed: bool,
    /// Tokens left after the decision
    pub tokens_after: f64,
    /// Time at which enough tokens will have accrued, in epoch milliseconds.
    /// Equal to `now` when allowed; `None` when the bucket never refills.
    pub next_refill_deadline_ms: Option<u64>,
}

impl Evaluation {
    /// The wait implied by `next_refill_deadline_ms`, relative to `now_ms`.
    pub fn retry_after(&self, now_ms: u64) -> Option<Duration> {
        self.next_refill_deadline_ms
            .map(|deadline| Duration::from_millis(deadline.saturating_sub(now_ms)))
    }
}

impl BucketState {
    /// A full bucket, as created on first access.
    pub fn full(capacity: f64, refill_rate: f64, now_ms: u64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill_ms: now_ms,
        }
    }

    /// Apply a new capacity and refill rate, clamping stored tokens.
    pub fn reconfigure(&mut self, capacity: f64, refill_rate: f64) {
        self.capacity = capacity;
        self.refill_rate = refill_rate;
        self.tokens = self.tokens.clamp(0.0, capacity);
    }

    /// Accrue tokens for the time elapsed since the last refill.
    ///
    /// A `now_ms` earlier than the last refill adds nothing and leaves the
    /// timestamp where it was.
    pub fn refill(&mut self, now_ms: u64) {
        if now_ms <= self.last_refill_ms {
            return;
        }
        let elapsed_secs = (now_ms - self.last_refill_ms) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed_secs * self.refill_rate).min(self.capacity);
        self.last_refill_ms = now_ms;
    }

    /// Whether `requested` tokens are available right now, without refilling.
    pub fn has_tokens(&self, requested: f64) -> bool {
        self.tokens + TOKEN_EPSILON >= requested
    }

    /// When `requested` tokens will be available, assuming no other consumer.
    pub fn deadline_for(&self, requested: f64, now_ms: u64) -> Option<u64> {
        if self.has_tokens(requested) {
            return Some(now_ms);
        }
        if self.refill_rate <= 0.0 {
            return None;
        }
        let missing = requested - self.tokens;
        let wait_ms = (missing / self.refill_rate * 1000.0).ceil();
        Some(now_ms.saturating_add(wait_ms as u64))
    }

    /// Refill, then take `requested` tokens if they are available.
    ///
    /// A denied request leaves the token count as refilled.
    pub fn evaluate(&mut self, now_ms: u64, requested: f64) -> Evaluation {
        self.refill(now_ms);

        if self.has_tokens(requested) {
            self.tokens = (self.tokens - requested).max(0.0);
            Evaluation {
                allowed: true,
                tokens_after: self.tokens,
                next_refill_deadline_ms: Some(now_ms),
            }
        } else {
            Evaluation {
                allowed: false,
                tokens_after: self.tokens,
                next_refill_deadline_ms: self.deadline_for(requested, now_ms),
            }
        }
    }

    /// Add tokens directly, capped at capacity. Returns the new count.
    pub fn add_tokens(&mut self, tokens: f64) -> f64 {
        self.tokens = (self.tokens + tokens.max(0.0)).min(self.capacity);
        self.tokens
    }
}
