//! Retry backoff for the sync queue.
//!
//! Exponential doubling from a base interval, capped, with additive jitter so
//! a reconnect does not retry every queued meal at the same instant.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::seconds(2),
            cap: Duration::minutes(5),
            jitter: Duration::seconds(1),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, jitter: Duration) -> Self {
        Self { base, cap, jitter }
    }

    /// Deterministic delay for the nth retry (1-based): `base * 2^(n-1)`,
    /// capped. Strictly increasing below the cap, constant at it.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(30);
        let millis = self
            .base
            .num_milliseconds()
            .saturating_mul(1i64 << exponent);
        Duration::milliseconds(millis.min(self.cap.num_milliseconds()))
    }

    /// When the next attempt becomes eligible: `now + delay + jitter`.
    pub fn next_attempt(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let jitter_ms = self.jitter.num_milliseconds();
        let jitter = if jitter_ms > 0 {
            Duration::milliseconds(rand::rng().random_range(0..=jitter_ms))
        } else {
            Duration::zero()
        };
        now + self.delay(retry_count) + jitter
    }
}
