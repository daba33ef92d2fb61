//! Rate limiting for tool calls.
//!
//! Token bucket per caller identity with lazy refill: each `consume` first
//! credits whole refill periods elapsed since the last refill, then tries to
//! take one token.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

/// Configuration for rate limiting.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens a bucket can hold.
    pub capacity: u32,
    /// Refill period.
    pub refill_every: Duration,
    /// Tokens credited per elapsed period.
    pub refill_amount: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 30,
            refill_every: Duration::from_secs(60),
            refill_amount: 30,
        }
    }
}

struct RateBucket {
    tokens: u32,
    last_refill_at: Instant,
}

/// Rate limiter state tracking buckets per caller identity.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, RateBucket>>,
}

/// Outcome of one consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeResult {
    pub allowed: bool,
    pub remaining: u32,
    /// How long until the next refill, for Retry-After style hints.
    pub ms_until_reset: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for the caller, refilling lazily first.
    pub fn consume(&self, caller_id: &str) -> ConsumeResult {
        let mut buckets = self.buckets.lock();
        let now = Instant::now();

        let bucket = buckets.entry(caller_id.to_string()).or_insert(RateBucket {
            tokens: self.config.capacity,
            last_refill_at: now,
        });

        let elapsed = now.duration_since(bucket.last_refill_at);
        let periods = (elapsed.as_millis() / self.config.refill_every.as_millis().max(1)) as u32;
        if periods > 0 {
            bucket.tokens = bucket
                .tokens
                .saturating_add(periods.saturating_mul(self.config.refill_amount))
                .min(self.config.capacity);
            bucket.last_refill_at += self.config.refill_every * periods;
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            ConsumeResult {
                allowed: true,
                remaining: bucket.tokens,
                ms_until_reset: 0,
            }
        } else {
            let since_refill = now.duration_since(bucket.last_refill_at);
            let ms_until_reset = self
                .config
                .refill_every
                .saturating_sub(since_refill)
                .as_millis() as u64;
            warn!(
                caller_id = %caller_id,
                ms_until_reset,
                "Rate limit exceeded"
            );
            ConsumeResult {
                allowed: false,
                remaining: 0,
                ms_until_reset,
            }
        }
    }

    /// Periodic cleanup of buckets idle longer than 10 refill periods
    /// (call from a background task).
    pub fn cleanup(&self) {
        let mut buckets = self.buckets.lock();
        let now = Instant::now();
        let horizon = self.config.refill_every * 10;
        buckets.retain(|_, bucket| now.duration_since(bucket.last_refill_at) < horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, refill_ms: u64, refill_amount: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            capacity,
            refill_every: Duration::from_millis(refill_ms),
            refill_amount,
        })
    }

    #[test]
    fn test_allows_up_to_capacity() {
        let rl = limiter(5, 60_000, 5);
        for i in 0..5 {
            let r = rl.consume("caller");
            assert!(r.allowed, "call {i} should be allowed");
        }
        let r = rl.consume("caller");
        assert!(!r.allowed);
        assert!(r.ms_until_reset > 0);
    }

    #[test]
    fn test_buckets_are_per_caller() {
        let rl = limiter(1, 60_000, 1);
        assert!(rl.consume("a").allowed);
        assert!(!rl.consume("a").allowed);
        assert!(rl.consume("b").allowed);
    }

    #[test]
    fn test_lazy_refill_restores_tokens() {
        let rl = limiter(2, 10, 2);
        assert!(rl.consume("c").allowed);
        assert!(rl.consume("c").allowed);
        assert!(!rl.consume("c").allowed);
        std::thread::sleep(Duration::from_millis(25));
        let r = rl.consume("c");
        assert!(r.allowed);
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let rl = limiter(3, 10, 100);
        assert!(rl.consume("c").allowed);
        std::thread::sleep(Duration::from_millis(25));
        let r = rl.consume("c");
        assert!(r.allowed);
        // Refilled to capacity, one token just spent.
        assert_eq!(r.remaining, 2);
    }

    #[test]
    fn test_cleanup_evicts_idle_buckets() {
        let rl = limiter(1, 1, 1);
        rl.consume("old");
        std::thread::sleep(Duration::from_millis(30));
        rl.cleanup();
        assert!(rl.buckets.lock().is_empty());
    }
}
