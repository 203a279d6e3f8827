//! Token-bucket admission control for inbound events and outbound publishes.
//!
//! Two tiers:
//! 1. Per-relay: one bucket per (relay, direction)
//! 2. Global: one process-wide bucket for inbound processing
//!
//! Both checks are non-blocking. A denied inbound event is the caller's to
//! queue ([`BackpressureQueue`]) or drop.

use crate::config::{BucketConfig, RateLimitConfig};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;

/// Token bucket state for rate limiting.
///
/// Tokens are replenished continuously up to the burst capacity.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Current number of available tokens.
    tokens: f64,
    /// Maximum tokens (burst capacity).
    capacity: f64,
    /// Tokens added per second.
    rate_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    /// Create a bucket refilling `rate_per_hour` tokens per hour, holding at
    /// most `burst`. Starts full.
    pub fn new(rate_per_hour: u32, burst: u32) -> Self {
        let capacity = f64::from(burst);
        Self {
            tokens: capacity,
            capacity,
            rate_per_sec: f64::from(rate_per_hour) / 3600.0,
            last_update: Instant::now(),
        }
    }

    pub fn from_config(config: &BucketConfig) -> Self {
        Self::new(config.rate_per_hour, config.burst)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_update = now;
    }

    /// Try to consume one token. Returns true if allowed, false if rate limited.
    pub fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

}

/// Direction of traffic a bucket gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Why an admission was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    /// Per-relay bucket for this direction is empty.
    PerRelay(Direction),
    /// The process-wide inbound bucket is empty.
    Global,
}

impl fmt::Display for RateLimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitReason::PerRelay(Direction::Inbound) => write!(f, "per-relay inbound limit"),
            RateLimitReason::PerRelay(Direction::Outbound) => {
                write!(f, "per-relay outbound limit")
            }
            RateLimitReason::Global => write!(f, "global inbound limit"),
        }
    }
}

/// Per-relay and global token-bucket controller.
///
/// Per-relay buckets live in a sharded map so relays never contend with each
/// other; only the global bucket is a single lock.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    per_relay: DashMap<(String, Direction), TokenBucket>,
    global: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let global = TokenBucket::from_config(&config.global_inbound);
        Self {
            config,
            per_relay: DashMap::new(),
            global: Mutex::new(global),
        }
    }

    fn bucket_config(&self, direction: Direction) -> &BucketConfig {
        match direction {
            Direction::Inbound => &self.config.inbound_per_relay,
            Direction::Outbound => &self.config.outbound_per_relay,
        }
    }

    fn try_consume_relay(&self, relay: &str, direction: Direction) -> bool {
        let bucket_config = self.bucket_config(direction);
        self.per_relay
            .entry((relay.to_string(), direction))
            .or_insert_with(|| TokenBucket::from_config(bucket_config))
            .try_consume()
    }

    /// Check an inbound event from `relay` against both tiers.
    ///
    /// The relay bucket is charged first; the global bucket is only charged
    /// when the relay bucket allowed the event, so a noisy relay cannot drain
    /// the shared budget with events it was never entitled to.
    pub fn check_inbound(&self, relay: &str) -> Result<(), RateLimitReason> {
        if !self.try_consume_relay(relay, Direction::Inbound) {
            return Err(RateLimitReason::PerRelay(Direction::Inbound));
        }
        if !self.global.lock().try_consume() {
            return Err(RateLimitReason::Global);
        }
        Ok(())
    }

    /// Charge only the relay's inbound bucket. Events admitted this way still
    /// owe a global token, paid when they leave the queue.
    pub fn try_admit_relay_inbound(&self, relay: &str) -> bool {
        self.try_consume_relay(relay, Direction::Inbound)
    }

    /// Consume one global inbound token, used when draining the queue of
    /// events that already passed their relay bucket.
    pub fn try_admit_global(&self) -> bool {
        self.global.lock().try_consume()
    }

    pub fn try_admit_outbound(&self, relay: &str) -> bool {
        self.try_consume_relay(relay, Direction::Outbound)
    }
}

/// Bounded FIFO holding inbound items that the global bucket could not admit.
///
/// Overflow drops the oldest item and raises the shared backpressure flag,
/// which relay links observe to slow their reads. The flag is lowered once
/// the queue drains to half its depth.
#[derive(Debug)]
pub struct BackpressureQueue<T> {
    items: VecDeque<T>,
    depth: usize,
    signal: Arc<AtomicBool>,
}

impl<T> BackpressureQueue<T> {
    pub fn new(depth: usize, signal: Arc<AtomicBool>) -> Self {
        Self {
            items: VecDeque::with_capacity(depth),
            depth,
            signal,
        }
    }

    /// Enqueue `item`, returning the oldest item if it had to be dropped.
    pub fn push(&mut self, item: T) -> Option<T> {
        let dropped = if self.items.len() >= self.depth {
            self.signal.store(true, Ordering::Release);
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        dropped
    }

    pub fn pop(&mut self) -> Option<T> {
        let item = self.items.pop_front();
        if self.items.len() <= self.depth / 2 {
            self.signal.store(false, Ordering::Release);
        }
        item
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.signal.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(per_relay: (u32, u32), global: (u32, u32)) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            inbound_per_relay: BucketConfig {
                rate_per_hour: per_relay.0,
                burst: per_relay.1,
            },
            outbound_per_relay: BucketConfig {
                rate_per_hour: per_relay.0,
                burst: per_relay.1,
            },
            global_inbound: BucketConfig {
                rate_per_hour: global.0,
                burst: global.1,
            },
            ..RateLimitConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_allows_burst() {
        let mut bucket = TokenBucket::new(3600, 3);

        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_replenishes() {
        // One token per second
        let mut bucket = TokenBucket::new(3600, 1);
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_exceeds_capacity() {
        let mut bucket = TokenBucket::new(3600, 2);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_relay_independent() {
        let limiter = limiter((100, 2), (1000, 1000));

        assert!(limiter.check_inbound("wss://a").is_ok());
        assert!(limiter.check_inbound("wss://a").is_ok());
        assert_eq!(
            limiter.check_inbound("wss://a"),
            Err(RateLimitReason::PerRelay(Direction::Inbound))
        );
        assert!(limiter.check_inbound("wss://b").is_ok());

        // Outbound budget is separate from inbound
        assert!(limiter.try_admit_outbound("wss://a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_limit() {
        let limiter = limiter((100, 10), (100, 2));

        assert!(limiter.check_inbound("wss://a").is_ok());
        assert!(limiter.check_inbound("wss://b").is_ok());
        assert_eq!(limiter.check_inbound("wss://c"), Err(RateLimitReason::Global));
        assert!(!limiter.try_admit_global());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_only_admission_leaves_global_untouched() {
        let limiter = limiter((100, 2), (100, 1));

        assert!(limiter.try_admit_relay_inbound("wss://a"));
        assert!(limiter.try_admit_relay_inbound("wss://a"));
        assert!(!limiter.try_admit_relay_inbound("wss://a"));

        // The global token is still there for the queue to spend
        assert!(limiter.try_admit_global());
        assert!(!limiter.try_admit_global());
    }

    #[test]
    fn test_backpressure_queue_drops_oldest() {
        let signal = Arc::new(AtomicBool::new(false));
        let mut queue = BackpressureQueue::new(4, signal.clone());

        for i in 1..=4 {
            assert_eq!(queue.push(i), None);
        }
        assert!(!signal.load(Ordering::Acquire));

        assert_eq!(queue.push(5), Some(1));
        assert!(signal.load(Ordering::Acquire));
        assert_eq!(queue.len(), 4);

        assert_eq!(queue.pop(), Some(2));
        assert!(signal.load(Ordering::Acquire));
        assert_eq!(queue.pop(), Some(3));
        assert!(!signal.load(Ordering::Acquire));
        assert_eq!(queue.pop(), Some(4));
        assert_eq!(queue.pop(), Some(5));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(RateLimitReason::Global.to_string(), "global inbound limit");
        assert_eq!(
            RateLimitReason::PerRelay(Direction::Outbound).to_string(),
            "per-relay outbound limit"
        );
    }
}
