//! Engine metrics collection
//!
//! Tracks counters across the whole pipeline:
//! - Frames and events received from relays
//! - Filter rejections and dedup hits
//! - Rate limiting and backpressure drops
//! - Handler responses and timeouts
//! - Publish outcomes and reconnects

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Engine metrics collector
#[derive(Debug)]
pub struct EngineMetrics {
    start_time: Instant,

    /// Text frames read from any relay
    pub frames_received: AtomicU64,

    /// Frames that failed to parse
    pub protocol_errors: AtomicU64,

    /// EVENT messages received from any relay
    pub events_received: AtomicU64,

    /// Events a relay delivered that did not match the subscription filter
    pub filter_rejections: AtomicU64,

    /// Events already seen from another relay
    pub dedup_hits: AtomicU64,

    /// Events seen for the first time
    pub dedup_misses: AtomicU64,

    /// Events dropped by a per-relay inbound bucket
    pub rate_limited: AtomicU64,

    /// Events held back by the global inbound bucket
    pub queued: AtomicU64,

    /// Queued events dropped because the queue overflowed
    pub backpressure_drops: AtomicU64,

    /// Events handed to a consumer
    pub delivered: AtomicU64,

    /// Handler invocations that produced a response
    pub handler_responses: AtomicU64,

    /// Handler invocations that ran out of time
    pub handler_timeouts: AtomicU64,

    /// Per-relay publishes acknowledged
    pub publish_acked: AtomicU64,

    /// Per-relay publishes given up
    pub publish_given_up: AtomicU64,

    /// Publish attempts beyond the first
    pub publish_retries: AtomicU64,

    /// Sessions lost after having been connected
    pub reconnects: AtomicU64,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            frames_received: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            filter_rejections: AtomicU64::new(0),
            dedup_hits: AtomicU64::new(0),
            dedup_misses: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            backpressure_drops: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            handler_responses: AtomicU64::new(0),
            handler_timeouts: AtomicU64::new(0),
            publish_acked: AtomicU64::new(0),
            publish_given_up: AtomicU64::new(0),
            publish_retries: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Add one to `counter`.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Share of received events that were duplicates, in `[0, 1]`.
    pub fn dedup_hit_rate(&self) -> f64 {
        let hits = self.dedup_hits.load(Ordering::Relaxed);
        let misses = self.dedup_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            uptime_secs: self.uptime().as_secs(),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            filter_rejections: self.filter_rejections.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            dedup_misses: self.dedup_misses.load(Ordering::Relaxed),
            dedup_hit_rate: self.dedup_hit_rate(),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            backpressure_drops: self.backpressure_drops.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            handler_responses: self.handler_responses.load(Ordering::Relaxed),
            handler_timeouts: self.handler_timeouts.load(Ordering::Relaxed),
            publish_acked: self.publish_acked.load(Ordering::Relaxed),
            publish_given_up: self.publish_given_up.load(Ordering::Relaxed),
            publish_retries: self.publish_retries.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_secs: u64,
    pub frames_received: u64,
    pub protocol_errors: u64,
    pub events_received: u64,
    pub filter_rejections: u64,
    pub dedup_hits: u64,
    pub dedup_misses: u64,
    pub dedup_hit_rate: f64,
    pub rate_limited: u64,
    pub queued: u64,
    pub backpressure_drops: u64,
    pub delivered: u64,
    pub handler_responses: u64,
    pub handler_timeouts: u64,
    pub publish_acked: u64,
    pub publish_given_up: u64,
    pub publish_retries: u64,
    pub reconnects: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = EngineMetrics::new();
        EngineMetrics::incr(&metrics.events_received);
        EngineMetrics::incr(&metrics.events_received);
        EngineMetrics::incr(&metrics.publish_acked);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_received, 2);
        assert_eq!(snapshot.publish_acked, 1);
        assert_eq!(snapshot.delivered, 0);
    }

    #[test]
    fn test_dedup_hit_rate() {
        let metrics = EngineMetrics::new();
        assert_eq!(metrics.dedup_hit_rate(), 0.0);

        EngineMetrics::incr(&metrics.dedup_misses);
        EngineMetrics::incr(&metrics.dedup_misses);
        EngineMetrics::incr(&metrics.dedup_misses);
        EngineMetrics::incr(&metrics.dedup_hits);
        assert!((metrics.dedup_hit_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(EngineMetrics::new().snapshot()).unwrap();
        assert_eq!(json["reconnects"], 0);
        assert!(json.get("dedup_hit_rate").is_some());
    }
}
