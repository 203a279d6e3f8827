//! Bounded event-id deduplication.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// When an event id was first admitted, i.e. delivered downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupRecord {
    pub event_id: String,
    pub first_seen_at: Instant,
}

#[derive(Debug, Default)]
struct DedupState {
    /// Event id to first-seen time
    seen: HashMap<String, Instant>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

/// Remembers the last `capacity` event ids admitted.
///
/// Eviction is by first sight, not by last access: a duplicate arriving late
/// does not refresh its entry. Once an id is evicted the next copy of that
/// event is admitted again.
#[derive(Debug)]
pub struct EventDeduplicator {
    capacity: usize,
    state: Mutex<DedupState>,
}

impl EventDeduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(DedupState {
                seen: HashMap::with_capacity(capacity.min(65_536)),
                order: VecDeque::with_capacity(capacity.min(65_536)),
            }),
        }
    }

    /// Returns true the first time `event_id` is seen, false afterwards.
    ///
    /// The check and the insert happen under one lock, so two links racing
    /// with the same id cannot both be admitted.
    pub fn admit(&self, event_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.seen.contains_key(event_id) {
            return false;
        }

        while state.order.len() >= self.capacity {
            match state.order.pop_front() {
                Some(oldest) => {
                    state.seen.remove(&oldest);
                }
                None => break,
            }
        }
        state.seen.insert(event_id.to_string(), Instant::now());
        state.order.push_back(event_id.to_string());
        true
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.state.lock().seen.contains_key(event_id)
    }

    pub fn record(&self, event_id: &str) -> Option<DedupRecord> {
        self.state
            .lock()
            .seen
            .get(event_id)
            .map(|first_seen_at| DedupRecord {
                event_id: event_id.to_string(),
                first_seen_at: *first_seen_at,
            })
    }

    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_admits_once() {
        let dedup = EventDeduplicator::new(10);
        assert!(dedup.admit("a"));
        assert!(!dedup.admit("a"));
        assert!(!dedup.admit("a"));
        assert!(dedup.admit("b"));

        assert_eq!(dedup.len(), 2);
        assert_eq!(dedup.record("a").map(|record| record.event_id), Some("a".to_string()));
        assert!(dedup.record("zzz").is_none());
    }

    #[test]
    fn test_evicts_oldest_first_seen() {
        let dedup = EventDeduplicator::new(3);
        for id in ["a", "b", "c"] {
            assert!(dedup.admit(id));
        }

        // Seeing "a" again does not refresh it
        assert!(!dedup.admit("a"));
        assert!(dedup.admit("d"));

        assert!(!dedup.contains("a"));
        assert!(dedup.contains("b"));
        assert!(dedup.contains("d"));
        assert_eq!(dedup.len(), 3);

        // Evicted ids come back as new
        assert!(dedup.admit("a"));
        assert!(!dedup.contains("b"));
    }

    #[test]
    fn test_zero_capacity_still_dedups_latest() {
        let dedup = EventDeduplicator::new(0);
        assert_eq!(dedup.capacity(), 1);
        assert!(dedup.admit("a"));
        assert!(!dedup.admit("a"));
        assert!(dedup.admit("b"));
        assert!(dedup.admit("a"));
    }

    #[test]
    fn test_concurrent_admission_single_winner() {
        let dedup = Arc::new(EventDeduplicator::new(1_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dedup = dedup.clone();
                std::thread::spawn(move || {
                    (0..200)
                        .filter(|i| dedup.admit(&format!("event-{}", i)))
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 200);
        assert_eq!(dedup.len(), 200);
    }
}
