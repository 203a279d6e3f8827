//! Outbound publishing with per-relay retry.
//!
//! A publish fans one event out to a set of relay links. Every relay gets its
//! own [`PublishAttempt`] and its own retry schedule, so a dead relay never
//! holds back the others. The call returns once every attempt is terminal or
//! the publish timeout elapses; partial success is a normal outcome.

use crate::backoff::Backoff;
use crate::config::PublishConfig;
use crate::error::ClientError;
use crate::metrics::EngineMetrics;
use crate::rate_limit::{Direction, RateLimitReason, RateLimiter};
use crate::relay::RelayLink;
use dashmap::DashMap;
use futures::future::join_all;
use nostr::Event;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Relay `OK` prefix meaning the relay already has the event.
const DUPLICATE_PREFIX: &str = "duplicate:";

/// Status of one (event, relay) publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishStatus {
    /// Waiting for its next attempt
    Pending,
    /// Frame flushed, waiting for the relay's answer
    Sent,
    /// Terminal: the relay accepted it, or did not say otherwise
    Acked,
    /// Last attempt failed, a retry is scheduled
    Failed,
    /// Terminal: attempts exhausted, timed out or shut down
    GivenUp,
}

impl PublishStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PublishStatus::Acked | PublishStatus::GivenUp)
    }
}

/// In-flight state of one (event, relay) publish.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishAttempt {
    pub event_id: String,
    pub relay: String,
    pub attempts: u32,
    pub status: PublishStatus,
    pub next_retry_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl PublishAttempt {
    fn new(event_id: &str, relay: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            relay: relay.to_string(),
            attempts: 0,
            status: PublishStatus::Pending,
            next_retry_at: None,
            last_error: None,
        }
    }
}

/// Terminal result for one relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayOutcome {
    pub status: PublishStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Result of publishing one event to a set of relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    pub event_id: String,
    pub outcomes: BTreeMap<String, RelayOutcome>,
}

impl PublishResult {
    /// Relays that acknowledged the event.
    pub fn acked(&self) -> Vec<&str> {
        self.with_status(PublishStatus::Acked)
    }

    /// Relays the publish was given up on.
    pub fn given_up(&self) -> Vec<&str> {
        self.with_status(PublishStatus::GivenUp)
    }

    fn with_status(&self, status: PublishStatus) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.status == status)
            .map(|(relay, _)| relay.as_str())
            .collect()
    }

    pub fn status(&self, relay: &str) -> Option<PublishStatus> {
        self.outcomes.get(relay).map(|outcome| outcome.status)
    }

    pub fn is_complete_success(&self) -> bool {
        !self.outcomes.is_empty()
            && self
                .outcomes
                .values()
                .all(|outcome| outcome.status == PublishStatus::Acked)
    }

    /// At least one relay acked and at least one did not.
    pub fn is_partial(&self) -> bool {
        let acked = self.acked().len();
        acked > 0 && acked < self.outcomes.len()
    }

    /// One [`ClientError::PublishGivenUp`] per failed relay.
    pub fn errors(&self) -> Vec<ClientError> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.status == PublishStatus::GivenUp)
            .map(|(relay, outcome)| ClientError::PublishGivenUp {
                event_id: self.event_id.clone(),
                relay: relay.clone(),
                attempts: outcome.attempts,
                last_error: outcome.last_error.clone().unwrap_or_default(),
            })
            .collect()
    }
}

/// Fans events out to relay links and retries each relay independently.
#[derive(Debug)]
pub struct PublishCoordinator {
    config: PublishConfig,
    limiter: Arc<RateLimiter>,
    metrics: Arc<EngineMetrics>,
    /// Keyed by publish call and relay; the same event may be in flight twice.
    in_flight: DashMap<(u64, String), PublishAttempt>,
    next_call: AtomicU64,
    cancel: CancellationToken,
}

impl PublishCoordinator {
    pub fn new(
        config: PublishConfig,
        limiter: Arc<RateLimiter>,
        metrics: Arc<EngineMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            limiter,
            metrics,
            in_flight: DashMap::new(),
            next_call: AtomicU64::new(0),
            cancel,
        }
    }

    /// Publish `event` to every link in `targets`.
    ///
    /// Never fails as a whole: each relay's terminal status is reported in
    /// the result.
    pub async fn publish(&self, event: &Event, targets: &[Arc<RelayLink>]) -> PublishResult {
        let call = self.next_call.fetch_add(1, Ordering::Relaxed);
        let keys: Vec<(u64, String)> = targets
            .iter()
            .map(|link| (call, link.url().to_string()))
            .collect();
        for key in &keys {
            self.in_flight
                .insert(key.clone(), PublishAttempt::new(&event.id, &key.1));
        }

        let attempts = join_all(targets.iter().map(|link| self.publish_to(call, event, link)));
        let cut_short = tokio::select! {
            _ = attempts => None,
            _ = sleep(self.config.timeout()) => Some("publish timed out"),
            _ = self.cancel.cancelled() => Some("shutting down"),
        };

        let mut outcomes = BTreeMap::new();
        for key in keys {
            let Some((_, mut attempt)) = self.in_flight.remove(&key) else {
                continue;
            };
            if !attempt.status.is_terminal() {
                attempt.status = PublishStatus::GivenUp;
                attempt.last_error = cut_short.map(str::to_string).or(attempt.last_error);
                EngineMetrics::incr(&self.metrics.publish_given_up);
            }
            outcomes.insert(
                key.1,
                RelayOutcome {
                    status: attempt.status,
                    attempts: attempt.attempts,
                    last_error: attempt.last_error,
                },
            );
        }

        let result = PublishResult {
            event_id: event.id.clone(),
            outcomes,
        };
        info!(
            event_id = %event.id,
            acked = result.acked().len(),
            given_up = result.given_up().len(),
            "Publish finished"
        );
        result
    }

    /// Attempts still running.
    pub fn in_flight(&self) -> Vec<PublishAttempt> {
        self.in_flight.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    async fn publish_to(&self, call: u64, event: &Event, link: &RelayLink) {
        let key = (call, link.url().to_string());
        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff =
            Backoff::new(self.config.retry_base(), self.config.retry_max())
                .jitter(self.config.jitter);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.update(&key, |a| {
                a.attempts = attempt;
                a.status = PublishStatus::Pending;
                a.next_retry_at = None;
            });
            if attempt > 1 {
                EngineMetrics::incr(&self.metrics.publish_retries);
            }

            let error = match self.attempt_once(event, link, &key).await {
                Ok(()) => {
                    self.update(&key, |a| a.status = PublishStatus::Acked);
                    EngineMetrics::incr(&self.metrics.publish_acked);
                    debug!(relay = %link.url(), event_id = %event.id, attempt, "Publish acked");
                    return;
                }
                Err(error) => error,
            };

            if attempt >= max_attempts {
                self.update(&key, |a| {
                    a.status = PublishStatus::GivenUp;
                    a.last_error = Some(error.clone());
                });
                EngineMetrics::incr(&self.metrics.publish_given_up);
                warn!(
                    relay = %link.url(),
                    event_id = %event.id,
                    attempts = attempt,
                    "Giving up on publish: {}", error
                );
                return;
            }

            let delay = backoff.next_delay();
            self.update(&key, |a| {
                a.status = PublishStatus::Failed;
                a.last_error = Some(error.clone());
                a.next_retry_at = Some(Instant::now() + delay);
            });
            debug!(
                relay = %link.url(),
                event_id = %event.id,
                attempt,
                "Publish failed, retrying in {:?}: {}", delay, error
            );
            sleep(delay).await;
        }
    }

    /// One attempt. `Ok` means acknowledged (explicitly or by silence).
    async fn attempt_once(
        &self,
        event: &Event,
        link: &RelayLink,
        key: &(u64, String),
    ) -> Result<(), String> {
        if !self.limiter.try_admit_outbound(link.url()) {
            let denied = ClientError::RateLimited(RateLimitReason::PerRelay(Direction::Outbound));
            return Err(denied.to_string());
        }

        let rx = link.send_tracked(event).await.map_err(|e| e.to_string())?;
        self.update(key, |a| a.status = PublishStatus::Sent);

        match link
            .await_confirmation(&event.id, rx, self.config.ack_wait())
            .await
        {
            None => Ok(()),
            Some(confirmation) if confirmation.accepted => Ok(()),
            Some(confirmation) if confirmation.message.starts_with(DUPLICATE_PREFIX) => Ok(()),
            Some(confirmation) => Err(format!("rejected: {}", confirmation.message)),
        }
    }

    fn update(&self, key: &(u64, String), f: impl FnOnce(&mut PublishAttempt)) {
        if let Some(mut attempt) = self.in_flight.get_mut(key) {
            f(&mut attempt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RateLimitConfig, RelayConfig};
    use crate::mock::MockTransport;
    use crate::relay::{LinkContext, LinkEvents, link_channel};
    use std::time::Duration;

    fn event(id: &str) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "pk".to_string(),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![],
            content: "hello".to_string(),
            sig: "sig".to_string(),
        }
    }

    fn publish_config() -> PublishConfig {
        PublishConfig {
            timeout_ms: 10_000,
            max_attempts: 3,
            retry_base_ms: 20,
            retry_max_ms: 100,
            jitter: false,
            ack_wait_ms: 200,
        }
    }

    fn coordinator(config: PublishConfig, limits: RateLimitConfig) -> PublishCoordinator {
        PublishCoordinator::new(
            config,
            Arc::new(RateLimiter::new(limits)),
            Arc::new(EngineMetrics::new()),
            CancellationToken::new(),
        )
    }

    async fn link(transport: &MockTransport, url: &str) -> (Arc<RelayLink>, LinkEvents) {
        let (tx, events) = link_channel(16);
        let config = RelayConfig {
            reconnect_base_ms: 10,
            reconnect_max_ms: 20,
            jitter: false,
            ..RelayConfig::default()
        };
        let link = RelayLink::new(
            url,
            config,
            Arc::new(transport.clone()),
            tx,
            LinkContext::default(),
        )
        .unwrap();
        let _ = link.connect().await;
        (Arc::new(link), events)
    }

    #[test]
    fn test_result_helpers() {
        let outcome = |status| RelayOutcome {
            status,
            attempts: 1,
            last_error: None,
        };
        let mut result = PublishResult {
            event_id: "e".to_string(),
            outcomes: BTreeMap::new(),
        };
        assert!(!result.is_complete_success());

        result
            .outcomes
            .insert("wss://a".to_string(), outcome(PublishStatus::Acked));
        assert!(result.is_complete_success());
        assert!(!result.is_partial());

        result
            .outcomes
            .insert("wss://b".to_string(), outcome(PublishStatus::GivenUp));
        assert!(result.is_partial());
        assert_eq!(result.acked(), vec!["wss://a"]);
        assert_eq!(result.given_up(), vec!["wss://b"]);
        assert!(matches!(
            result.errors().as_slice(),
            [ClientError::PublishGivenUp { relay, .. }] if relay == "wss://b"
        ));
    }

    #[tokio::test]
    async fn test_publish_acked_on_ok() {
        let transport = MockTransport::new();
        let (a, _events) = link(&transport, "wss://a.test").await;
        let coordinator = coordinator(publish_config(), RateLimitConfig::unlimited());

        let result = coordinator.publish(&event("e1"), &[a]).await;
        assert!(result.is_complete_success());
        assert_eq!(result.outcomes["wss://a.test"].attempts, 1);
        assert_eq!(transport.relay("wss://a.test").published_ids(), vec!["e1"]);
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_same_event_published_concurrently() {
        let transport = MockTransport::new();
        let (a, _events) = link(&transport, "wss://a.test").await;
        let coordinator = coordinator(publish_config(), RateLimitConfig::unlimited());

        let note = event("e1");
        let links_first = [a.clone()];
        let links_second = [a.clone()];
        let (first, second) = tokio::join!(
            coordinator.publish(&note, &links_first),
            coordinator.publish(&note, &links_second),
        );
        for result in [first, second] {
            assert_eq!(result.outcomes.len(), 1);
            assert_eq!(
                result.status("wss://a.test"),
                Some(PublishStatus::Acked)
            );
        }
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_silence_counts_as_ack() {
        let transport = MockTransport::new();
        transport.relay("wss://quiet.test").set_auto_ok(false);
        let (quiet, _events) = link(&transport, "wss://quiet.test").await;
        let coordinator = coordinator(publish_config(), RateLimitConfig::unlimited());

        let result = coordinator.publish(&event("e1"), &[quiet]).await;
        assert_eq!(result.status("wss://quiet.test"), Some(PublishStatus::Acked));
    }

    #[tokio::test]
    async fn test_rejection_retried_and_duplicate_accepted() {
        let transport = MockTransport::new();
        transport
            .relay("wss://picky.test")
            .reject_next_events(1, "blocked: try later");
        transport
            .relay("wss://dup.test")
            .reject_next_events(5, "duplicate: already have it");
        let (picky, _e1) = link(&transport, "wss://picky.test").await;
        let (dup, _e2) = link(&transport, "wss://dup.test").await;
        let coordinator = coordinator(publish_config(), RateLimitConfig::unlimited());

        let result = coordinator.publish(&event("e1"), &[picky, dup]).await;
        assert!(result.is_complete_success());
        assert_eq!(result.outcomes["wss://picky.test"].attempts, 2);
        assert_eq!(result.outcomes["wss://dup.test"].attempts, 1);
    }

    #[tokio::test]
    async fn test_dead_relay_given_up_others_unaffected() {
        let transport = MockTransport::new();
        transport.relay("wss://dead.test").set_refuse_connections(true);
        let (ok, _e1) = link(&transport, "wss://ok.test").await;
        let (dead, _e2) = link(&transport, "wss://dead.test").await;
        let coordinator = coordinator(publish_config(), RateLimitConfig::unlimited());

        let result = coordinator.publish(&event("e1"), &[ok, dead]).await;
        assert!(result.is_partial());
        assert_eq!(result.status("wss://ok.test"), Some(PublishStatus::Acked));

        let dead = &result.outcomes["wss://dead.test"];
        assert_eq!(dead.status, PublishStatus::GivenUp);
        assert_eq!(dead.attempts, 3);
        assert!(dead.last_error.as_deref().unwrap().contains("Not connected"));
    }

    #[tokio::test]
    async fn test_outbound_rate_limit_counts_as_failed_attempt() {
        let transport = MockTransport::new();
        let (a, _events) = link(&transport, "wss://a.test").await;
        let mut limits = RateLimitConfig::unlimited();
        limits.outbound_per_relay.rate_per_hour = 1;
        limits.outbound_per_relay.burst = 1;
        let coordinator = coordinator(publish_config(), limits);

        assert!(coordinator.publish(&event("e1"), &[a.clone()]).await.is_complete_success());

        let result = coordinator.publish(&event("e2"), &[a]).await;
        let outcome = &result.outcomes["wss://a.test"];
        assert_eq!(outcome.status, PublishStatus::GivenUp);
        assert!(outcome.last_error.as_deref().unwrap().contains("outbound"));
    }

    #[tokio::test]
    async fn test_timeout_reports_given_up() {
        let transport = MockTransport::new();
        transport.relay("wss://dead.test").set_refuse_connections(true);
        let (dead, _events) = link(&transport, "wss://dead.test").await;
        let config = PublishConfig {
            timeout_ms: 50,
            max_attempts: 100,
            ..publish_config()
        };
        let coordinator = coordinator(config, RateLimitConfig::unlimited());

        let started = std::time::Instant::now();
        let result = coordinator.publish(&event("e1"), &[dead]).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        let outcome = &result.outcomes["wss://dead.test"];
        assert_eq!(outcome.status, PublishStatus::GivenUp);
        assert_eq!(outcome.last_error.as_deref(), Some("publish timed out"));
        assert_eq!(coordinator.in_flight_count(), 0);
    }
}
