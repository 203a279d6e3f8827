//! The dispatch engine.
//!
//! Owns every relay link and the shared pipeline state:
//!
//! ```text
//! RelayLink --> worker shard --> route --> admission + dedup --> inbound / subscription stream
//!                                                                  |
//!                                handler --> publish --> PublishCoordinator --> RelayLink
//! ```
//!
//! Each link always feeds the same worker and there is a single admission
//! stage, so events from one relay reach consumers in the order that relay
//! sent them. An event id is only recorded as seen once it is actually
//! handed to a consumer; a copy dropped by a rate limit does not stop a later
//! copy from another relay.
//!
//! Dedup runs at two levels. Each subscription's deduplicator decides
//! delivery. The engine-wide one records every id delivered to anyone and
//! backs the dedup figures in [`EngineSnapshot`].

use crate::config::EngineConfig;
use crate::dedup::EventDeduplicator;
use crate::error::{ClientError, Result};
use crate::filter::Filter;
use crate::handler::EventHandler;
use crate::message::RelayMessage;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::publish::{PublishCoordinator, PublishResult};
use crate::rate_limit::{BackpressureQueue, Direction, RateLimitReason, RateLimiter};
use crate::relay::{
    LinkContext, LinkEvents, LinkMessage, LinkStateChange, RelayEndpoint, RelayLink, link_channel,
};
use crate::subscription::{
    DeliverySink, InboundEvent, Subscription, SubscriptionEntry, SubscriptionRouter,
    SubscriptionStream,
};
use crate::transport::Transport;
use futures::future::join_all;
use nostr::Event;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STATE_CHANGE_CAPACITY: usize = 256;

/// Read-only view of the engine for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub relays: Vec<RelayEndpoint>,
    pub outbound_queue_depths: BTreeMap<String, usize>,
    /// Events held back by the global inbound limit
    pub admission_queue_depth: usize,
    pub backpressure: bool,
    pub subscriptions: usize,
    pub dedup_entries: usize,
    pub dedup_hit_rate: f64,
    pub publishes_in_flight: usize,
    pub metrics: MetricsSnapshot,
}

/// The merged stream of events for subscriptions opened with
/// [`DispatchEngine::subscribe`]. Ends when the engine shuts down.
#[derive(Debug)]
pub struct InboundStream {
    rx: mpsc::Receiver<InboundEvent>,
    shutdown: CancellationToken,
}

impl InboundStream {
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }
}

/// Multi-relay ingestion, dedup and dispatch engine.
pub struct DispatchEngine {
    config: EngineConfig,
    context: LinkContext,
    links: Arc<BTreeMap<String, Arc<RelayLink>>>,
    router: Arc<SubscriptionRouter>,
    dedup: Arc<EventDeduplicator>,
    limiter: Arc<RateLimiter>,
    publisher: Arc<PublishCoordinator>,
    ignore_authors: HashSet<String>,
    admission_depth: Arc<AtomicUsize>,
    inbound_tx: mpsc::Sender<InboundEvent>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundEvent>>>,
    shards: Mutex<Vec<LinkEvents>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopping: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("relays", &self.links.keys().collect::<Vec<_>>())
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("stopping", &self.stopping.load(Ordering::Relaxed))
            .finish()
    }
}

impl DispatchEngine {
    /// Validate `config` and build every relay link. Nothing connects until
    /// [`start`](Self::start).
    pub fn new(config: EngineConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(EngineMetrics::new());
        let (state_changes, _) = broadcast::channel(STATE_CHANGE_CAPACITY);
        let context = LinkContext {
            state_changes,
            backpressure: Arc::new(AtomicBool::new(false)),
            metrics: metrics.clone(),
        };

        let workers = config.dispatch.workers.max(1);
        let capacity = config.dispatch.channel_capacity.max(1);
        let (senders, shards): (Vec<_>, Vec<_>) =
            (0..workers).map(|_| link_channel(capacity)).unzip();
        let shutdown = CancellationToken::new();

        let mut links = BTreeMap::new();
        for url in &config.relays {
            let link = RelayLink::new(
                url,
                config.relay.clone(),
                transport.clone(),
                senders[shard_for(url, workers)].clone(),
                context.clone(),
            )?;
            links.insert(url.clone(), Arc::new(link));
        }
        let links = Arc::new(links);

        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let publisher = Arc::new(PublishCoordinator::new(
            config.publish.clone(),
            limiter.clone(),
            metrics,
            shutdown.clone(),
        ));
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);

        Ok(Self {
            router: Arc::new(SubscriptionRouter::new(
                links.clone(),
                config.dedup.per_subscription_capacity,
                shutdown.clone(),
            )),
            dedup: Arc::new(EventDeduplicator::new(config.dedup.capacity)),
            ignore_authors: config.dispatch.ignore_authors.iter().cloned().collect(),
            links,
            limiter,
            publisher,
            context,
            admission_depth: Arc::new(AtomicUsize::new(0)),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            shards: Mutex::new(shards),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            shutdown,
            config,
        })
    }

    /// Spawn the workers and the admission stage, then connect every relay.
    ///
    /// Relays that fail their first attempt keep retrying in the background;
    /// only a stopped engine is an error.
    pub async fn start(&self) -> Result<()> {
        if self.is_stopping() {
            return Err(ClientError::Shutdown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let capacity = self.config.dispatch.channel_capacity.max(1);
        let (admission_tx, admission_rx) = mpsc::channel(capacity);
        let shards = std::mem::take(&mut *self.shards.lock());

        let mut tasks = Vec::with_capacity(shards.len() + 1);
        for events in shards {
            let worker = DispatchWorker {
                router: self.router.clone(),
                dedup: self.dedup.clone(),
                metrics: self.context.metrics.clone(),
                admission: admission_tx.clone(),
                verify_ids: self.config.dispatch.verify_ids,
                shutdown: self.shutdown.clone(),
            };
            tasks.push(tokio::spawn(worker.run(events)));
        }

        let stage = AdmissionStage {
            limiter: self.limiter.clone(),
            dedup: self.dedup.clone(),
            metrics: self.context.metrics.clone(),
            inbound: self.inbound_tx.clone(),
            queue: BackpressureQueue::new(
                self.config.rate_limit.queue_depth,
                self.context.backpressure.clone(),
            ),
            depth: self.admission_depth.clone(),
            drain_interval: self.config.rate_limit.drain_interval(),
            shutdown: self.shutdown.clone(),
        };
        tasks.push(tokio::spawn(stage.run(admission_rx)));
        self.tasks.lock().extend(tasks);

        let results = join_all(self.links.values().map(|link| async move {
            (link.url().to_string(), link.connect().await)
        }))
        .await;

        let mut connected = 0;
        for (url, result) in results {
            match result {
                Ok(()) => connected += 1,
                Err(e) => warn!(relay = %url, "Initial connection failed, retrying: {}", e),
            }
        }
        info!(connected, total = self.links.len(), "Dispatch engine started");
        Ok(())
    }

    /// Open a subscription whose events go to the shared [`InboundStream`].
    ///
    /// An empty `relays` targets every configured relay.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        relays: &[String],
    ) -> Result<Arc<Subscription>> {
        if self.is_stopping() {
            return Err(ClientError::Shutdown);
        }
        let (subscription, _) = self.router.open(filters, relays, DeliverySink::Shared).await?;
        Ok(subscription)
    }

    /// Open a subscription with a stream of its own.
    pub async fn subscribe_stream(
        &self,
        filters: Vec<Filter>,
        relays: &[String],
    ) -> Result<SubscriptionStream> {
        if self.is_stopping() {
            return Err(ClientError::Shutdown);
        }
        let (tx, rx) = mpsc::channel(self.config.dispatch.channel_capacity.max(1));
        let (subscription, closed) = self
            .router
            .open(filters, relays, DeliverySink::Dedicated(tx))
            .await?;
        Ok(SubscriptionStream::new(subscription, rx, closed))
    }

    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.router.close(subscription_id).await
    }

    /// Take the shared inbound stream. There is only one.
    pub fn inbound(&self) -> Result<InboundStream> {
        let rx = self
            .inbound_rx
            .lock()
            .take()
            .ok_or(ClientError::InboundTaken)?;
        Ok(InboundStream {
            rx,
            shutdown: self.shutdown.clone(),
        })
    }

    /// Publish `event` to `targets` (every relay when empty).
    pub async fn publish(&self, event: &Event, targets: &[String]) -> Result<PublishResult> {
        if self.is_stopping() {
            return Err(ClientError::Shutdown);
        }
        let links = self.resolve_links(targets)?;
        Ok(self.publisher.publish(event, &links).await)
    }

    fn resolve_links(&self, targets: &[String]) -> Result<Vec<Arc<RelayLink>>> {
        if targets.is_empty() {
            return Ok(self.links.values().cloned().collect());
        }
        let mut seen = BTreeSet::new();
        targets
            .iter()
            .filter(|target| seen.insert(target.as_str()))
            .map(|target| {
                self.links
                    .get(target)
                    .cloned()
                    .ok_or_else(|| ClientError::UnknownRelay(target.clone()))
            })
            .collect()
    }

    /// Feed the inbound stream to `handler` until shutdown.
    ///
    /// Responses are published to the relay the request came from plus every
    /// relay of its subscription.
    pub fn run_handler(self: &Arc<Self>, handler: Arc<dyn EventHandler>) -> Result<()> {
        let mut inbound = self.inbound()?;
        let engine = Arc::clone(self);

        let task = tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(
                engine.config.dispatch.handler_concurrency.max(1),
            ));
            let mut running = JoinSet::new();

            while let Some(item) = inbound.recv().await {
                if engine.ignore_authors.contains(&item.event.pubkey) {
                    debug!(event_id = %item.event.id, "Skipping event from ignored author");
                    continue;
                }

                let permit = tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let engine = engine.clone();
                let handler = handler.clone();
                running.spawn(async move {
                    engine.handle_one(handler.as_ref(), item).await;
                    drop(permit);
                });
                while running.try_join_next().is_some() {}
            }

            running.shutdown().await;
            debug!("Handler loop stopped");
        });

        self.tasks.lock().push(task);
        Ok(())
    }

    async fn handle_one(&self, handler: &dyn EventHandler, item: InboundEvent) {
        let InboundEvent {
            subscription,
            relay_url,
            event,
        } = item;
        let budget = self.config.dispatch.handler_timeout();

        let response = match timeout(budget, handler.handle(&event, &subscription)).await {
            Ok(response) => response,
            Err(_) => {
                EngineMetrics::incr(&self.context.metrics.handler_timeouts);
                warn!(
                    event_id = %event.id,
                    subscription = %subscription.id,
                    "{}", ClientError::HandlerTimeout(budget)
                );
                return;
            }
        };
        let Some(response) = response else {
            return;
        };
        EngineMetrics::incr(&self.context.metrics.handler_responses);

        let mut targets = subscription.relays.clone();
        targets.insert(relay_url);
        let targets: Vec<String> = targets.into_iter().collect();

        match self.publish(&response, &targets).await {
            Ok(result) if !result.is_complete_success() => warn!(
                event_id = %response.id,
                given_up = ?result.given_up(),
                "Response not published to every relay"
            ),
            Ok(_) => {}
            Err(e) => warn!(event_id = %response.id, "Failed to publish response: {}", e),
        }
    }

    /// State of every configured relay.
    pub fn health(&self) -> Vec<RelayEndpoint> {
        self.links.values().map(|link| link.endpoint()).collect()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            relays: self.health(),
            outbound_queue_depths: self
                .links
                .iter()
                .map(|(url, link)| (url.clone(), link.outbound_depth()))
                .collect(),
            admission_queue_depth: self.admission_depth.load(Ordering::Relaxed),
            backpressure: self.context.backpressure.load(Ordering::Relaxed),
            subscriptions: self.router.len(),
            dedup_entries: self.dedup.len(),
            dedup_hit_rate: self.context.metrics.dedup_hit_rate(),
            publishes_in_flight: self.publisher.in_flight_count(),
            metrics: self.context.metrics.snapshot(),
        }
    }

    pub fn state_changes(&self) -> broadcast::Receiver<LinkStateChange> {
        self.context.state_changes.subscribe()
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.context.metrics
    }

    pub fn relay_urls(&self) -> Vec<String> {
        self.links.keys().cloned().collect()
    }

    pub fn subscription(&self, subscription_id: &str) -> Option<Arc<Subscription>> {
        self.router.get(subscription_id)
    }

    /// Whether every relay of the subscription has sent EOSE.
    pub fn eose_complete(&self, subscription_id: &str) -> bool {
        self.router.eose_complete(subscription_id)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst) || self.shutdown.is_cancelled()
    }

    /// Ordered teardown: close subscriptions, let in-flight publishes finish
    /// until the grace deadline, then close every link. Links that hang are
    /// aborted. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down dispatch engine");
        let deadline = Instant::now() + self.config.shutdown.grace();

        if timeout(remaining(deadline), self.router.close_all())
            .await
            .is_err()
        {
            warn!("Timed out closing subscriptions");
        }

        let check = self.config.dispatch.cancellation_check();
        while self.publisher.in_flight_count() > 0 && Instant::now() < deadline {
            sleep(check.min(remaining(deadline))).await;
        }
        let abandoned = self.publisher.in_flight_count();
        if abandoned > 0 {
            warn!(abandoned, "Grace period over, giving up in-flight publishes");
        }

        self.shutdown.cancel();

        let close_deadline = self
            .config
            .shutdown
            .link_close_timeout()
            .min(remaining(deadline));
        join_all(self.links.values().map(|link| link.close(close_deadline))).await;

        for task in std::mem::take(&mut *self.tasks.lock()) {
            task.abort();
        }
        self.context.backpressure.store(false, Ordering::Relaxed);
        info!("Dispatch engine stopped");
    }
}

impl Drop for DispatchEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Worker a relay's frames always land on.
fn shard_for(relay_url: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    relay_url.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

async fn send_or_cancel<T>(tx: &mpsc::Sender<T>, item: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        result = tx.send(item) => result.is_ok(),
    }
}

/// A routed event waiting for rate-limit admission.
#[derive(Debug)]
struct Admission {
    relay_url: String,
    event: Event,
    targets: Vec<Arc<SubscriptionEntry>>,
}

/// Routes and deduplicates the frames of the links in its shard.
struct DispatchWorker {
    router: Arc<SubscriptionRouter>,
    dedup: Arc<EventDeduplicator>,
    metrics: Arc<EngineMetrics>,
    admission: mpsc::Sender<Admission>,
    verify_ids: bool,
    shutdown: CancellationToken,
}

impl DispatchWorker {
    async fn run(self, mut events: LinkEvents) {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = events.recv() => message,
            };
            let Some(LinkMessage { relay_url, message }) = message else {
                break;
            };

            match message {
                RelayMessage::Event {
                    subscription_id,
                    event,
                } => self.handle_event(relay_url, &subscription_id, event).await,
                RelayMessage::Eose { subscription_id } => {
                    self.router.mark_eose(&relay_url, &subscription_id);
                }
                RelayMessage::Closed {
                    subscription_id,
                    message,
                } => {
                    warn!(relay = %relay_url, subscription = %subscription_id, "Relay closed subscription: {}", message);
                    self.router.mark_closed(&relay_url, &subscription_id);
                }
                _ => {}
            }
        }
        debug!("Dispatch worker stopped");
    }

    async fn handle_event(&self, relay_url: String, subscription_id: &str, event: Event) {
        EngineMetrics::incr(&self.metrics.events_received);

        if self.verify_ids
            && let Err(e) = event.verify_id()
        {
            EngineMetrics::incr(&self.metrics.protocol_errors);
            warn!(relay = %relay_url, "Dropping event: {}", e);
            return;
        }

        let (mut targets, rejected) = self.router.route(&relay_url, subscription_id, &event);
        if rejected {
            EngineMetrics::incr(&self.metrics.filter_rejections);
            debug!(
                relay = %relay_url,
                subscription = subscription_id,
                event_id = %event.id,
                "Relay delivered an event outside the subscription filter"
            );
        }
        if targets.is_empty() {
            return;
        }

        // Already delivered everywhere it matches; the admission stage
        // repeats the check atomically for copies still in flight
        targets.retain(|entry| !entry.dedup.contains(&event.id));
        if targets.is_empty() {
            EngineMetrics::incr(&self.metrics.dedup_hits);
            if let Some(record) = self.dedup.record(&event.id) {
                debug!(
                    relay = %relay_url,
                    event_id = %event.id,
                    age = ?record.first_seen_at.elapsed(),
                    "Duplicate event"
                );
            }
            return;
        }

        let admission = Admission {
            relay_url,
            event,
            targets,
        };
        send_or_cancel(&self.admission, admission, &self.shutdown).await;
    }
}

/// Applies the inbound rate limits and hands admitted events to consumers.
struct AdmissionStage {
    limiter: Arc<RateLimiter>,
    dedup: Arc<EventDeduplicator>,
    metrics: Arc<EngineMetrics>,
    inbound: mpsc::Sender<InboundEvent>,
    queue: BackpressureQueue<Admission>,
    depth: Arc<AtomicUsize>,
    drain_interval: Duration,
    shutdown: CancellationToken,
}

impl AdmissionStage {
    async fn run(mut self, mut rx: mpsc::Receiver<Admission>) {
        let mut drain = tokio::time::interval(self.drain_interval);
        drain.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = drain.tick() => self.drain().await,
                admission = rx.recv() => match admission {
                    Some(admission) => self.admit(admission).await,
                    None => break,
                },
            }
        }

        self.queue.clear();
        self.depth.store(0, Ordering::Relaxed);
        debug!("Admission stage stopped");
    }

    async fn admit(&mut self, admission: Admission) {
        // Queued events go first, so newcomers from the same relay wait
        // behind them and pay their global token on the way out
        let verdict = if self.queue.is_empty() {
            self.limiter.check_inbound(&admission.relay_url)
        } else if self.limiter.try_admit_relay_inbound(&admission.relay_url) {
            Err(RateLimitReason::Global)
        } else {
            Err(RateLimitReason::PerRelay(Direction::Inbound))
        };

        match verdict {
            Ok(()) => self.deliver(admission).await,
            Err(RateLimitReason::Global) => self.enqueue(admission),
            Err(reason) => {
                EngineMetrics::incr(&self.metrics.rate_limited);
                debug!(
                    relay = %admission.relay_url,
                    event_id = %admission.event.id,
                    "Dropping event: {}", ClientError::RateLimited(reason)
                );
            }
        }
    }

    fn enqueue(&mut self, admission: Admission) {
        EngineMetrics::incr(&self.metrics.queued);
        if let Some(dropped) = self.queue.push(admission) {
            EngineMetrics::incr(&self.metrics.backpressure_drops);
            warn!(
                relay = %dropped.relay_url,
                event_id = %dropped.event.id,
                "Admission queue full, dropped oldest event"
            );
        }
        self.depth.store(self.queue.len(), Ordering::Relaxed);
    }

    async fn drain(&mut self) {
        while !self.queue.is_empty() && self.limiter.try_admit_global() {
            match self.queue.pop() {
                Some(admission) => self.deliver(admission).await,
                None => break,
            }
        }
        self.depth.store(self.queue.len(), Ordering::Relaxed);
    }

    async fn deliver(&self, admission: Admission) {
        let Admission {
            relay_url,
            event,
            targets,
        } = admission;

        let mut fresh = false;
        for entry in targets {
            // Closed while the event was waiting, or another relay's copy won
            if entry.closed.is_cancelled() || !entry.dedup.admit(&event.id) {
                continue;
            }
            fresh = true;
            let item = InboundEvent {
                subscription: entry.subscription.clone(),
                relay_url: relay_url.clone(),
                event: event.clone(),
            };
            let delivered = match &entry.sink {
                DeliverySink::Shared => send_or_cancel(&self.inbound, item, &self.shutdown).await,
                DeliverySink::Dedicated(tx) => send_or_cancel(tx, item, &entry.closed).await,
            };
            if delivered {
                EngineMetrics::incr(&self.metrics.delivered);
            }
        }

        if fresh {
            self.dedup.admit(&event.id);
            EngineMetrics::incr(&self.metrics.dedup_misses);
        } else {
            EngineMetrics::incr(&self.metrics.dedup_hits);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::mock::MockTransport;

    fn engine(relays: &[&str]) -> DispatchEngine {
        let config = EngineConfig::default().with_relays(relays.iter().copied());
        DispatchEngine::new(config, Arc::new(MockTransport::new())).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = EngineConfig::default().with_relays(Vec::<String>::new());
        let err = DispatchEngine::new(config, Arc::new(MockTransport::new())).unwrap_err();
        assert!(matches!(err, ClientError::Config(ConfigError::NoRelays)));
    }

    #[test]
    fn test_shard_is_stable() {
        let shard = shard_for("wss://a.test", 4);
        assert!(shard < 4);
        assert_eq!(shard, shard_for("wss://a.test", 4));
        assert_eq!(shard_for("wss://a.test", 1), 0);
    }

    #[tokio::test]
    async fn test_inbound_taken_once() {
        let engine = engine(&["wss://a.test"]);
        assert!(engine.inbound().is_ok());
        assert!(matches!(engine.inbound(), Err(ClientError::InboundTaken)));
    }

    #[tokio::test]
    async fn test_publish_to_unknown_relay() {
        let engine = engine(&["wss://a.test"]);
        engine.start().await.unwrap();

        let event = Event {
            id: "e".to_string(),
            pubkey: "pk".to_string(),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "sig".to_string(),
        };
        let err = engine
            .publish(&event, &["wss://b.test".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::UnknownRelay(url) if url == "wss://b.test"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_and_snapshot() {
        let engine = engine(&["wss://a.test", "wss://b.test"]);
        assert!(
            engine
                .health()
                .iter()
                .all(|endpoint| endpoint.state == crate::relay::LinkState::Disconnected)
        );

        engine.start().await.unwrap();
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.relays.len(), 2);
        assert!(
            snapshot
                .relays
                .iter()
                .all(|endpoint| endpoint.state == crate::relay::LinkState::Connected)
        );
        assert_eq!(snapshot.admission_queue_depth, 0);
        assert!(serde_json::to_string(&snapshot).is_ok());

        engine.shutdown().await;
        assert!(engine.start().await.is_err());
        assert!(matches!(
            engine.subscribe(vec![], &[]).await,
            Err(ClientError::Shutdown)
        ));
    }
}
