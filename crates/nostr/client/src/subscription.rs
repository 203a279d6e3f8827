//! Subscription management across relay links.
//!
//! The [`SubscriptionRouter`] owns every logical subscription: it issues the
//! REQs on the target links, re-validates whatever relays deliver against the
//! subscription filters, and tracks EOSE per relay.

use crate::dedup::EventDeduplicator;
use crate::error::{ClientError, Result};
use crate::filter::{Filter, matches_any};
use crate::relay::RelayLink;
use nostr::Event;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// A logical subscription as seen by consumers and handlers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
    /// Relays the subscription was opened on
    pub relays: BTreeSet<String>,
}

impl Subscription {
    pub fn matches(&self, event: &Event) -> bool {
        matches_any(&self.filters, event)
    }

    pub fn targets(&self, relay_url: &str) -> bool {
        self.relays.contains(relay_url)
    }
}

/// One admitted event on its way to a consumer.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub subscription: Arc<Subscription>,
    /// Relay the event was first admitted from
    pub relay_url: String,
    pub event: Event,
}

/// Where a subscription's events go.
#[derive(Debug, Clone)]
pub(crate) enum DeliverySink {
    /// The engine-wide inbound stream
    Shared,
    /// A stream owned by this subscription alone
    Dedicated(mpsc::Sender<InboundEvent>),
}

/// Tracks which relays have a specific subscription and which sent EOSE.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionTracker {
    /// Relays that have this subscription
    pub relays: HashSet<String>,
    /// Relays that have sent EOSE
    pub eose_relays: HashSet<String>,
    /// Whether EOSE has been received from all relays
    pub all_eose: bool,
}

impl SubscriptionTracker {
    pub fn new<I: IntoIterator<Item = String>>(relays: I) -> Self {
        Self {
            relays: relays.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Mark EOSE received from a relay. Returns true when this completed the set.
    pub fn mark_eose(&mut self, relay_url: &str) -> bool {
        if !self.relays.contains(relay_url) {
            return false;
        }
        self.eose_relays.insert(relay_url.to_string());
        let was_complete = self.all_eose;
        self.update_all_eose();
        self.all_eose && !was_complete
    }

    /// Remove a relay, e.g. after it closed the subscription.
    pub fn remove_relay(&mut self, relay_url: &str) {
        self.relays.remove(relay_url);
        self.eose_relays.remove(relay_url);
        self.update_all_eose();
    }

    fn update_all_eose(&mut self) {
        self.all_eose = !self.relays.is_empty() && self.relays.len() == self.eose_relays.len();
    }
}

/// Router-side state of one subscription.
#[derive(Debug)]
pub(crate) struct SubscriptionEntry {
    pub(crate) subscription: Arc<Subscription>,
    /// Ids this subscription has already delivered
    pub(crate) dedup: EventDeduplicator,
    pub(crate) sink: DeliverySink,
    /// Cancelled by [`SubscriptionRouter::close`] and by engine shutdown
    pub(crate) closed: CancellationToken,
    tracker: Mutex<SubscriptionTracker>,
}

/// Maps subscriptions to relay links and relay deliveries back to subscriptions.
///
/// Subscriptions are independent: two subscriptions with overlapping filters
/// on one relay each send their own REQ and each receive matching events once.
#[derive(Debug)]
pub struct SubscriptionRouter {
    links: Arc<BTreeMap<String, Arc<RelayLink>>>,
    entries: RwLock<HashMap<String, Arc<SubscriptionEntry>>>,
    per_subscription_capacity: usize,
    shutdown: CancellationToken,
}

impl SubscriptionRouter {
    /// Every subscription's close signal is a child of `shutdown`.
    pub fn new(
        links: Arc<BTreeMap<String, Arc<RelayLink>>>,
        per_subscription_capacity: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            links,
            entries: RwLock::new(HashMap::new()),
            per_subscription_capacity,
            shutdown,
        }
    }

    /// Resolve a target set; empty means every link.
    fn resolve_relays(&self, relays: &[String]) -> Result<BTreeSet<String>> {
        if relays.is_empty() {
            return Ok(self.links.keys().cloned().collect());
        }
        relays
            .iter()
            .map(|relay| {
                if self.links.contains_key(relay) {
                    Ok(relay.clone())
                } else {
                    Err(ClientError::UnknownRelay(relay.clone()))
                }
            })
            .collect()
    }

    /// Register a subscription and send its REQ to every target link.
    ///
    /// Returns the subscription and the token cancelled when it closes.
    pub(crate) async fn open(
        &self,
        filters: Vec<Filter>,
        relays: &[String],
        sink: DeliverySink,
    ) -> Result<(Arc<Subscription>, CancellationToken)> {
        let relays = self.resolve_relays(relays)?;
        let subscription = Arc::new(Subscription {
            id: generate_subscription_id(),
            filters,
            relays,
        });

        let closed = self.shutdown.child_token();
        let entry = Arc::new(SubscriptionEntry {
            subscription: subscription.clone(),
            dedup: EventDeduplicator::new(self.per_subscription_capacity),
            sink,
            closed: closed.clone(),
            tracker: Mutex::new(SubscriptionTracker::new(subscription.relays.iter().cloned())),
        });
        self.entries
            .write()
            .insert(subscription.id.clone(), entry);

        for relay in &subscription.relays {
            if let Some(link) = self.links.get(relay)
                && let Err(e) = link
                    .subscribe(&subscription.id, subscription.filters.clone())
                    .await
            {
                warn!(relay = %relay, subscription = %subscription.id, "Failed to subscribe: {}", e);
            }
        }

        info!(
            subscription = %subscription.id,
            relays = subscription.relays.len(),
            "Opened subscription"
        );
        Ok((subscription, closed))
    }

    /// Unregister a subscription and send CLOSE to its relays (best effort).
    pub async fn close(&self, subscription_id: &str) -> Result<()> {
        let entry = self
            .entries
            .write()
            .remove(subscription_id)
            .ok_or_else(|| ClientError::UnknownSubscription(subscription_id.to_string()))?;
        entry.closed.cancel();

        for relay in &entry.subscription.relays {
            if let Some(link) = self.links.get(relay)
                && let Err(e) = link.unsubscribe(subscription_id).await
            {
                debug!(relay = %relay, subscription = subscription_id, "Failed to send CLOSE: {}", e);
            }
        }

        debug!(subscription = subscription_id, "Closed subscription");
        Ok(())
    }

    /// Close every subscription.
    pub async fn close_all(&self) {
        for id in self.ids() {
            let _ = self.close(&id).await;
        }
    }

    /// Subscriptions an event from `relay_url` (delivered under
    /// `subscription_id`) actually matches.
    ///
    /// The subscription named by the relay is checked first, then every other
    /// subscription targeting the same relay. Returns the matches and whether
    /// the named subscription rejected the event on its filters.
    pub(crate) fn route(
        &self,
        relay_url: &str,
        subscription_id: &str,
        event: &Event,
    ) -> (Vec<Arc<SubscriptionEntry>>, bool) {
        let entries = self.entries.read();
        let mut matched = Vec::new();
        let mut rejected = false;

        if let Some(entry) = entries.get(subscription_id)
            && entry.subscription.targets(relay_url)
        {
            if entry.subscription.matches(event) {
                matched.push(entry.clone());
            } else {
                rejected = true;
            }
        }

        for (id, entry) in entries.iter() {
            if id != subscription_id
                && entry.subscription.targets(relay_url)
                && entry.subscription.matches(event)
            {
                matched.push(entry.clone());
            }
        }

        (matched, rejected)
    }

    /// Record EOSE from `relay_url`. Returns true once every target relay of
    /// the subscription has sent it.
    pub fn mark_eose(&self, relay_url: &str, subscription_id: &str) -> bool {
        let entries = self.entries.read();
        let Some(entry) = entries.get(subscription_id) else {
            return false;
        };
        let completed = entry.tracker.lock().mark_eose(relay_url);
        if completed {
            info!(subscription = subscription_id, "All relays sent EOSE");
        }
        completed
    }

    /// The relay closed the subscription on its side.
    pub fn mark_closed(&self, relay_url: &str, subscription_id: &str) {
        if let Some(entry) = self.entries.read().get(subscription_id) {
            entry.tracker.lock().remove_relay(relay_url);
        }
    }

    pub fn eose_complete(&self, subscription_id: &str) -> bool {
        self.entries
            .read()
            .get(subscription_id)
            .is_some_and(|entry| entry.tracker.lock().all_eose)
    }

    pub fn get(&self, subscription_id: &str) -> Option<Arc<Subscription>> {
        self.entries
            .read()
            .get(subscription_id)
            .map(|entry| entry.subscription.clone())
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Events of one subscription opened with its own stream.
///
/// Ends when the subscription is closed or the engine shuts down, even if
/// events for it are still waiting on the rate limiter.
#[derive(Debug)]
pub struct SubscriptionStream {
    subscription: Arc<Subscription>,
    rx: mpsc::Receiver<InboundEvent>,
    closed: CancellationToken,
}

impl SubscriptionStream {
    pub(crate) fn new(
        subscription: Arc<Subscription>,
        rx: mpsc::Receiver<InboundEvent>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            subscription,
            rx,
            closed,
        }
    }

    pub fn subscription(&self) -> &Arc<Subscription> {
        &self.subscription
    }

    pub fn id(&self) -> &str {
        &self.subscription.id
    }

    /// Next event, or `None` once the subscription is over.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        if self.closed.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = self.closed.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }
}
