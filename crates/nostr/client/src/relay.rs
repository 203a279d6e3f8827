//! Connection to a single relay.
//!
//! A [`RelayLink`] owns one relay endpoint for its whole life: it connects,
//! reconnects with backoff, replays subscriptions on every new session and
//! forwards what the relay sends into a [`LinkEvents`] channel shared with the
//! rest of the engine. Its state is published read-only as a
//! [`RelayEndpoint`] snapshot.

use crate::backoff::Backoff;
use crate::config::{RelayConfig, validate_relay_url};
use crate::error::{ClientError, Result};
use crate::filter::Filter;
use crate::message::{ClientMessage, MessageError, RelayMessage};
use crate::metrics::EngineMetrics;
use crate::transport::{FrameChannel, FrameSink, FrameStream, Transport};
use futures::{SinkExt, StreamExt};
use nostr::Event;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Connection state of a relay link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before the next connection attempt
    Backoff,
}

/// Read-only view of a relay link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayEndpoint {
    pub url: String,
    pub state: LinkState,
    pub last_error: Option<String>,
    /// Consecutive failed connection attempts
    pub reconnect_attempt: u32,
    /// Subscription ids the link keeps open on the relay
    pub subscriptions: BTreeSet<String>,
}

/// Notification emitted on every state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkStateChange {
    pub relay_url: String,
    pub previous: LinkState,
    pub current: LinkState,
    pub error: Option<String>,
}

/// Relay answer to a published event (NIP-01 `OK`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirmation {
    pub relay_url: String,
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
}

/// A message from one relay, tagged with where it came from.
#[derive(Debug, Clone)]
pub struct LinkMessage {
    pub relay_url: String,
    pub message: RelayMessage,
}

/// Receiving end of the channel links forward relay messages into.
#[derive(Debug)]
pub struct LinkEvents {
    rx: mpsc::Receiver<LinkMessage>,
}

/// Create the channel relay links deliver into.
pub fn link_channel(capacity: usize) -> (mpsc::Sender<LinkMessage>, LinkEvents) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, LinkEvents { rx })
}

impl LinkEvents {
    /// Next message from any link. Survives reconnects; ends only once every
    /// link has been dropped.
    pub async fn recv(&mut self) -> Option<LinkMessage> {
        self.rx.recv().await
    }
}

/// Shared engine plumbing a link reports into.
#[derive(Debug, Clone)]
pub struct LinkContext {
    pub state_changes: broadcast::Sender<LinkStateChange>,
    /// Raised by the engine while its admission queue overflows
    pub backpressure: Arc<AtomicBool>,
    pub metrics: Arc<EngineMetrics>,
}

impl Default for LinkContext {
    fn default() -> Self {
        let (state_changes, _) = broadcast::channel(64);
        Self {
            state_changes,
            backpressure: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(EngineMetrics::new()),
        }
    }
}

enum Outbound {
    /// REQ and CLOSE frames; dropped on disconnect and replayed from state
    Control(String),
    /// EVENT frame whose sender waits for the flush
    Publish {
        frame: String,
        flushed: oneshot::Sender<Result<()>>,
    },
}

#[derive(Default)]
struct SessionShared {
    subscriptions: BTreeMap<String, Vec<Filter>>,
    connected: bool,
}

struct LinkInner {
    url: String,
    parsed_url: Url,
    config: RelayConfig,
    transport: Arc<dyn Transport>,
    context: LinkContext,
    deliver: mpsc::Sender<LinkMessage>,
    endpoint: watch::Sender<RelayEndpoint>,
    shared: Mutex<SessionShared>,
    outbound: mpsc::Sender<Outbound>,
    outbound_rx: tokio::sync::Mutex<mpsc::Receiver<Outbound>>,
    pending: Mutex<HashMap<String, oneshot::Sender<PublishConfirmation>>>,
    session_error: Mutex<Option<String>>,
    cancel: CancellationToken,
}

/// Connection to one relay with automatic reconnection.
pub struct RelayLink {
    inner: Arc<LinkInner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    writer: Arc<Mutex<Option<AbortHandle>>>,
}

impl std::fmt::Debug for RelayLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayLink")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish()
    }
}

impl RelayLink {
    /// Create a link to `url`. Nothing happens on the network until
    /// [`connect`](Self::connect).
    pub fn new(
        url: &str,
        config: RelayConfig,
        transport: Arc<dyn Transport>,
        deliver: mpsc::Sender<LinkMessage>,
        context: LinkContext,
    ) -> Result<Self> {
        let parsed_url =
            validate_relay_url(url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
        let (endpoint, _) = watch::channel(RelayEndpoint {
            url: url.to_string(),
            state: LinkState::Disconnected,
            last_error: None,
            reconnect_attempt: 0,
            subscriptions: BTreeSet::new(),
        });

        Ok(Self {
            inner: Arc::new(LinkInner {
                url: url.to_string(),
                parsed_url,
                config,
                transport,
                context,
                deliver,
                endpoint,
                shared: Mutex::new(SessionShared::default()),
                outbound,
                outbound_rx: tokio::sync::Mutex::new(outbound_rx),
                pending: Mutex::new(HashMap::new()),
                session_error: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
            supervisor: Mutex::new(None),
            writer: Arc::new(Mutex::new(None)),
        })
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Start the link and wait for the outcome of the first connection attempt.
    ///
    /// On failure the link keeps retrying in the background; the error only
    /// reports the first attempt. Calling this on a running link reports the
    /// current state without starting anything.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(ClientError::Shutdown);
        }

        let mut endpoint_rx = self.inner.endpoint.subscribe();
        {
            let mut supervisor = self.supervisor.lock();
            if supervisor.is_some() {
                let endpoint = endpoint_rx.borrow().clone();
                return match endpoint.state {
                    LinkState::Connected => Ok(()),
                    _ => Err(ClientError::connection(
                        &self.inner.url,
                        endpoint.last_error.unwrap_or_else(|| "not connected".to_string()),
                    )),
                };
            }
            *supervisor = Some(tokio::spawn(supervise(
                self.inner.clone(),
                self.writer.clone(),
            )));
        }

        let endpoint = tokio::select! {
            _ = self.inner.cancel.cancelled() => return Err(ClientError::Shutdown),
            outcome = endpoint_rx.wait_for(|endpoint| {
                endpoint.state == LinkState::Connected
                    || (endpoint.state == LinkState::Backoff && endpoint.reconnect_attempt > 0)
            }) => match outcome {
                Ok(endpoint) => endpoint.clone(),
                Err(_) => return Err(ClientError::Shutdown),
            },
        };

        if endpoint.state == LinkState::Connected {
            Ok(())
        } else {
            Err(ClientError::connection(
                &self.inner.url,
                endpoint.last_error.unwrap_or_else(|| "connection failed".to_string()),
            ))
        }
    }

    /// Request a filtered stream from the relay under `subscription_id`.
    ///
    /// The subscription is remembered and re-issued after every reconnect
    /// until [`unsubscribe`](Self::unsubscribe).
    pub async fn subscribe(&self, subscription_id: &str, filters: Vec<Filter>) -> Result<()> {
        let frame = ClientMessage::Req {
            subscription_id: subscription_id.to_string(),
            filters: filters.clone(),
        }
        .to_json()
        .map_err(|source| self.protocol_error(source))?;

        let connected = {
            let mut shared = self.inner.shared.lock();
            shared
                .subscriptions
                .insert(subscription_id.to_string(), filters);
            shared.connected
        };
        self.inner.endpoint.send_modify(|endpoint| {
            endpoint.subscriptions.insert(subscription_id.to_string());
        });

        if connected {
            self.enqueue(Outbound::Control(frame)).await?;
        }
        debug!(relay = %self.inner.url, subscription = subscription_id, connected, "Subscribed");
        Ok(())
    }

    /// Forget a subscription and ask the relay to close it (best effort).
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let (known, connected) = {
            let mut shared = self.inner.shared.lock();
            let known = shared.subscriptions.remove(subscription_id).is_some();
            (known, shared.connected)
        };
        self.inner.endpoint.send_modify(|endpoint| {
            endpoint.subscriptions.remove(subscription_id);
        });

        if known && connected {
            let frame = ClientMessage::Close {
                subscription_id: subscription_id.to_string(),
            }
            .to_json()
            .map_err(|source| self.protocol_error(source))?;
            self.enqueue(Outbound::Control(frame)).await?;
        }
        Ok(())
    }

    /// Subscription ids this link replays on reconnect.
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.inner.shared.lock().subscriptions.keys().cloned().collect()
    }

    /// Transmit `event`. Returns once the frame is flushed, not once the relay
    /// acknowledged it.
    pub async fn send(&self, event: &Event) -> Result<()> {
        if self.state() != LinkState::Connected {
            return Err(ClientError::NotConnected(self.inner.url.clone()));
        }

        let frame = ClientMessage::Event(event.clone())
            .to_json()
            .map_err(|source| self.protocol_error(source))?;
        let (flushed, done) = oneshot::channel();
        self.enqueue(Outbound::Publish { frame, flushed }).await?;

        done.await
            .unwrap_or_else(|_| Err(ClientError::NotConnected(self.inner.url.clone())))
    }

    /// Transmit `event` and wait up to `wait` for the relay's `OK`.
    ///
    /// `Ok(None)` means the frame was flushed but no answer arrived in time.
    pub async fn send_confirmed(
        &self,
        event: &Event,
        wait: Duration,
    ) -> Result<Option<PublishConfirmation>> {
        let rx = self.send_tracked(event).await?;
        Ok(self.await_confirmation(&event.id, rx, wait).await)
    }

    /// Transmit `event` and hand back the receiver its `OK` will arrive on.
    pub(crate) async fn send_tracked(
        &self,
        event: &Event,
    ) -> Result<oneshot::Receiver<PublishConfirmation>> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(event.id.clone(), tx);

        if let Err(e) = self.send(event).await {
            self.inner.pending.lock().remove(&event.id);
            return Err(e);
        }
        Ok(rx)
    }

    pub(crate) async fn await_confirmation(
        &self,
        event_id: &str,
        rx: oneshot::Receiver<PublishConfirmation>,
        wait: Duration,
    ) -> Option<PublishConfirmation> {
        match timeout(wait, rx).await {
            Ok(Ok(confirmation)) => Some(confirmation),
            _ => {
                self.inner.pending.lock().remove(event_id);
                None
            }
        }
    }

    pub fn state(&self) -> LinkState {
        self.inner.endpoint.borrow().state
    }

    pub fn endpoint(&self) -> RelayEndpoint {
        self.inner.endpoint.borrow().clone()
    }

    /// Watch the endpoint snapshot.
    pub fn watch(&self) -> watch::Receiver<RelayEndpoint> {
        self.inner.endpoint.subscribe()
    }

    /// Frames waiting in the outbound queue.
    pub fn outbound_depth(&self) -> usize {
        self.inner.outbound.max_capacity() - self.inner.outbound.capacity()
    }

    /// Close the link, waiting at most `deadline` for it to wind down before
    /// aborting its tasks. Idempotent.
    pub async fn close(&self, deadline: Duration) {
        self.inner.cancel.cancel();

        let supervisor = self.supervisor.lock().take();
        if let Some(mut handle) = supervisor
            && timeout(deadline, &mut handle).await.is_err()
        {
            warn!(relay = %self.inner.url, "Relay link did not close in time, aborting");
            handle.abort();
        }
        if let Some(writer) = self.writer.lock().take() {
            writer.abort();
        }

        self.inner.shared.lock().connected = false;
        self.inner.fail_pending();
        self.inner.set_state(LinkState::Disconnected, None);
    }

    async fn enqueue(&self, item: Outbound) -> Result<()> {
        self.inner
            .outbound
            .send(item)
            .await
            .map_err(|_| ClientError::NotConnected(self.inner.url.clone()))
    }

    fn protocol_error(&self, source: MessageError) -> ClientError {
        ClientError::Protocol {
            relay: self.inner.url.clone(),
            source,
        }
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl LinkInner {
    fn set_state(&self, state: LinkState, error: Option<String>) {
        let mut previous = state;
        self.endpoint.send_if_modified(|endpoint| {
            previous = endpoint.state;
            let changed =
                endpoint.state != state || (error.is_some() && endpoint.last_error != error);
            endpoint.state = state;
            if error.is_some() {
                endpoint.last_error = error.clone();
            }
            changed
        });

        if previous != state {
            let _ = self.context.state_changes.send(LinkStateChange {
                relay_url: self.url.clone(),
                previous,
                current: state,
                error,
            });
        }
    }

    fn set_attempt(&self, attempt: u32) {
        self.endpoint.send_modify(|endpoint| endpoint.reconnect_attempt = attempt);
    }

    /// Drop every confirmation waiter; their publishes see `None`.
    fn fail_pending(&self) {
        self.pending.lock().clear();
    }

    fn resolve_confirmation(&self, event_id: &str, accepted: bool, message: &str) {
        if let Some(waiter) = self.pending.lock().remove(event_id) {
            let _ = waiter.send(PublishConfirmation {
                relay_url: self.url.clone(),
                event_id: event_id.to_string(),
                accepted,
                message: message.to_string(),
            });
        }
    }
}

/// Connect, run sessions, and reconnect with backoff until cancelled.
async fn supervise(inner: Arc<LinkInner>, writer_slot: Arc<Mutex<Option<AbortHandle>>>) {
    let config = &inner.config;
    let mut backoff =
        Backoff::new(config.reconnect_base(), config.reconnect_max()).jitter(config.jitter);
    let mut failures: u32 = 0;

    loop {
        inner.set_state(LinkState::Connecting, None);
        info!(relay = %inner.url, "Connecting to relay");

        let attempt = timeout(
            config.connect_timeout(),
            inner.transport.connect(&inner.parsed_url),
        );
        let outcome = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            outcome = attempt => outcome,
        };

        let error = match outcome {
            Ok(Ok(channel)) => {
                failures = 0;
                backoff.reset();
                inner.set_attempt(0);

                let reason = run_session(&inner, channel, &writer_slot).await;
                if inner.cancel.is_cancelled() {
                    break;
                }
                EngineMetrics::incr(&inner.context.metrics.reconnects);
                warn!(relay = %inner.url, reason = %reason, "Relay connection lost");
                reason
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("connection timeout after {:?}", config.connect_timeout()),
        };

        failures = failures.saturating_add(1);
        let long_poll =
            config.max_reconnect_attempts > 0 && failures > config.max_reconnect_attempts;
        let delay = if long_poll {
            config.long_poll_interval()
        } else {
            backoff.next_delay()
        };

        inner.set_attempt(failures);
        inner.set_state(LinkState::Backoff, Some(error.clone()));
        debug!(
            relay = %inner.url,
            attempt = failures,
            ?delay,
            long_poll,
            error = %error,
            "Scheduling reconnect"
        );

        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }

    inner.set_state(LinkState::Disconnected, None);
    debug!(relay = %inner.url, "Relay link supervisor stopped");
}

/// Run one connected session. Returns why it ended.
async fn run_session(
    inner: &Arc<LinkInner>,
    channel: FrameChannel,
    writer_slot: &Arc<Mutex<Option<AbortHandle>>>,
) -> String {
    let FrameChannel {
        mut sink,
        mut stream,
    } = channel;

    let replay: Vec<String> = {
        let mut shared = inner.shared.lock();
        shared.connected = true;
        shared
            .subscriptions
            .iter()
            .filter_map(|(id, filters)| {
                ClientMessage::Req {
                    subscription_id: id.clone(),
                    filters: filters.clone(),
                }
                .to_json()
                .ok()
            })
            .collect()
    };
    *inner.session_error.lock() = None;
    inner.set_state(LinkState::Connected, None);
    info!(relay = %inner.url, subscriptions = replay.len(), "Connected to relay");

    for frame in replay {
        if let Err(e) = sink.send(frame).await {
            end_session(inner).await;
            return format!("resubscribe failed: {}", e);
        }
    }

    let session = inner.cancel.child_token();
    let writer = tokio::spawn(write_loop(inner.clone(), sink, session.clone()));
    *writer_slot.lock() = Some(writer.abort_handle());

    let reason = read_loop(inner, &mut stream, &session).await;
    session.cancel();

    if let Err(e) = writer.await {
        warn!(relay = %inner.url, "Relay writer task failed: {}", e);
    }
    writer_slot.lock().take();

    end_session(inner).await;
    reason
}

/// Mark the session over and fail whatever was queued for it.
async fn end_session(inner: &Arc<LinkInner>) {
    inner.shared.lock().connected = false;
    inner.fail_pending();

    let mut rx = inner.outbound_rx.lock().await;
    while let Ok(item) = rx.try_recv() {
        if let Outbound::Publish { flushed, .. } = item {
            let _ = flushed.send(Err(ClientError::NotConnected(inner.url.clone())));
        }
    }
}

async fn read_loop(
    inner: &Arc<LinkInner>,
    stream: &mut FrameStream,
    session: &CancellationToken,
) -> String {
    loop {
        if inner.context.backpressure.load(Ordering::Acquire) {
            tokio::select! {
                _ = session.cancelled() => return session_end_reason(inner),
                _ = sleep(inner.config.backpressure_pause()) => continue,
            }
        }

        let frame = tokio::select! {
            _ = session.cancelled() => return session_end_reason(inner),
            frame = stream.next() => frame,
        };

        let text = match frame {
            None => return "connection closed by relay".to_string(),
            Some(Err(e)) => return e.to_string(),
            Some(Ok(text)) => text,
        };
        EngineMetrics::incr(&inner.context.metrics.frames_received);

        let message = match RelayMessage::from_json(&text) {
            Ok(message) => message,
            Err(MessageError::UnknownType(kind)) => {
                debug!(relay = %inner.url, kind = %kind, "Ignoring unknown relay message");
                continue;
            }
            Err(source) => {
                EngineMetrics::incr(&inner.context.metrics.protocol_errors);
                let error = ClientError::Protocol {
                    relay: inner.url.clone(),
                    source,
                };
                warn!(relay = %inner.url, "Resetting link: {}", error);
                return error.to_string();
            }
        };

        match message {
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => {
                debug!(relay = %inner.url, event = %event_id, success, "Publish confirmation");
                inner.resolve_confirmation(&event_id, success, &message);
            }
            RelayMessage::Notice { message } => {
                info!(relay = %inner.url, "Relay notice: {}", message);
            }
            RelayMessage::Auth { .. } => {
                debug!(relay = %inner.url, "Ignoring AUTH challenge");
            }
            RelayMessage::Count { .. } => {}
            message => {
                if let RelayMessage::Closed {
                    subscription_id,
                    message,
                } = &message
                {
                    warn!(relay = %inner.url, subscription = %subscription_id, "Relay closed subscription: {}", message);
                    inner.shared.lock().subscriptions.remove(subscription_id);
                    inner.endpoint.send_modify(|endpoint| {
                        endpoint.subscriptions.remove(subscription_id);
                    });
                }
                let forwarded = LinkMessage {
                    relay_url: inner.url.clone(),
                    message,
                };
                let delivered = tokio::select! {
                    _ = session.cancelled() => return session_end_reason(inner),
                    sent = inner.deliver.send(forwarded) => sent.is_ok(),
                };
                if !delivered {
                    debug!(relay = %inner.url, "Event consumer gone, stopping link");
                    inner.cancel.cancel();
                    return "consumer closed".to_string();
                }
            }
        }
    }
}

fn session_end_reason(inner: &LinkInner) -> String {
    if inner.cancel.is_cancelled() {
        "link closed".to_string()
    } else {
        inner
            .session_error
            .lock()
            .take()
            .unwrap_or_else(|| "session ended".to_string())
    }
}

/// Drain the outbound queue into the sink until the session ends.
async fn write_loop(inner: Arc<LinkInner>, mut sink: FrameSink, session: CancellationToken) {
    let mut rx = inner.outbound_rx.lock().await;

    loop {
        let item = tokio::select! {
            _ = session.cancelled() => break,
            item = rx.recv() => item,
        };
        let Some(item) = item else { break };

        let (frame, flushed) = match item {
            Outbound::Control(frame) => (frame, None),
            Outbound::Publish { frame, flushed } => (frame, Some(flushed)),
        };

        let result = tokio::select! {
            _ = session.cancelled() => {
                if let Some(flushed) = flushed {
                    let _ = flushed.send(Err(ClientError::NotConnected(inner.url.clone())));
                }
                break;
            }
            result = sink.send(frame) => result,
        };

        let failure = result.as_ref().err().map(ToString::to_string);
        if let Some(flushed) = flushed {
            let _ = flushed.send(result);
        }
        if let Some(error) = failure {
            warn!(relay = %inner.url, "Failed to send frame: {}", error);
            *inner.session_error.lock() = Some(error);
            session.cancel();
            break;
        }
    }
    drop(rx);

    if inner.cancel.is_cancelled() {
        if let Err(e) = sink.close().await {
            debug!(relay = %inner.url, "Error closing relay connection: {}", e);
        }
        info!(relay = %inner.url, "Disconnected from relay");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockTransport, relay_frame};
    use pretty_assertions::assert_eq;

    const RELAY: &str = "wss://relay.test";

    fn test_config() -> RelayConfig {
        RelayConfig {
            connect_timeout_ms: 1_000,
            reconnect_base_ms: 10,
            reconnect_max_ms: 100,
            max_reconnect_attempts: 3,
            long_poll_interval_ms: 5_000,
            jitter: false,
            outbound_queue: 16,
            backpressure_pause_ms: 10,
        }
    }

    fn test_event(id: &str) -> Event {
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

    fn new_link(transport: &MockTransport) -> (RelayLink, LinkEvents, LinkContext) {
        let (tx, events) = link_channel(64);
        let context = LinkContext::default();
        let link = RelayLink::new(
            RELAY,
            test_config(),
            Arc::new(transport.clone()),
            tx,
            context.clone(),
        )
        .unwrap();
        (link, events, context)
    }

    /// Next event frame, skipping EOSE and CLOSED.
    async fn next_event(events: &mut LinkEvents) -> Option<(String, String, Event)> {
        while let Some(LinkMessage { relay_url, message }) = events.recv().await {
            if let RelayMessage::Event {
                subscription_id,
                event,
            } = message
            {
                return Some((relay_url, subscription_id, event));
            }
        }
        None
    }

    async fn wait_for_state(link: &RelayLink, state: LinkState) {
        let mut rx = link.watch();
        rx.wait_for(|endpoint| endpoint.state == state).await.unwrap();
    }

    #[test]
    fn test_rejects_non_websocket_url() {
        let (tx, _events) = link_channel(1);
        let result = RelayLink::new(
            "https://relay.test",
            test_config(),
            Arc::new(MockTransport::new()),
            tx,
            LinkContext::default(),
        );
        assert!(matches!(result, Err(ClientError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_connect_and_receive_events() {
        let transport = MockTransport::new();
        let relay = transport.relay(RELAY);
        let (link, mut events, _) = new_link(&transport);

        link.connect().await.unwrap();
        assert_eq!(link.state(), LinkState::Connected);

        link.subscribe("sub1", vec![Filter::new().kinds(vec![1])])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(relay.open_subscriptions(), vec!["sub1".to_string()]);

        relay.send_event("sub1", &test_event("e1"));
        let (relay_url, sub, event) = next_event(&mut events).await.unwrap();
        assert_eq!(relay_url, RELAY);
        assert_eq!(sub, "sub1");
        assert_eq!(event.id, "e1");

        link.close(Duration::from_secs(1)).await;
        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(!relay.is_connected());
    }

    #[tokio::test]
    async fn test_first_connect_failure_reported() {
        let transport = MockTransport::new();
        let relay = transport.relay(RELAY);
        relay.fail_next_connects(1);
        let (link, _events, _) = new_link(&transport);

        let err = link.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Connection { .. }));

        // Keeps retrying in the background
        wait_for_state(&link, LinkState::Connected).await;
        assert_eq!(relay.connect_count(), 2);
        link.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_resubscribes_after_reconnect() {
        let transport = MockTransport::new();
        let relay = transport.relay(RELAY);
        let (link, _events, context) = new_link(&transport);
        let mut changes = context.state_changes.subscribe();

        link.connect().await.unwrap();
        link.subscribe("a", vec![Filter::new().kinds(vec![1])]).await.unwrap();
        link.subscribe("b", vec![Filter::new().kinds(vec![7])]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        relay.disconnect();
        let mut saw_backoff = false;
        while let Ok(change) = changes.recv().await {
            if change.current == LinkState::Backoff {
                saw_backoff = true;
            }
            if saw_backoff && change.current == LinkState::Connected {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(relay.connect_count(), 2);
        assert_eq!(relay.open_subscriptions(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(context.metrics.snapshot().reconnects, 1);
        link.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_unsubscribe_sends_close_and_stops_replay() {
        let transport = MockTransport::new();
        let relay = transport.relay(RELAY);
        let (link, _events, _) = new_link(&transport);

        link.connect().await.unwrap();
        link.subscribe("a", vec![Filter::new()]).await.unwrap();
        link.unsubscribe("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(relay.open_subscriptions().is_empty());
        assert!(link.active_subscriptions().is_empty());
        assert!(link.endpoint().subscriptions.is_empty());
        assert!(relay.sent_frames().iter().any(|f| f == r#"["CLOSE","a"]"#));
        link.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let transport = MockTransport::new();
        let (link, _events, _) = new_link(&transport);

        let err = link.send(&test_event("e1")).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_send_confirmed() {
        let transport = MockTransport::new();
        let relay = transport.relay(RELAY);
        let (link, _events, _) = new_link(&transport);
        link.connect().await.unwrap();

        let confirmation = link
            .send_confirmed(&test_event("e1"), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(confirmation.accepted);
        assert_eq!(confirmation.event_id, "e1");

        relay.reject_next_events(1, "blocked: spam");
        let confirmation = link
            .send_confirmed(&test_event("e2"), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(!confirmation.accepted);
        assert_eq!(confirmation.message, "blocked: spam");

        relay.set_auto_ok(false);
        let confirmation = link
            .send_confirmed(&test_event("e3"), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(confirmation.is_none());
        assert_eq!(relay.published_ids(), vec!["e1", "e2", "e3"]);
        link.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_send_failure_resets_session() {
        let transport = MockTransport::new();
        let relay = transport.relay(RELAY);
        let (link, _events, _) = new_link(&transport);
        link.connect().await.unwrap();

        relay.fail_next_event_sends(1);
        let err = link.send(&test_event("e1")).await.unwrap_err();
        assert!(matches!(err, ClientError::Connection { .. }));

        let mut rx = link.watch();
        rx.wait_for(|endpoint| endpoint.state == LinkState::Connected && relay.connect_count() == 2)
            .await
            .unwrap();
        link.send(&test_event("e2")).await.unwrap();
        link.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_protocol_error_resets_link() {
        let transport = MockTransport::new();
        let relay = transport.relay(RELAY);
        let (link, mut events, context) = new_link(&transport);
        link.connect().await.unwrap();
        link.subscribe("a", vec![Filter::new()]).await.unwrap();

        relay.push_frame("this is not json");
        let mut rx = link.watch();
        rx.wait_for(|endpoint| endpoint.state == LinkState::Connected && relay.connect_count() == 2)
            .await
            .unwrap();
        assert_eq!(context.metrics.snapshot().protocol_errors, 1);

        // Unknown message types are not errors
        relay.push_frame(r#"["SOMETHING_NEW","x"]"#);
        relay.push_frame(relay_frame(&RelayMessage::Eose {
            subscription_id: "a".to_string(),
        }));
        let msg = events.recv().await.unwrap();
        assert!(matches!(msg.message, RelayMessage::Eose { .. }));
        assert_eq!(relay.connect_count(), 2);
        link.close(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_after_max_attempts() {
        let transport = MockTransport::new();
        let relay = transport.relay(RELAY);
        relay.set_refuse_connections(true);
        let (link, _events, _) = new_link(&transport);

        assert!(link.connect().await.is_err());
        // 3 regular attempts at 10, 20, 40ms then long-poll every 5s
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(relay.connect_count(), 4);
        assert_eq!(link.state(), LinkState::Backoff);
        assert_eq!(link.endpoint().reconnect_attempt, 4);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(relay.connect_count(), 5);

        relay.set_refuse_connections(false);
        wait_for_state(&link, LinkState::Connected).await;
        assert_eq!(link.endpoint().reconnect_attempt, 0);
        link.close(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_close_is_aborted() {
        let transport = MockTransport::new();
        let relay = transport.relay(RELAY);
        let (link, _events, _) = new_link(&transport);
        link.connect().await.unwrap();

        relay.set_hang_on_close(true);
        let started = tokio::time::Instant::now();
        link.close(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_backpressure_pauses_reads() {
        let transport = MockTransport::new();
        let relay = transport.relay(RELAY);
        let (link, mut events, context) = new_link(&transport);
        link.connect().await.unwrap();
        link.subscribe("a", vec![Filter::new()]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        // The read already waiting completes, the next one is held back
        context.backpressure.store(true, Ordering::Release);
        relay.send_event("a", &test_event("e0"));
        relay.send_event("a", &test_event("e1"));
        let (_, _, event) = next_event(&mut events).await.unwrap();
        assert_eq!(event.id, "e0");
        let paused = timeout(Duration::from_millis(50), next_event(&mut events)).await;
        assert!(paused.is_err());

        context.backpressure.store(false, Ordering::Release);
        let (_, _, event) = next_event(&mut events).await.unwrap();
        assert_eq!(event.id, "e1");
        link.close(Duration::from_secs(1)).await;
    }
}
