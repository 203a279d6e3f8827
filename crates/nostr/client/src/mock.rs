//! In-memory relays for tests.
//!
//! [`MockTransport`] hands out sessions to [`MockRelay`]s keyed by URL. A mock
//! relay records every frame the client sends, tracks the REQs open on the
//! current session, answers EVENT frames with `OK`, and lets a test inject
//! frames, drop the connection, or script failures.

use crate::error::{ClientError, Result};
use crate::message::RelayMessage;
use crate::transport::{FrameChannel, Transport};
use async_trait::async_trait;
use futures::Sink;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use nostr::Event;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use url::Url;

fn relay_key(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

#[derive(Debug, Default)]
struct MockRelayState {
    /// Current session id; bumped on every connect and disconnect
    session: u64,
    /// Server side of the current session's frame stream
    outbox: Option<UnboundedSender<String>>,
    connects: u32,
    refuse: bool,
    fail_connects: u32,
    fail_event_sends: u32,
    reject_events: u32,
    reject_message: String,
    auto_ok: bool,
    hang_on_close: bool,
    sent: Vec<String>,
    reqs: BTreeMap<String, Vec<Value>>,
}

impl MockRelayState {
    fn push(&self, frame: String) -> bool {
        self.outbox
            .as_ref()
            .is_some_and(|outbox| outbox.unbounded_send(frame).is_ok())
    }

    fn end_session(&mut self) {
        self.session += 1;
        self.outbox = None;
        self.reqs.clear();
    }

    fn handle_client_frame(&mut self, frame: &str) -> Result<()> {
        let parsed: Vec<Value> = serde_json::from_str(frame)
            .map_err(|e| ClientError::connection("mock", format!("unparseable frame: {}", e)))?;
        match parsed.first().and_then(Value::as_str) {
            Some("EVENT") => {
                if self.fail_event_sends > 0 {
                    self.fail_event_sends -= 1;
                    return Err(ClientError::connection("mock", "send failed"));
                }
                self.sent.push(frame.to_string());
                let event_id = parsed
                    .get(1)
                    .and_then(|event| event.get("id"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if self.reject_events > 0 {
                    self.reject_events -= 1;
                    let reply = serde_json::json!(["OK", event_id, false, self.reject_message]);
                    self.push(reply.to_string());
                } else if self.auto_ok {
                    self.push(serde_json::json!(["OK", event_id, true, ""]).to_string());
                }
            }
            Some("REQ") => {
                self.sent.push(frame.to_string());
                if let Some(id) = parsed.get(1).and_then(Value::as_str) {
                    self.reqs.insert(id.to_string(), parsed[2..].to_vec());
                }
            }
            Some("CLOSE") => {
                self.sent.push(frame.to_string());
                if let Some(id) = parsed.get(1).and_then(Value::as_str) {
                    self.reqs.remove(id);
                }
            }
            _ => self.sent.push(frame.to_string()),
        }
        Ok(())
    }
}

/// Test handle to one simulated relay.
#[derive(Debug, Clone)]
pub struct MockRelay {
    url: String,
    state: Arc<Mutex<MockRelayState>>,
}

impl MockRelay {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            state: Arc::new(Mutex::new(MockRelayState {
                auto_ok: true,
                reject_message: "blocked: rejected by mock".to_string(),
                ..MockRelayState::default()
            })),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Refuse every connection attempt until turned off again.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().fail_connects = n;
    }

    /// Fail the transmission of the next `n` EVENT frames, which also ends the
    /// session the way a broken socket would.
    pub fn fail_next_event_sends(&self, n: u32) {
        self.state.lock().fail_event_sends = n;
    }

    /// Answer the next `n` EVENT frames with `OK false` and `message`.
    pub fn reject_next_events(&self, n: u32, message: impl Into<String>) {
        let mut state = self.state.lock();
        state.reject_events = n;
        state.reject_message = message.into();
    }

    /// Whether EVENT frames are answered with `OK true` (the default).
    pub fn set_auto_ok(&self, auto_ok: bool) {
        self.state.lock().auto_ok = auto_ok;
    }

    /// Never complete a close of the client sink.
    pub fn set_hang_on_close(&self, hang: bool) {
        self.state.lock().hang_on_close = hang;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().outbox.is_some()
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().connects
    }

    /// Every frame the client sent, in order, across sessions.
    pub fn sent_frames(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Ids of EVENT frames the client sent.
    pub fn published_ids(&self) -> Vec<String> {
        self.sent_frames()
            .iter()
            .filter_map(|frame| serde_json::from_str::<Vec<Value>>(frame).ok())
            .filter(|frame| frame.first().and_then(Value::as_str) == Some("EVENT"))
            .filter_map(|frame| frame.get(1)?.get("id")?.as_str().map(str::to_string))
            .collect()
    }

    /// Subscription ids open on the current session.
    pub fn open_subscriptions(&self) -> Vec<String> {
        self.state.lock().reqs.keys().cloned().collect()
    }

    /// Send a raw frame on the current session.
    pub fn push_frame(&self, frame: impl Into<String>) -> bool {
        self.state.lock().push(frame.into())
    }

    /// Deliver `event` under one subscription id.
    pub fn send_event(&self, subscription_id: &str, event: &Event) -> bool {
        let frame = serde_json::json!(["EVENT", subscription_id, event]);
        self.push_frame(frame.to_string())
    }

    /// Deliver `event` to every open subscription, ignoring their filters.
    /// Returns how many subscriptions it was sent to.
    pub fn broadcast_event(&self, event: &Event) -> usize {
        let state = self.state.lock();
        let mut delivered = 0;
        for id in state.reqs.keys() {
            if state.push(serde_json::json!(["EVENT", id, event]).to_string()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send EOSE for every open subscription.
    pub fn send_eose_all(&self) {
        let state = self.state.lock();
        for id in state.reqs.keys() {
            state.push(serde_json::json!(["EOSE", id]).to_string());
        }
    }

    /// Drop the current session as if the socket died.
    pub fn disconnect(&self) {
        self.state.lock().end_session();
    }
}

/// Transport that connects to [`MockRelay`]s instead of the network.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    relays: Arc<Mutex<HashMap<String, MockRelay>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the relay served at `url`.
    pub fn relay(&self, url: &str) -> MockRelay {
        self.relays
            .lock()
            .entry(relay_key(url))
            .or_insert_with(|| MockRelay::new(url))
            .clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &Url) -> Result<FrameChannel> {
        let relay = self.relay(url.as_str());
        let mut state = relay.state.lock();
        state.connects += 1;

        if state.refuse {
            return Err(ClientError::connection(url.as_str(), "connection refused"));
        }
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(ClientError::connection(url.as_str(), "connection reset"));
        }

        state.end_session();
        let (tx, rx) = unbounded();
        state.outbox = Some(tx);

        let sink = MockSink {
            relay: relay.clone(),
            session: state.session,
        };
        Ok(FrameChannel {
            sink: Box::pin(sink),
            stream: Box::pin(rx.map(Ok)),
        })
    }
}

struct MockSink {
    relay: MockRelay,
    session: u64,
}

impl MockSink {
    fn check_session(&self, state: &MockRelayState) -> Result<()> {
        if state.session != self.session || state.outbox.is_none() {
            return Err(ClientError::connection(self.relay.url(), "connection closed"));
        }
        Ok(())
    }
}

impl Sink<String> for MockSink {
    type Error = ClientError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        let state = self.relay.state.lock();
        Poll::Ready(self.check_session(&state))
    }

    fn start_send(self: Pin<&mut Self>, frame: String) -> Result<()> {
        let mut state = self.relay.state.lock();
        self.check_session(&state)?;
        if let Err(e) = state.handle_client_frame(&frame) {
            state.end_session();
            return Err(e);
        }
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        let mut state = self.relay.state.lock();
        if state.hang_on_close {
            return Poll::Pending;
        }
        if state.session == self.session {
            state.end_session();
        }
        Poll::Ready(Ok(()))
    }
}

/// Parse a frame the client sent, for assertions.
pub fn parse_client_frame(frame: &str) -> Option<(String, Vec<Value>)> {
    let mut parsed: Vec<Value> = serde_json::from_str(frame).ok()?;
    if parsed.is_empty() {
        return None;
    }
    let kind = parsed.remove(0).as_str()?.to_string();
    Some((kind, parsed))
}

/// Encode a relay message the way a relay would send it.
pub fn relay_frame(message: &RelayMessage) -> String {
    message.to_json()
}
