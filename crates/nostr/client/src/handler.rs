//! Handler boundary: what the engine calls for every admitted event.

use crate::subscription::Subscription;
use async_trait::async_trait;
use nostr::Event;
use std::future::Future;
use std::marker::PhantomData;

/// Reacts to inbound events, optionally producing a response to publish.
///
/// The engine bounds every call with the configured handler timeout; a call
/// that runs over is dropped and treated as producing nothing.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event, subscription: &Subscription) -> Option<Event>;
}

/// Adapts a closure returning a future into an [`EventHandler`].
///
/// The closure receives owned copies so the future can be `'static`.
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Event, Subscription) -> Fut + Send + Sync,
    Fut: Future<Output = Option<Event>> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F, Fut>
where
    F: Fn(Event, Subscription) -> Fut + Send + Sync,
    Fut: Future<Output = Option<Event>> + Send,
{
    async fn handle(&self, event: &Event, subscription: &Subscription) -> Option<Event> {
        (self.f)(event.clone(), subscription.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn event(content: &str) -> Event {
        Event {
            id: "id".to_string(),
            pubkey: "pk".to_string(),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: content.to_string(),
            sig: "sig".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fn_handler() {
        let handler = FnHandler::new(|event: Event, _sub: Subscription| async move {
            (event.content == "ping").then(|| Event {
                content: "pong".to_string(),
                ..event
            })
        });
        let sub = Subscription {
            id: "s".to_string(),
            filters: vec![],
            relays: BTreeSet::new(),
        };

        let reply = handler.handle(&event("ping"), &sub).await.unwrap();
        assert_eq!(reply.content, "pong");
        assert!(handler.handle(&event("other"), &sub).await.is_none());
    }
}
