//! Multi-relay Nostr ingestion and dispatch for Dandelions.
//!
//! This crate provides:
//! - Relay links with reconnection, backoff and subscription replay
//! - Message parsing (NIP-01 relay protocol) and local filter re-validation
//! - Event deduplication across relays and per subscription
//! - Inbound and outbound rate limiting with a bounded backpressure queue
//! - Publishing with independent per-relay retry
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_client::{DispatchEngine, EngineConfig, Filter, WebSocketTransport};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> nostr_client::Result<()> {
//!     let engine = DispatchEngine::new(EngineConfig::default(), Arc::new(WebSocketTransport))?;
//!     let mut inbound = engine.inbound()?;
//!     engine.start().await?;
//!
//!     // Subscribe to kind 1 (text notes) on every relay
//!     engine.subscribe(vec![Filter::new().kinds(vec![1]).limit(10)], &[]).await?;
//!
//!     while let Some(item) = inbound.recv().await {
//!         println!("{} from {}", item.event.id, item.relay_url);
//!     }
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

mod backoff;
mod config;
mod dedup;
mod engine;
mod error;
mod filter;
mod handler;
mod message;
mod metrics;
pub mod mock;
mod publish;
mod rate_limit;
mod relay;
mod subscription;
mod transport;

// Re-export main types
pub use backoff::Backoff;
pub use config::{
    BucketConfig, ConfigError, DEFAULT_RELAYS, DedupConfig, DispatchConfig, EngineConfig,
    PublishConfig, RateLimitConfig, RelayConfig, ShutdownConfig, validate_relay_url,
};
pub use dedup::{DedupRecord, EventDeduplicator};
pub use engine::{DispatchEngine, EngineSnapshot, InboundStream};
pub use error::{ClientError, Result};
pub use handler::{EventHandler, FnHandler};
pub use filter::{Filter, matches_any};
pub use message::{ClientMessage, MessageError, RelayMessage};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use publish::{
    PublishAttempt, PublishCoordinator, PublishResult, PublishStatus, RelayOutcome,
};
pub use rate_limit::{BackpressureQueue, Direction, RateLimitReason, RateLimiter, TokenBucket};
pub use relay::{
    LinkContext, LinkEvents, LinkMessage, LinkState, LinkStateChange, PublishConfirmation,
    RelayEndpoint, RelayLink, link_channel,
};
pub use subscription::{
    InboundEvent, Subscription, SubscriptionRouter, SubscriptionStream, SubscriptionTracker,
    generate_subscription_id,
};
pub use transport::{FrameChannel, FrameSink, FrameStream, Transport, WebSocketTransport};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_default_relays() {
        assert!(!DEFAULT_RELAYS.is_empty());
        for relay in DEFAULT_RELAYS {
            assert!(relay.starts_with("wss://"));
            assert!(validate_relay_url(relay).is_ok());
        }
    }

    #[test]
    fn test_default_engine() {
        let engine = DispatchEngine::new(EngineConfig::default(), Arc::new(WebSocketTransport));
        assert_eq!(engine.unwrap().relay_urls().len(), DEFAULT_RELAYS.len());
    }
}
