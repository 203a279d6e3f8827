//! Engine configuration.
//!
//! Every section is `#[serde(default)]`, so a config file only needs the keys
//! it changes. Durations are integer milliseconds. Configuration is fixed for
//! the lifetime of an engine.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Relays used when none are configured.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.snort.social",
];

/// Startup validation failures. These are the only fatal engine errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no relays configured")]
    NoRelays,

    #[error("invalid relay url {url}: {reason}")]
    InvalidRelayUrl { url: String, reason: String },

    #[error("relay {0} configured more than once")]
    DuplicateRelay(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Relay WebSocket URLs
    pub relays: Vec<String>,
    pub relay: RelayConfig,
    pub rate_limit: RateLimitConfig,
    pub dedup: DedupConfig,
    pub publish: PublishConfig,
    pub dispatch: DispatchConfig,
    pub shutdown: ShutdownConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(|url| url.to_string()).collect(),
            relay: RelayConfig::default(),
            rate_limit: RateLimitConfig::default(),
            dedup: DedupConfig::default(),
            publish: PublishConfig::default(),
            dispatch: DispatchConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Replace the relay list.
    pub fn with_relays<I, S>(mut self, relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relays = relays.into_iter().map(Into::into).collect();
        self
    }

    /// Check the configuration, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relays.is_empty() {
            return Err(ConfigError::NoRelays);
        }

        let mut seen = HashSet::new();
        for relay in &self.relays {
            validate_relay_url(relay)?;
            if !seen.insert(relay.trim_end_matches('/')) {
                return Err(ConfigError::DuplicateRelay(relay.clone()));
            }
        }

        let non_zero: [(&'static str, u64); 15] = [
            ("relay.outbound_queue", self.relay.outbound_queue as u64),
            ("relay.reconnect_base_ms", self.relay.reconnect_base_ms),
            ("rate_limit.inbound_per_relay.burst", self.rate_limit.inbound_per_relay.burst.into()),
            ("rate_limit.outbound_per_relay.burst", self.rate_limit.outbound_per_relay.burst.into()),
            ("rate_limit.global_inbound.burst", self.rate_limit.global_inbound.burst.into()),
            ("rate_limit.queue_depth", self.rate_limit.queue_depth as u64),
            ("rate_limit.drain_interval_ms", self.rate_limit.drain_interval_ms),
            ("dedup.capacity", self.dedup.capacity as u64),
            ("dedup.per_subscription_capacity", self.dedup.per_subscription_capacity as u64),
            ("publish.max_attempts", self.publish.max_attempts.into()),
            ("dispatch.workers", self.dispatch.workers as u64),
            ("dispatch.channel_capacity", self.dispatch.channel_capacity as u64),
            ("dispatch.handler_concurrency", self.dispatch.handler_concurrency as u64),
            ("dispatch.handler_timeout_ms", self.dispatch.handler_timeout_ms),
            ("dispatch.cancellation_check_ms", self.dispatch.cancellation_check_ms),
        ];
        if let Some(&(name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(name));
        }

        for (name, bucket) in [
            ("rate_limit.inbound_per_relay.rate_per_hour", &self.rate_limit.inbound_per_relay),
            ("rate_limit.outbound_per_relay.rate_per_hour", &self.rate_limit.outbound_per_relay),
            ("rate_limit.global_inbound.rate_per_hour", &self.rate_limit.global_inbound),
        ] {
            if bucket.rate_per_hour == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        Ok(())
    }
}

/// Parse and check a relay URL. Only `ws://` and `wss://` are accepted.
pub fn validate_relay_url(relay: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(relay).map_err(|e| ConfigError::InvalidRelayUrl {
        url: relay.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        scheme => Err(ConfigError::InvalidRelayUrl {
            url: relay.to_string(),
            reason: format!("unsupported scheme {}", scheme),
        }),
    }
}

/// Per-link connection and reconnection behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub connect_timeout_ms: u64,
    /// First reconnect delay
    pub reconnect_base_ms: u64,
    /// Reconnect delay cap
    pub reconnect_max_ms: u64,
    /// Consecutive failures before falling back to long-poll reconnects
    pub max_reconnect_attempts: u32,
    pub long_poll_interval_ms: u64,
    /// Randomise backoff delays (full jitter)
    pub jitter: bool,
    /// Depth of the per-link outbound frame queue
    pub outbound_queue: usize,
    /// How long reads pause while the engine signals backpressure
    pub backpressure_pause_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 60_000,
            max_reconnect_attempts: 10,
            long_poll_interval_ms: 300_000,
            jitter: true,
            outbound_queue: 256,
            backpressure_pause_ms: 250,
        }
    }
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn long_poll_interval(&self) -> Duration {
        Duration::from_millis(self.long_poll_interval_ms)
    }

    pub fn backpressure_pause(&self) -> Duration {
        Duration::from_millis(self.backpressure_pause_ms)
    }
}

/// Refill rate and capacity of one token bucket. A table that sets only one
/// key takes the other from [`BucketConfig::default`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    pub rate_per_hour: u32,
    pub burst: u32,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            rate_per_hour: 100,
            burst: 100,
        }
    }
}

/// Token-bucket parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub inbound_per_relay: BucketConfig,
    pub outbound_per_relay: BucketConfig,
    pub global_inbound: BucketConfig,
    /// Events held while the global bucket is empty
    pub queue_depth: usize,
    /// How often queued events are retried against the global bucket
    pub drain_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            inbound_per_relay: BucketConfig::default(),
            outbound_per_relay: BucketConfig {
                rate_per_hour: 600,
                burst: 60,
            },
            global_inbound: BucketConfig {
                rate_per_hour: 300,
                burst: 300,
            },
            queue_depth: 1_000,
            drain_interval_ms: 1_000,
        }
    }
}

impl RateLimitConfig {
    /// Buckets that never get in the way, for tests and local relays.
    pub fn unlimited() -> Self {
        let open = BucketConfig {
            rate_per_hour: u32::MAX,
            burst: 1_000_000,
        };
        Self {
            inbound_per_relay: open,
            outbound_per_relay: open,
            global_inbound: open,
            ..Self::default()
        }
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Event ids remembered across all relays
    pub capacity: usize,
    /// Event ids remembered by each subscription
    pub per_subscription_capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            per_subscription_capacity: 10_000,
        }
    }
}

/// Outbound publish retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Deadline for a whole publish call across all target relays
    pub timeout_ms: u64,
    /// Attempts per relay before giving up
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub jitter: bool,
    /// How long to wait for a relay `OK` after a frame is flushed
    pub ack_wait_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_attempts: 5,
            retry_base_ms: 500,
            retry_max_ms: 10_000,
            jitter: true,
            ack_wait_ms: 5_000,
        }
    }
}

impl PublishConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }
}

/// Dispatch worker pool and handler boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Filter-evaluation workers; frames are sharded across them by relay
    pub workers: usize,
    /// Capacity of every internal channel
    pub channel_capacity: usize,
    pub handler_timeout_ms: u64,
    /// Handler invocations allowed to run at once
    pub handler_concurrency: usize,
    /// Upper bound on how long a blocked consumer takes to notice shutdown
    pub cancellation_check_ms: u64,
    /// Authors whose events never reach the handler (usually the agent itself)
    pub ignore_authors: Vec<String>,
    /// Drop events whose id is not the hash of their content
    pub verify_ids: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            channel_capacity: 1_024,
            handler_timeout_ms: 60_000,
            handler_concurrency: 4,
            cancellation_check_ms: 100,
            ignore_authors: Vec::new(),
            verify_ids: true,
        }
    }
}

impl DispatchConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn cancellation_check(&self) -> Duration {
        Duration::from_millis(self.cancellation_check_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long in-flight publishes may keep running after shutdown starts
    pub grace_ms: u64,
    /// Per-link deadline before a hung link is aborted
    pub link_close_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_ms: 5_000,
            link_close_timeout_ms: 2_000,
        }
    }
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn link_close_timeout(&self) -> Duration {
        Duration::from_millis(self.link_close_timeout_ms)
    }
}
