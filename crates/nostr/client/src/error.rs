//! Client error types

use crate::config::ConfigError;
use crate::message::MessageError;
use crate::rate_limit::RateLimitReason;
use std::time::Duration;
use thiserror::Error;

/// Client error type
///
/// Everything scoped to a single relay (`Connection`, `Protocol`,
/// `NotConnected`, `PublishGivenUp`) is recovered from inside the engine and
/// never aborts work on other relays.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Transport-level failure talking to one relay
    #[error("Connection error on {relay}: {message}")]
    Connection { relay: String, message: String },

    /// Malformed frame from a relay
    #[error("Protocol error from {relay}: {source}")]
    Protocol {
        relay: String,
        #[source]
        source: MessageError,
    },

    /// Local admission denial
    #[error("Rate limited: {0}")]
    RateLimited(RateLimitReason),

    /// The handler did not answer in time
    #[error("Handler timed out after {0:?}")]
    HandlerTimeout(Duration),

    /// Per-relay terminal publish failure
    #[error("Publish of {event_id} to {relay} given up after {attempts} attempts: {last_error}")]
    PublishGivenUp {
        event_id: String,
        relay: String,
        attempts: u32,
        last_error: String,
    },

    /// Invalid configuration detected at startup
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Not connected
    #[error("Not connected to relay {0}")]
    NotConnected(String),

    /// Subscription id not registered
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(String),

    /// Relay URL not configured on this engine
    #[error("Unknown relay: {0}")]
    UnknownRelay(String),

    /// The inbound stream has already been handed out
    #[error("Inbound stream already taken")]
    InboundTaken,

    /// The engine (or link) is shutting down
    #[error("Shutting down")]
    Shutdown,
}

impl ClientError {
    pub(crate) fn connection(relay: impl Into<String>, message: impl ToString) -> Self {
        ClientError::Connection {
            relay: relay.into(),
            message: message.to_string(),
        }
    }
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_relay() {
        let err = ClientError::connection("wss://relay.example.com", "refused");
        assert_eq!(
            err.to_string(),
            "Connection error on wss://relay.example.com: refused"
        );
    }
}
