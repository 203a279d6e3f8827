//! NIP-01 wire frames.
//!
//! Every frame is a JSON array whose first element names it. Clients send
//! `EVENT`, `REQ` and `CLOSE`; relays answer with `EVENT`, `OK`, `EOSE`,
//! `CLOSED` and `NOTICE`, plus `AUTH` (NIP-42) and `COUNT` (NIP-45), which
//! are parsed but not acted on.

use crate::filter::Filter;
use nostr::Event;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A well-formed frame of a type this client does not know. Not fatal.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("missing {0}")]
    MissingField(&'static str),

    #[error("invalid event: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frames sent to a relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Event),
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close {
        subscription_id: String,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, MessageError> {
        let frame = match self {
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = Vec::with_capacity(filters.len() + 2);
                frame.push(json!("REQ"));
                frame.push(json!(subscription_id));
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
            ClientMessage::Close { subscription_id } => json!(["CLOSE", subscription_id]),
        };
        Ok(frame.to_string())
    }
}

/// Frames received from a relay.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Event,
    },
    /// Answer to a published event
    Ok {
        event_id: String,
        success: bool,
        /// Machine-readable prefix (`duplicate:`, `blocked:`...) plus detail
        message: String,
    },
    /// The relay finished replaying stored events for a subscription
    Eose {
        subscription_id: String,
    },
    /// The relay ended a subscription on its own
    Closed {
        subscription_id: String,
        message: String,
    },
    Notice {
        message: String,
    },
    Auth {
        challenge: String,
    },
    Count {
        subscription_id: String,
        count: u64,
    },
}

/// Positional access to the elements of a parsed frame.
struct Frame(Vec<Value>);

impl Frame {
    fn label(&self) -> Result<&str, MessageError> {
        match self.0.first() {
            Some(Value::String(label)) => Ok(label.as_str()),
            Some(_) => Err(MessageError::Malformed("frame label is not a string".into())),
            None => Err(MessageError::Malformed("empty frame".into())),
        }
    }

    fn get(&self, index: usize, field: &'static str) -> Result<&Value, MessageError> {
        self.0.get(index).ok_or(MessageError::MissingField(field))
    }

    fn text(&self, index: usize, field: &'static str) -> Result<String, MessageError> {
        self.get(index, field)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| MessageError::Malformed(format!("{field} is not a string")))
    }

    /// Trailing human-readable text that relays often leave out.
    fn optional_text(&self, index: usize) -> String {
        self.0
            .get(index)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

impl RelayMessage {
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let frame = Frame(
            serde_json::from_str(json).map_err(|e| MessageError::Malformed(e.to_string()))?,
        );

        let message = match frame.label()? {
            "EVENT" => RelayMessage::Event {
                subscription_id: frame.text(1, "subscription id")?,
                event: Event::deserialize(frame.get(2, "event")?)?,
            },
            "OK" => RelayMessage::Ok {
                event_id: frame.text(1, "event id")?,
                success: frame.get(2, "OK status")?.as_bool().ok_or_else(|| {
                    MessageError::Malformed("OK status is not a boolean".into())
                })?,
                message: frame.optional_text(3),
            },
            "EOSE" => RelayMessage::Eose {
                subscription_id: frame.text(1, "subscription id")?,
            },
            "CLOSED" => RelayMessage::Closed {
                subscription_id: frame.text(1, "subscription id")?,
                message: frame.optional_text(2),
            },
            "NOTICE" => RelayMessage::Notice {
                message: frame.text(1, "notice")?,
            },
            "AUTH" => RelayMessage::Auth {
                challenge: frame.text(1, "challenge")?,
            },
            "COUNT" => RelayMessage::Count {
                subscription_id: frame.text(1, "subscription id")?,
                count: frame
                    .get(2, "count")?
                    .get("count")
                    .and_then(Value::as_u64)
                    .ok_or(MessageError::MissingField("count"))?,
            },
            other => return Err(MessageError::UnknownType(other.to_string())),
        };
        Ok(message)
    }

    /// Encode the frame as a relay would send it.
    pub fn to_json(&self) -> String {
        let frame = match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => json!(["OK", event_id, success, message]),
            RelayMessage::Eose { subscription_id } => json!(["EOSE", subscription_id]),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]),
            RelayMessage::Notice { message } => json!(["NOTICE", message]),
            RelayMessage::Auth { challenge } => json!(["AUTH", challenge]),
            RelayMessage::Count {
                subscription_id,
                count,
            } => json!(["COUNT", subscription_id, { "count": count }]),
        };
        frame.to_string()
    }
}
