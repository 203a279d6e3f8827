//! NIP-01 events and their identity.
//!
//! An event id is the lowercase hex SHA-256 of the canonical serialization
//! `[0, pubkey, created_at, kind, tags, content]`. Because the id covers every
//! field except the signature, it is also the key relays and clients
//! deduplicate on.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const KIND_SHORT_TEXT_NOTE: u16 = 1;
pub const KIND_ENCRYPTED_DIRECT_MESSAGE: u16 = 4;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("pubkey must be 64 lowercase hex characters, got {0:?}")]
    InvalidPubkey(String),

    #[error("canonical serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("event id {actual} does not match its content (expected {expected})")]
    IdMismatch { expected: String, actual: String },
}

/// A signed event as it travels between clients and relays.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    /// Unix seconds
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// Everything an event id is computed over.
///
/// Signing happens outside this crate: build the unsigned event, have the key
/// holder sign its [`id`](Self::id), then attach the signature with
/// [`into_event`](Self::into_event).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

fn is_lower_hex_key(pubkey: &str) -> bool {
    pubkey.len() == 64 && pubkey.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl UnsignedEvent {
    /// The exact bytes the id hashes.
    pub fn canonical_json(&self) -> Result<String, EventError> {
        if !is_lower_hex_key(&self.pubkey) {
            return Err(EventError::InvalidPubkey(self.pubkey.clone()));
        }
        let canonical = (
            0,
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        Ok(serde_json::to_string(&canonical)?)
    }

    pub fn id(&self) -> Result<String, EventError> {
        let digest = Sha256::digest(self.canonical_json()?.as_bytes());
        Ok(hex::encode(digest))
    }

    /// Attach a signature produced elsewhere.
    pub fn into_event(self, sig: impl Into<String>) -> Result<Event, EventError> {
        Ok(Event {
            id: self.id()?,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: sig.into(),
        })
    }
}

impl Event {
    /// Check that `id` is the hash of the other fields.
    ///
    /// The signature is not checked; a consistent id is what makes the event
    /// safe to deduplicate on.
    pub fn verify_id(&self) -> Result<(), EventError> {
        let unsigned = UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        };
        let expected = unsigned.id()?;
        if expected == self.id {
            Ok(())
        } else {
            Err(EventError::IdMismatch {
                expected,
                actual: self.id.clone(),
            })
        }
    }

    /// Second element of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags.iter().filter_map(move |tag| match tag.as_slice() {
            [tag_name, value, ..] if tag_name == name => Some(value.as_str()),
            _ => None,
        })
    }

    /// Pubkeys this event tags with `p`.
    pub fn referenced_pubkeys(&self) -> Vec<&str> {
        self.tag_values("p").collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PUBKEY: &str = "6e468422dfb74a5738702a8823b9b28168abab8655faacb6853cd0ee15deee93";

    fn note(content: &str) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: PUBKEY.to_string(),
            created_at: 1_617_932_115,
            kind: KIND_SHORT_TEXT_NOTE,
            tags: vec![],
            content: content.to_string(),
        }
    }

    #[test]
    fn test_canonical_json() {
        assert_eq!(
            note("gm \"nostr\"").canonical_json().unwrap(),
            format!(r#"[0,"{PUBKEY}",1617932115,1,[],"gm \"nostr\""]"#)
        );
    }

    #[test]
    fn test_rejects_malformed_pubkey() {
        for pubkey in ["npub1abc".to_string(), PUBKEY.to_uppercase(), PUBKEY[..63].to_string()] {
            let event = UnsignedEvent {
                pubkey,
                ..note("gm")
            };
            assert!(matches!(event.id(), Err(EventError::InvalidPubkey(_))));
        }
    }

    #[test]
    fn test_id_covers_every_field() {
        let base = note("gm").id().unwrap();
        assert_eq!(base.len(), 64);
        assert_eq!(base, note("gm").id().unwrap());

        let variants = [
            UnsignedEvent { content: "gn".to_string(), ..note("gm") },
            UnsignedEvent { kind: 7, ..note("gm") },
            UnsignedEvent { created_at: 1, ..note("gm") },
            UnsignedEvent { tags: vec![vec!["t".to_string(), "x".to_string()]], ..note("gm") },
        ];
        for variant in variants {
            assert_ne!(variant.id().unwrap(), base);
        }
    }

    #[test]
    fn test_verify_id() {
        let event = note("gm").into_event("sig").unwrap();
        assert!(event.verify_id().is_ok());

        // Signature is not part of the id
        let resigned = Event {
            sig: "other".to_string(),
            ..event.clone()
        };
        assert!(resigned.verify_id().is_ok());

        let forged = Event {
            content: "send sats".to_string(),
            ..event
        };
        assert!(matches!(forged.verify_id(), Err(EventError::IdMismatch { .. })));
    }

    #[test]
    fn test_json_keeps_id_valid() {
        let event = note("🌸 multi\nline").into_event("sig").unwrap();
        let parsed: Event = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(parsed, event);
        assert!(parsed.verify_id().is_ok());
    }

    #[test]
    fn test_referenced_pubkeys() {
        let event = UnsignedEvent {
            tags: vec![
                vec!["p".to_string(), "alice".to_string()],
                vec!["e".to_string(), "root".to_string()],
                vec!["p".to_string()],
                vec!["p".to_string(), "bob".to_string(), "wss://relay".to_string()],
            ],
            ..note("hi")
        }
        .into_event("sig")
        .unwrap();
        assert_eq!(event.referenced_pubkeys(), vec!["alice", "bob"]);
        assert_eq!(event.tag_values("e").collect::<Vec<_>>(), vec!["root"]);
    }
}
