//! Nostr protocol types for Dandelions.
//!
//! This crate provides:
//! - NIP-01: the event structure and event ids
//! - NIP-10: reply and mention tag conventions for text notes
//!
//! Signing is intentionally absent: events arrive here already signed, or are
//! signed by an external key holder before they are handed to the client.

mod nip01;
mod nip10;

pub use nip01::{
    Event, EventError, KIND_ENCRYPTED_DIRECT_MESSAGE, KIND_SHORT_TEXT_NOTE, UnsignedEvent,
};
pub use nip10::{reply_tags, thread_root};
