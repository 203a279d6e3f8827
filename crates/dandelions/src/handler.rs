//! Default handler: log what arrives, answer nothing.
//!
//! Signing lives outside this binary, so the runner cannot produce replies on
//! its own. Agents embedding `nostr-client` plug their own `EventHandler` in.

use async_trait::async_trait;
use nostr::{Event, KIND_ENCRYPTED_DIRECT_MESSAGE, thread_root};
use nostr_client::{EventHandler, Subscription};
use tracing::info;

const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Default)]
pub struct LogHandler;

#[async_trait]
impl EventHandler for LogHandler {
    async fn handle(&self, event: &Event, subscription: &Subscription) -> Option<Event> {
        let preview = if event.kind == KIND_ENCRYPTED_DIRECT_MESSAGE {
            "<encrypted>".to_string()
        } else {
            preview(&event.content)
        };
        info!(
            subscription = %subscription.id,
            event_id = %event.id,
            author = %event.pubkey,
            kind = event.kind,
            thread = thread_root(event).unwrap_or("-"),
            "{}", preview
        );
        None
    }
}

fn preview(content: &str) -> String {
    let mut preview: String = content.chars().take(PREVIEW_CHARS).collect();
    if content.chars().count() > PREVIEW_CHARS {
        preview.push_str("...");
    }
    preview.replace('\n', " ")
}
