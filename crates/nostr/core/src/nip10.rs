//! NIP-10: Text Notes and Threads
//!
//! Just enough of the reply conventions for an agent to answer a note in
//! thread: marked `e` tags (root, reply) and the `p` tags of participants.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/10.md>

use crate::Event;

const MARKER_ROOT: &str = "root";
const MARKER_REPLY: &str = "reply";

/// Id of the thread root `event` belongs to, if it is a reply.
///
/// Prefers the marked root tag and falls back to the deprecated positional
/// form, where the first `e` tag is the root.
pub fn thread_root(event: &Event) -> Option<&str> {
    let e_tags: Vec<&Vec<String>> = event
        .tags
        .iter()
        .filter(|tag| tag.len() >= 2 && tag[0] == "e")
        .collect();

    e_tags
        .iter()
        .find(|tag| tag.get(3).map(String::as_str) == Some(MARKER_ROOT))
        .or_else(|| e_tags.first())
        .map(|tag| tag[1].as_str())
}

/// Tags for a reply to `parent`.
///
/// The root of the parent's thread (or the parent itself) is tagged `root`,
/// the parent is tagged `reply`, and the parent's author plus every pubkey it
/// tagged are carried over as `p` tags, without duplicates.
pub fn reply_tags(parent: &Event) -> Vec<Vec<String>> {
    let mut tags = Vec::new();

    match thread_root(parent) {
        Some(root) if root != parent.id => {
            tags.push(marked_e_tag(root, MARKER_ROOT));
            tags.push(marked_e_tag(&parent.id, MARKER_REPLY));
        }
        _ => tags.push(marked_e_tag(&parent.id, MARKER_ROOT)),
    }

    let mut pubkeys: Vec<&str> = vec![parent.pubkey.as_str()];
    for pubkey in parent.referenced_pubkeys() {
        if !pubkeys.contains(&pubkey) {
            pubkeys.push(pubkey);
        }
    }
    tags.extend(
        pubkeys
            .into_iter()
            .map(|pubkey| vec!["p".to_string(), pubkey.to_string()]),
    );

    tags
}

fn marked_e_tag(event_id: &str, marker: &str) -> Vec<String> {
    vec![
        "e".to_string(),
        event_id.to_string(),
        String::new(),
        marker.to_string(),
    ]
}
