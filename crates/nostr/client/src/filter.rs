//! REQ filters and their local evaluation.
//!
//! A [`Filter`] is sent to relays verbatim, but relays are free to ignore
//! parts of it. Every delivered event is therefore checked again here before
//! it reaches a subscription.

use nostr::Event;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// NIP-01 subscription filter.
///
/// Absent or empty sets match anything; a filter with nothing set matches
/// every event. Tag conditions are keyed on the wire name (`"#p"`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event id prefixes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Author pubkey prefixes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Lower bound on `created_at`, inclusive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Upper bound on `created_at`, inclusive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Only bounds the stored events a relay replays; never checked locally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
}

fn strings<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    values.into_iter().map(Into::into).collect()
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(strings(ids));
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(strings(authors));
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Require a single-letter tag (`'p'`, `'e'`, `'t'`...) with one of `values`.
    pub fn tag<I, S>(mut self, letter: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.insert(format!("#{letter}"), strings(values));
        self
    }

    /// Events referencing one of `pubkeys` in a `p` tag.
    pub fn pubkey_refs<I, S>(self, pubkeys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tag('p', pubkeys)
    }

    /// Events referencing one of `event_ids` in an `e` tag.
    pub fn event_refs<I, S>(self, event_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tag('e', event_ids)
    }

    /// Whether `event` satisfies every condition of this filter.
    pub fn matches(&self, event: &Event) -> bool {
        any_prefix(self.ids.as_deref(), &event.id)
            && any_prefix(self.authors.as_deref(), &event.pubkey)
            && self
                .kinds
                .as_deref()
                .is_none_or(|kinds| kinds.is_empty() || kinds.contains(&event.kind))
            && self.since.is_none_or(|since| event.created_at >= since)
            && self.until.is_none_or(|until| event.created_at <= until)
            && self
                .tags
                .iter()
                .all(|(name, wanted)| has_tag(event, name.trim_start_matches('#'), wanted))
    }
}

/// An absent or empty set matches anything.
fn any_prefix(prefixes: Option<&[String]>, value: &str) -> bool {
    match prefixes {
        None | Some([]) => true,
        Some(prefixes) => prefixes.iter().any(|prefix| value.starts_with(prefix.as_str())),
    }
}

fn has_tag(event: &Event, name: &str, wanted: &[String]) -> bool {
    wanted.is_empty()
        || event.tags.iter().any(|tag| match tag.as_slice() {
            [tag_name, value, ..] => tag_name == name && wanted.contains(value),
            _ => false,
        })
}

/// Whether `event` matches any of `filters`. Filters of one REQ are OR'ed;
/// an empty list matches nothing.
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|filter| filter.matches(event))
}
