//! Deduplication keys and merge policy for bounded fetches
//!
//! Raw admission tracks event ids; bounded collection merges by logical
//! identity instead, so replaceable and addressable events collapse to the
//! newest version regardless of which relay produced which copy.

use nostr_sdk::prelude::*;
use std::collections::HashMap;

/// Logical identity of an event, derived from its kind class
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    /// Regular events are identified by their content hash
    Id(EventId),
    /// Replaceable events collapse per author and kind
    Replaceable { kind: Kind, pubkey: PublicKey },
    /// Addressable events collapse per author, kind and `d` tag value
    Addressable {
        kind: Kind,
        pubkey: PublicKey,
        identifier: String,
    },
}

impl DedupKey {
    /// Derive the deduplication key for an event
    pub fn from_event(event: &Event) -> Self {
        if event.kind.is_replaceable() {
            Self::Replaceable {
                kind: event.kind,
                pubkey: event.pubkey,
            }
        } else if event.kind.is_addressable() {
            // A missing `d` tag collapses with the empty identifier
            Self::Addressable {
                kind: event.kind,
                pubkey: event.pubkey,
                identifier: event.tags.identifier().unwrap_or_default().to_string(),
            }
        } else {
            Self::Id(event.id)
        }
    }
}

/// Whether `candidate` should replace `incumbent` under the merge policy.
///
/// Only a strictly greater `created_at` wins; a tie keeps the incumbent.
pub fn supersedes(candidate: &Event, incumbent: &Event) -> bool {
    candidate.created_at > incumbent.created_at
}

/// Merge an event into a keyed result set, applying the replacement policy
pub fn merge_into(results: &mut HashMap<DedupKey, Event>, event: Event) {
    let key = DedupKey::from_event(&event);
    match results.get(&key) {
        Some(incumbent) if !supersedes(&event, incumbent) => {}
        _ => {
            results.insert(key, event);
        }
    }
}

/// Drain a keyed result set into a deterministic ordering, newest first
pub fn into_sorted_events(results: HashMap<DedupKey, Event>) -> Vec<Event> {
    let mut events: Vec<Event> = results.into_values().collect();
    events.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    events
}
