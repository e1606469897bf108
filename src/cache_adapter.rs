//! Local cache capability
//!
//! The engine consumes the cache as an opaque query/store capability; the
//! storage engine behind it is out of scope. `locking` declares whether the
//! cache is fast enough that a close-on-EOSE subscription should wait for it
//! before touching the network.

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Errors surfaced by cache implementations. The engine degrades them:
/// a failed query becomes an empty result, a failed store is logged and
/// dropped.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache query failed: {0}")]
    Query(String),

    #[error("Cache store failed: {0}")]
    Store(String),
}

#[async_trait]
pub trait CacheAdapter: Send + Sync + std::fmt::Debug + 'static {
    /// Events currently known to satisfy the filters. Must return `Ok(vec![])`
    /// for an empty result, never an error.
    async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>, CacheError>;

    /// Best-effort write-through of an admitted event
    async fn store(
        &self,
        event: &Event,
        filters: &[Filter],
        relay: Option<&RelayUrl>,
    ) -> Result<(), CacheError> {
        let _ = (event, filters, relay);
        Ok(())
    }

    /// Whether the cache is fast enough to block on before relay fan-out
    fn locking(&self) -> bool {
        false
    }
}

/// Cache that stores nothing and answers every query with nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl CacheAdapter for NoopCache {
    async fn query(&self, _filters: &[Filter]) -> Result<Vec<Event>, CacheError> {
        Ok(Vec::new())
    }
}

/// In-memory cache adapter. Keeps every stored event keyed by id and answers
/// queries by filter matching, newest first with per-filter limits applied.
/// Declares itself locking.
#[derive(Debug, Default)]
pub struct MemoryCache {
    events: RwLock<HashMap<EventId, Event>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the cache outside the subscription path
    pub fn insert(&self, event: Event) {
        self.events.write().insert(event.id, event);
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.events.read().contains_key(id)
    }
}

#[async_trait]
impl CacheAdapter for MemoryCache {
    async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>, CacheError> {
        let events = self.events.read();
        let mut seen: HashMap<EventId, Event> = HashMap::new();

        for filter in filters {
            let mut matches: Vec<&Event> = events
                .values()
                .filter(|event| filter.match_event(event))
                .collect();
            matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
            if let Some(limit) = filter.limit {
                matches.truncate(limit);
            }
            for event in matches {
                seen.entry(event.id).or_insert_with(|| event.clone());
            }
        }

        let mut results: Vec<Event> = seen.into_values().collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(results)
    }

    async fn store(
        &self,
        event: &Event,
        _filters: &[Filter],
        _relay: Option<&RelayUrl>,
    ) -> Result<(), CacheError> {
        self.events.write().insert(event.id, event.clone());
        Ok(())
    }

    fn locking(&self) -> bool {
        true
    }
}
