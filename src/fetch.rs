//! One-shot query APIs layered on subscriptions
//!
//! `fetch_events` and `fetch_event` open a close-on-EOSE subscription,
//! collect what it yields and return merged results. Both are bounded by the
//! configured fetch timeout; hitting it returns what was gathered so far
//! rather than an error.

use crate::dedup::{into_sorted_events, merge_into, DedupKey};
use crate::error::Result;
use crate::relay_pool::RelayPool;
use crate::subscription::{SubscriptionOptions, SubscriptionUpdate};
use nostr_sdk::prelude::*;
use std::collections::HashMap;
use tracing::debug;

impl RelayPool {
    /// Fetch all events matching `filters`, deduplicated and newest first.
    ///
    /// Replaceable and addressable events collapse onto their replacement
    /// key with the newest version winning.
    pub async fn fetch_events(
        &self,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
    ) -> Result<Vec<Event>> {
        let subscription = self.subscribe(filters, options.with_close_on_eose(true))?;
        let timeout = self.config().fetch_timeout;

        let mut merged: HashMap<DedupKey, Event> = HashMap::new();
        let collect = async {
            // emit_cached_events = true routes cache hits through the
            // update stream, so the same loop sees them
            let _ = subscription.start(true).await?;
            while let Some(update) = subscription.recv().await {
                match update {
                    SubscriptionUpdate::Event(event) => merge_into(&mut merged, *event),
                    SubscriptionUpdate::Eose | SubscriptionUpdate::Closed => break,
                    SubscriptionUpdate::Duplicate { .. } => {}
                }
            }
            Ok(())
        };
        let outcome = tokio::time::timeout(timeout, collect).await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!(
                    subscription_id = %subscription.id(),
                    collected = merged.len(),
                    "fetch timed out, returning partial results"
                );
                subscription.stop();
            }
        }

        Ok(into_sorted_events(merged))
    }

    /// Fetch a single event matching `filters`.
    ///
    /// The first regular event to arrive wins immediately. Replaceable and
    /// addressable kinds keep racing until EOSE so a newer version from a
    /// slower relay can still win; the newest candidate is returned.
    pub async fn fetch_event(
        &self,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
    ) -> Result<Option<Event>> {
        let subscription = self.subscribe(filters, options.with_close_on_eose(true))?;
        let timeout = self.config().fetch_timeout;

        let mut candidates: HashMap<DedupKey, Event> = HashMap::new();
        let race = async {
            let _ = subscription.start(true).await?;
            while let Some(update) = subscription.recv().await {
                match update {
                    SubscriptionUpdate::Event(event) => {
                        let event = *event;
                        if !event.kind.is_replaceable() && !event.kind.is_addressable() {
                            return Ok(Some(event));
                        }
                        merge_into(&mut candidates, event);
                    }
                    SubscriptionUpdate::Eose | SubscriptionUpdate::Closed => break,
                    SubscriptionUpdate::Duplicate { .. } => {}
                }
            }
            Ok(None)
        };
        let outcome = tokio::time::timeout(timeout, race).await;

        match outcome {
            Ok(Ok(Some(event))) => {
                subscription.stop();
                return Ok(Some(event));
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!(
                    subscription_id = %subscription.id(),
                    "fetch_event timed out, returning best candidate"
                );
                subscription.stop();
            }
        }

        Ok(into_sorted_events(candidates).into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_adapter::MemoryCache;
    use crate::config::EngineConfig;
    use crate::subscription::CacheUsage;
    use crate::test_utils::{create_test_event_at, create_test_keys, MockTransport};
    use std::sync::Arc;

    fn cache_only_pool(cache: Arc<MemoryCache>) -> RelayPool {
        RelayPool::builder(Arc::new(MockTransport::default()))
            .with_config(EngineConfig::default().with_rng_seed(11))
            .with_cache(cache)
            .build()
    }

    fn cache_options() -> SubscriptionOptions {
        SubscriptionOptions::new().with_cache_usage(CacheUsage::OnlyCache)
    }

    #[tokio::test]
    async fn test_fetch_events_returns_sorted_deduplicated_cache_hits() {
        let keys = create_test_keys();
        let cache = Arc::new(MemoryCache::new());
        cache.insert(create_test_event_at(&keys, Kind::TextNote, vec![], 100));
        cache.insert(create_test_event_at(&keys, Kind::TextNote, vec![], 300));
        cache.insert(create_test_event_at(&keys, Kind::TextNote, vec![], 200));
        let pool = cache_only_pool(cache);

        let events = pool
            .fetch_events(vec![Filter::new().kind(Kind::TextNote)], cache_options())
            .await
            .expect("fetch_events");

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].created_at.as_u64(), 300, "newest first");
        assert_eq!(events[2].created_at.as_u64(), 100);
    }

    #[tokio::test]
    async fn test_fetch_events_collapses_replaceable_versions() {
        let keys = create_test_keys();
        let cache = Arc::new(MemoryCache::new());
        cache.insert(create_test_event_at(&keys, Kind::Metadata, vec![], 100));
        cache.insert(create_test_event_at(&keys, Kind::Metadata, vec![], 400));
        let pool = cache_only_pool(cache);

        let events = pool
            .fetch_events(vec![Filter::new().kind(Kind::Metadata)], cache_options())
            .await
            .expect("fetch_events");

        assert_eq!(events.len(), 1, "one metadata event per author");
        assert_eq!(events[0].created_at.as_u64(), 400);
    }

    #[tokio::test]
    async fn test_fetch_event_returns_first_regular_event() {
        let keys = create_test_keys();
        let cache = Arc::new(MemoryCache::new());
        cache.insert(create_test_event_at(&keys, Kind::TextNote, vec![], 100));
        let pool = cache_only_pool(cache);

        let event = pool
            .fetch_event(vec![Filter::new().kind(Kind::TextNote)], cache_options())
            .await
            .expect("fetch_event");

        assert_eq!(
            event.map(|e| e.created_at.as_u64()),
            Some(100),
            "regular event should be returned"
        );
    }

    #[tokio::test]
    async fn test_fetch_event_resolves_replaceable_at_eose() {
        let keys = create_test_keys();
        let cache = Arc::new(MemoryCache::new());
        cache.insert(create_test_event_at(&keys, Kind::Metadata, vec![], 50));
        cache.insert(create_test_event_at(&keys, Kind::Metadata, vec![], 90));
        let pool = cache_only_pool(cache);

        let event = pool
            .fetch_event(vec![Filter::new().kind(Kind::Metadata)], cache_options())
            .await
            .expect("fetch_event");

        assert_eq!(
            event.map(|e| e.created_at.as_u64()),
            Some(90),
            "newest replaceable version wins at EOSE"
        );
    }

    #[tokio::test]
    async fn test_fetch_event_empty_cache_returns_none() {
        let pool = cache_only_pool(Arc::new(MemoryCache::new()));
        let event = pool
            .fetch_event(vec![Filter::new().kind(Kind::TextNote)], cache_options())
            .await
            .expect("fetch_event");
        assert!(event.is_none());
    }
}
