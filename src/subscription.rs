//! Caller-facing subscription handle and options
//!
//! A `Subscription` owns one logical query. The caller configures it through
//! `SubscriptionOptions`, starts it, and consumes `SubscriptionUpdate`s from
//! the stream. All mutable state lives in the coordination task; this handle
//! only holds the channels to reach it.

use crate::error::{Error, Result};
use crate::subscription_coordinator::CoordinatorMessage;
use nostr_sdk::prelude::*;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// How the local cache and the relay pool are combined for one query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheUsage {
    /// Answer from the cache alone; relays are never contacted
    OnlyCache,
    /// Consult the cache, then fan out to relays
    #[default]
    CacheFirst,
    /// Query cache and relays concurrently
    Parallel,
    /// Skip the cache entirely
    OnlyRelay,
}

/// Filter constraints that can be stripped when querying the cache, so a
/// narrow relay query does not also narrow what the cache may contribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterConstraint {
    Since,
    Until,
    Limit,
}

/// Options for one subscription
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    /// Stop the subscription when the aggregate EOSE is emitted
    pub close_on_eose: bool,
    /// Cache/relay orchestration mode
    pub cache_usage: CacheUsage,
    /// Skip structural validation of inbound events
    pub skip_validation: bool,
    /// Skip signature verification of relay-sourced events
    pub skip_verification: bool,
    /// Do not write admitted events through to the cache
    pub skip_cache_write: bool,
    /// Allow coalescing with identical subscriptions started within this delay
    pub groupable_delay: Option<Duration>,
    /// Narrow relay filters with `since` one second past the newest cached event
    pub since_from_cache: bool,
    /// Restrict fan-out to these relays instead of consulting the whole pool
    pub relays: Option<Vec<RelayUrl>>,
    /// Constraints stripped from filters when querying the cache
    pub cache_unconstrain: Vec<FilterConstraint>,
    /// Caller-assigned id; generated when absent
    pub subscription_id: Option<String>,
}

impl SubscriptionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the subscription when the aggregate EOSE is emitted
    pub fn with_close_on_eose(mut self, close_on_eose: bool) -> Self {
        self.close_on_eose = close_on_eose;
        self
    }

    /// Set the cache/relay orchestration mode
    pub fn with_cache_usage(mut self, cache_usage: CacheUsage) -> Self {
        self.cache_usage = cache_usage;
        self
    }

    /// Skip structural validation of inbound events
    pub fn with_skip_validation(mut self, skip: bool) -> Self {
        self.skip_validation = skip;
        self
    }

    /// Skip signature verification of relay-sourced events
    pub fn with_skip_verification(mut self, skip: bool) -> Self {
        self.skip_verification = skip;
        self
    }

    /// Do not write admitted events through to the cache
    pub fn with_skip_cache_write(mut self, skip: bool) -> Self {
        self.skip_cache_write = skip;
        self
    }

    /// Allow coalescing with identical subscriptions started within `delay`
    pub fn with_groupable_delay(mut self, delay: Duration) -> Self {
        self.groupable_delay = Some(delay);
        self
    }

    /// Narrow relay filters using the newest cached timestamp
    pub fn with_since_from_cache(mut self, enabled: bool) -> Self {
        self.since_from_cache = enabled;
        self
    }

    /// Restrict fan-out to an explicit relay set
    pub fn with_relays(mut self, relays: Vec<RelayUrl>) -> Self {
        self.relays = Some(relays);
        self
    }

    /// Strip constraints from filters when querying the cache
    pub fn with_cache_unconstrain(mut self, constraints: Vec<FilterConstraint>) -> Self {
        self.cache_unconstrain = constraints;
        self
    }

    /// Assign the subscription id instead of generating one
    pub fn with_subscription_id(mut self, id: impl Into<String>) -> Self {
        self.subscription_id = Some(id.into());
        self
    }
}

/// Items delivered on a subscription's update stream
#[derive(Debug, Clone)]
pub enum SubscriptionUpdate {
    /// An event passed the admission pipeline
    Event(Box<Event>),
    /// An already-admitted id arrived again; trust bookkeeping only
    Duplicate {
        event_id: EventId,
        relay: Option<RelayUrl>,
        first_seen_elapsed: Duration,
    },
    /// Aggregate end-of-stored-events; emitted at most once
    Eose,
    /// The subscription released its relay-side streams and pool hook
    Closed,
}

/// Handle to one logical query
pub struct Subscription {
    id: SubscriptionId,
    updates: flume::Receiver<SubscriptionUpdate>,
    input: flume::Sender<CoordinatorMessage>,
    stop_token: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        updates: flume::Receiver<SubscriptionUpdate>,
        input: flume::Sender<CoordinatorMessage>,
        stop_token: CancellationToken,
    ) -> Self {
        Self {
            id,
            updates,
            input,
            stop_token,
        }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Begin the query: consult the cache and/or fan out to relays according
    /// to the options.
    ///
    /// Returns `Some(events)` only when the cache was waited on and
    /// `emit_cached_events` is false; on every concurrent path cache results
    /// arrive as [`SubscriptionUpdate::Event`]s and this returns `None`.
    /// Events may keep arriving after this returns.
    pub async fn start(&self, emit_cached_events: bool) -> Result<Option<Vec<Event>>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.input
            .send_async(CoordinatorMessage::Start {
                emit_cached_events,
                reply: reply_tx,
            })
            .await
            .map_err(|_| {
                Error::subscription_closed(self.id.to_string(), "coordination task is gone")
            })?;
        reply_rx.await.map_err(|_| {
            Error::subscription_closed(self.id.to_string(), "start reply dropped")
        })?
    }

    /// Release relay-side streams and the pool hook. Idempotent and safe at
    /// any point in the lifecycle; the stop signal is a token, so it cannot
    /// be lost to a full message channel.
    pub fn stop(&self) {
        self.stop_token.cancel();
    }

    /// Next update, or `None` once the stream has closed
    pub async fn recv(&self) -> Option<SubscriptionUpdate> {
        self.updates.recv_async().await.ok()
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&self) -> Option<SubscriptionUpdate> {
        self.updates.try_recv().ok()
    }

    /// A second receiver for the update stream
    pub fn updates(&self) -> flume::Receiver<SubscriptionUpdate> {
        self.updates.clone()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pending_updates", &self.updates.len())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop_token.cancel();
    }
}
