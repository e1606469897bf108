//! Per-subscription coordination task
//!
//! Every subscription runs one task that owns all of its mutable state: the
//! first-seen map, the eosed set, the relay-filter assignment, the newest
//! cached timestamp and the EOSE timer slot. Relay handles and the cache talk
//! to it exclusively through its input channel, so concurrent admission for
//! the same event id can never race past the duplicate check.

use crate::config::EngineConfig;
use crate::relay_handle::{GroupMember, RelayHandle};
use crate::relay_pool::PoolInner;
use crate::subscription::{
    CacheUsage, FilterConstraint, SubscriptionOptions, SubscriptionUpdate,
};
use nostr_sdk::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant as TokioInstant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_futures::Instrument;

/// Messages a coordination task accepts. Everything that mutates
/// subscription state arrives here.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// Begin the query; replies when the start phase has settled
    Start {
        emit_cached_events: bool,
        reply: oneshot::Sender<crate::error::Result<Option<Vec<Event>>>>,
    },
    /// Result of an asynchronous cache query (failures already degraded to empty)
    CacheResult { events: Vec<Event> },
    /// An event pushed by a relay
    RelayEvent {
        relay: Arc<RelayHandle>,
        event: Box<Event>,
    },
    /// A relay finished its stored events
    RelayEose { relay: Arc<RelayHandle> },
    /// A relay connected after fan-out began
    RelayJoined { relay: Arc<RelayHandle> },
}

/// Lifecycle phase, for logging and terminal-state checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Starting,
    WaitingOnCache,
    WaitingOnRelays,
    WaitingOnBoth,
    Eosed,
    Closed,
}

pub(crate) struct CoordinatorContext {
    pub(crate) id: SubscriptionId,
    pub(crate) filters: Vec<Filter>,
    pub(crate) options: SubscriptionOptions,
    pub(crate) pool: Arc<PoolInner>,
    pub(crate) input_tx: flume::Sender<CoordinatorMessage>,
    pub(crate) input_rx: flume::Receiver<CoordinatorMessage>,
    pub(crate) updates_tx: flume::Sender<SubscriptionUpdate>,
    /// Cancelled by the caller's `stop()` (or by dropping the handle);
    /// teardown never competes with events for channel capacity
    pub(crate) stop_token: CancellationToken,
}

/// Spawn the coordination task for one subscription
pub(crate) fn spawn_subscription_task(ctx: CoordinatorContext) {
    let span = tracing::info_span!(parent: None, "subscription_task", subscription_id = %ctx.id);
    let input_rx = ctx.input_rx.clone();
    let coordinator = SubscriptionCoordinator::new(ctx);
    let tracker = coordinator.pool.tracker.clone();
    tracker.spawn(coordinator.run(input_rx).instrument(span));
}

struct SubscriptionCoordinator {
    id: SubscriptionId,
    filters: Vec<Filter>,
    options: SubscriptionOptions,
    pool: Arc<PoolInner>,
    input_tx: flume::Sender<CoordinatorMessage>,
    updates_tx: flume::Sender<SubscriptionUpdate>,
    phase: Phase,
    started: bool,
    /// Filters as actually sent at fan-out, after since-narrowing
    fanout_filters: Vec<Filter>,
    relay_filters: HashMap<RelayUrl, Vec<Filter>>,
    eosed: HashSet<RelayUrl>,
    first_seen: HashMap<EventId, Instant>,
    newest_cache_ts: Option<Timestamp>,
    last_event_at: Option<Instant>,
    eose_emitted: bool,
    eose_deadline: Option<TokioInstant>,
    eose_wait: Duration,
    stop_token: CancellationToken,
    /// Set when the update receiver disappeared; the caller is gone
    updates_gone: bool,
}

impl SubscriptionCoordinator {
    fn new(ctx: CoordinatorContext) -> Self {
        Self {
            id: ctx.id,
            filters: ctx.filters,
            options: ctx.options,
            pool: ctx.pool,
            input_tx: ctx.input_tx,
            updates_tx: ctx.updates_tx,
            phase: Phase::Created,
            started: false,
            fanout_filters: Vec::new(),
            relay_filters: HashMap::new(),
            eosed: HashSet::new(),
            first_seen: HashMap::new(),
            newest_cache_ts: None,
            last_event_at: None,
            eose_emitted: false,
            eose_deadline: None,
            eose_wait: Duration::ZERO,
            stop_token: ctx.stop_token,
            updates_gone: false,
        }
    }

    fn config(&self) -> &EngineConfig {
        &self.pool.config
    }

    async fn run(mut self, input_rx: flume::Receiver<CoordinatorMessage>) {
        let cancellation_token = self.pool.cancellation_token.clone();
        let stop_token = self.stop_token.clone();
        debug!(subscription_id = %self.id, "subscription task started");

        loop {
            let deadline = self
                .eose_deadline
                .unwrap_or_else(|| TokioInstant::now() + Duration::from_secs(86_400));

            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    self.close().await;
                    return;
                }
                _ = stop_token.cancelled() => {
                    self.close().await;
                    return;
                }
                message = input_rx.recv_async() => {
                    match message {
                        Ok(message) => self.handle_message(message).await,
                        Err(_) => {
                            self.close().await;
                            return;
                        }
                    }
                }
                _ = sleep_until(deadline), if self.eose_deadline.is_some() => {
                    self.eose_timer_fired().await;
                }
            }

            if self.updates_gone {
                self.close().await;
            }
            if self.phase == Phase::Closed {
                return;
            }
        }
    }

    async fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::Start {
                emit_cached_events,
                reply,
            } => self.handle_start(emit_cached_events, reply).await,
            CoordinatorMessage::CacheResult { events } => {
                self.handle_cache_result(events).await;
            }
            CoordinatorMessage::RelayEvent { relay, event } => {
                if let Some(admitted) = self.process_event(*event, Some(&relay), false).await {
                    self.send_update(SubscriptionUpdate::Event(Box::new(admitted)))
                        .await;
                }
            }
            CoordinatorMessage::RelayEose { relay } => {
                self.eose_received(relay).await;
            }
            CoordinatorMessage::RelayJoined { relay } => {
                self.relay_joined(relay).await;
            }
        }
    }

    async fn handle_start(
        &mut self,
        emit_cached_events: bool,
        reply: oneshot::Sender<crate::error::Result<Option<Vec<Event>>>>,
    ) {
        if self.started {
            let _ = reply.send(Err(crate::error::Error::internal(
                "subscription already started",
            )));
            return;
        }
        self.started = true;
        self.phase = Phase::Starting;

        let consult_cache = self.options.cache_usage != CacheUsage::OnlyRelay;
        let consult_relays = self.options.cache_usage != CacheUsage::OnlyCache;

        if !consult_relays {
            // Cache-only: answer, signal EOSE, done. The relay set
            // calculator is never consulted on this path.
            self.phase = Phase::WaitingOnCache;
            let events = self.query_cache().await;
            let returned = self.admit_cache_events(events, emit_cached_events).await;
            self.emit_eose().await;
            let _ = reply.send(Ok(returned));
            return;
        }

        if !consult_cache {
            self.fan_out().await;
            self.phase = Phase::WaitingOnRelays;
            let _ = reply.send(Ok(None));
            return;
        }

        // Waiting on the cache is justified only when the subscription will
        // close on EOSE, the cache declares itself fast enough to block on,
        // and the caller did not ask for parallel execution.
        let wait_on_cache = self.options.close_on_eose
            && self.pool.cache.locking()
            && self.options.cache_usage != CacheUsage::Parallel;

        if wait_on_cache {
            self.phase = Phase::WaitingOnCache;
            let events = self.query_cache().await;
            let returned = self.admit_cache_events(events, emit_cached_events).await;
            if self.query_fully_filled() {
                debug!(
                    subscription_id = %self.id,
                    admitted = self.first_seen.len(),
                    "cache fully satisfied the query, skipping relay fan-out"
                );
                self.emit_eose().await;
                let _ = reply.send(Ok(returned));
                return;
            }
            self.fan_out().await;
            self.phase = Phase::WaitingOnRelays;
            let _ = reply.send(Ok(returned));
            return;
        }

        // Concurrent path: cache results stream in as updates
        self.spawn_cache_query();
        self.fan_out().await;
        self.phase = Phase::WaitingOnBoth;
        let _ = reply.send(Ok(None));
    }

    /// Run the cache query inline, degrading failure to an empty result
    async fn query_cache(&self) -> Vec<Event> {
        let filters = strip_constraints(&self.filters, &self.options.cache_unconstrain);
        match self.pool.cache.query(&filters).await {
            Ok(events) => events,
            Err(e) => {
                warn!(
                    subscription_id = %self.id,
                    error = %e,
                    "cache query failed, treating as empty"
                );
                Vec::new()
            }
        }
    }

    /// Queue the cache query off-task; its result comes back as a message
    fn spawn_cache_query(&self) {
        let cache = self.pool.cache.clone();
        let filters = strip_constraints(&self.filters, &self.options.cache_unconstrain);
        let input_tx = self.input_tx.clone();
        let id = self.id.clone();
        self.pool.tracker.spawn(async move {
            let events = match cache.query(&filters).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(
                        subscription_id = %id,
                        error = %e,
                        "cache query failed, treating as empty"
                    );
                    Vec::new()
                }
            };
            let _ = input_tx
                .send_async(CoordinatorMessage::CacheResult { events })
                .await;
        });
    }

    /// Admit cache results during start, either emitting them or collecting
    /// them for the `start()` return value
    async fn admit_cache_events(
        &mut self,
        events: Vec<Event>,
        emit_cached_events: bool,
    ) -> Option<Vec<Event>> {
        let mut returned = if emit_cached_events {
            None
        } else {
            Some(Vec::new())
        };
        for event in events {
            if let Some(admitted) = self.process_event(event, None, true).await {
                match &mut returned {
                    Some(collected) => collected.push(admitted),
                    None => {
                        self.send_update(SubscriptionUpdate::Event(Box::new(admitted)))
                            .await
                    }
                }
            }
        }
        returned
    }

    async fn handle_cache_result(&mut self, events: Vec<Event>) {
        for event in events {
            if let Some(admitted) = self.process_event(event, None, true).await {
                self.send_update(SubscriptionUpdate::Event(Box::new(admitted)))
                    .await;
            }
        }
        if self.phase == Phase::WaitingOnBoth {
            self.phase = Phase::WaitingOnRelays;
        }
    }

    /// The admission pipeline. Applied to every inbound event exactly once
    /// per unique id; returns the event when it should be emitted.
    async fn process_event(
        &mut self,
        event: Event,
        relay: Option<&Arc<RelayHandle>>,
        from_cache: bool,
    ) -> Option<Event> {
        let event_id = event.id;

        // Duplicate path: trust bookkeeping only, never a new result
        if let Some(first_seen) = self.first_seen.get(&event_id) {
            let first_seen_elapsed = first_seen.elapsed();
            self.send_update(SubscriptionUpdate::Duplicate {
                event_id,
                relay: relay.map(|r| r.url().clone()),
                first_seen_elapsed,
            })
            .await;

            if let Some(relay) = relay {
                if let Some(known) = self.pool.signature_cache.recorded_signature(&event_id) {
                    if known == event.sig.to_string() {
                        // Same id, same bytes: extend trust without redoing
                        // the cryptography
                        relay.add_validated_event();
                    } else {
                        error!(
                            subscription_id = %self.id,
                            event_id = %event_id,
                            relay = %relay.url(),
                            "duplicate event carries a different signature for a verified id"
                        );
                        self.pool.reporter.report(&event, relay.url()).await;
                    }
                }
            }
            return None;
        }

        if !self.options.skip_validation && !self.pool.validator.validate(&event) {
            debug!(
                subscription_id = %self.id,
                event_id = %event_id,
                "event failed structural validation, dropped"
            );
            return None;
        }

        // Cache results were verified on their way in; everything else is
        // subject to the relay's sampling policy
        if !from_cache && !self.options.skip_verification {
            if let Some(relay) = relay {
                if relay.should_validate_event() {
                    if self.pool.verifier.verify(&event) {
                        relay.add_validated_event();
                        self.pool.signature_cache.record(&event);
                    } else {
                        self.pool.reporter.report(&event, relay.url()).await;
                        return None;
                    }
                } else {
                    relay.add_non_validated_event();
                }
            }
        }

        if !from_cache && !self.options.skip_cache_write && !event.kind.is_ephemeral() {
            let cache = self.pool.cache.clone();
            let filters = self.filters.clone();
            let relay_url = relay.map(|r| r.url().clone());
            let stored = event.clone();
            self.pool.tracker.spawn(async move {
                if let Err(e) = cache.store(&stored, &filters, relay_url.as_ref()).await {
                    debug!(error = %e, "cache write-through failed");
                }
            });
        }

        self.first_seen.insert(event_id, Instant::now());
        if from_cache {
            self.newest_cache_ts = match self.newest_cache_ts {
                Some(current) if current >= event.created_at => Some(current),
                _ => Some(event.created_at),
            };
        }
        self.last_event_at = Some(Instant::now());
        Some(event)
    }

    /// Ask the calculator for the relay assignment and start every stream
    async fn fan_out(&mut self) {
        self.fanout_filters = narrow_since(&self.filters, self.narrowing_timestamp());

        let candidates = self.candidate_relays();
        let assignment = self
            .pool
            .calculator
            .calculate(&self.fanout_filters, &candidates);

        for (url, filters) in assignment {
            let Some(handle) = self.pool.relay(&url) else {
                continue;
            };
            let member = GroupMember::new(self.id.clone(), self.input_tx.clone());
            handle.subscribe(member, filters.clone(), self.options.groupable_delay);
            self.relay_filters.insert(url, filters);
        }

        // Relays that connect from here on are offered to this subscription
        self.pool.watch(self.id.clone(), self.input_tx.clone());

        info!(
            subscription_id = %self.id,
            relays = self.relay_filters.len(),
            "fan-out complete"
        );
    }

    fn narrowing_timestamp(&self) -> Option<Timestamp> {
        if !self.options.since_from_cache {
            return None;
        }
        self.newest_cache_ts
            .map(|ts| Timestamp::from(ts.as_u64() + 1))
    }

    fn candidate_relays(&self) -> Vec<Arc<RelayHandle>> {
        match &self.options.relays {
            Some(urls) => urls
                .iter()
                .filter_map(|url| self.pool.relay(url))
                .collect(),
            None => self.pool.all_relays(),
        }
    }

    /// A relay connected after fan-out; re-run the assignment for it
    async fn relay_joined(&mut self, relay: Arc<RelayHandle>) {
        if self.phase != Phase::WaitingOnRelays
            && self.phase != Phase::WaitingOnBoth
            && self.phase != Phase::Eosed
        {
            return;
        }
        if self.eose_emitted && self.options.close_on_eose {
            return;
        }
        if self.relay_filters.contains_key(relay.url()) {
            return;
        }

        let candidates = self.candidate_relays();
        let assignment = self
            .pool
            .calculator
            .calculate(&self.fanout_filters, &candidates);
        let Some(filters) = assignment.get(relay.url()) else {
            return;
        };

        debug!(
            subscription_id = %self.id,
            relay = %relay.url(),
            "late-joining relay added to subscription"
        );
        let member = GroupMember::new(self.id.clone(), self.input_tx.clone());
        relay.subscribe(member, filters.clone(), self.options.groupable_delay);
        self.relay_filters.insert(relay.url().clone(), filters.clone());
    }

    /// EOSE aggregation: decide whether this relay's notice finishes the
    /// query, arms the decaying timer, or stalls
    async fn eose_received(&mut self, relay: Arc<RelayHandle>) {
        if self.eose_emitted {
            return;
        }
        let url = relay.url().clone();
        if !self.relay_filters.contains_key(&url) {
            debug!(
                subscription_id = %self.id,
                relay = %url,
                "EOSE from unassigned relay ignored"
            );
            return;
        }
        self.eosed.insert(url);

        let all_eosed = self.eosed.len() >= self.relay_filters.len();
        if self.query_fully_filled() || all_eosed {
            self.emit_eose().await;
            return;
        }

        let connected: Vec<&RelayUrl> = self
            .relay_filters
            .keys()
            .filter(|url| {
                self.pool
                    .relay(url)
                    .map(|handle| handle.is_connected())
                    .unwrap_or(false)
            })
            .collect();
        if connected.is_empty() {
            // Nothing to wait against; stall until a connection or stop()
            debug!(
                subscription_id = %self.id,
                "no assigned relay connected, EOSE aggregation stalled"
            );
            self.eose_deadline = None;
            return;
        }

        let eosed_connected = connected
            .iter()
            .filter(|url| self.eosed.contains(**url))
            .count();
        let fraction = eosed_connected as f64 / connected.len() as f64;

        if self.eosed.len() >= self.config().eose_min_eosed
            && fraction >= self.config().eose_fraction_threshold
        {
            let wait = self.config().eose_wait_base.mul_f64((1.0 - fraction).max(0.0));
            if wait.is_zero() {
                self.emit_eose().await;
            } else {
                // Single timer slot: a newer EOSE replaces any armed wait
                self.eose_wait = wait;
                self.eose_deadline = Some(TokioInstant::now() + wait);
                debug!(
                    subscription_id = %self.id,
                    wait_ms = wait.as_millis() as u64,
                    fraction,
                    "EOSE wait armed"
                );
            }
        }
    }

    async fn eose_timer_fired(&mut self) {
        self.eose_deadline = None;
        if let Some(last) = self.last_event_at {
            if last.elapsed() <= self.config().active_flow_window {
                // Events are still actively flowing; give them the same
                // window again
                self.eose_deadline = Some(TokioInstant::now() + self.eose_wait);
                return;
            }
        }
        self.emit_eose().await;
    }

    /// Every filter carries a limit and the distinct admitted events already
    /// meet or exceed their sum
    fn query_fully_filled(&self) -> bool {
        query_fully_filled(&self.filters, self.first_seen.len())
    }

    /// Emit the aggregate EOSE. A second call is a no-op.
    async fn emit_eose(&mut self) {
        if self.eose_emitted {
            return;
        }
        self.eose_emitted = true;
        self.eose_deadline = None;
        self.phase = Phase::Eosed;
        info!(
            subscription_id = %self.id,
            admitted = self.first_seen.len(),
            eosed_relays = self.eosed.len(),
            "aggregate EOSE"
        );
        self.send_update(SubscriptionUpdate::Eose).await;
        if self.options.close_on_eose {
            self.close().await;
        }
    }

    /// Tear down: deregister the pool hook, end every relay-side stream,
    /// emit `Closed`. Idempotent, safe at any lifecycle point.
    async fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        self.phase = Phase::Closed;
        self.eose_deadline = None;

        self.pool.unwatch(&self.id);
        for url in self.relay_filters.keys() {
            if let Some(handle) = self.pool.relay(url) {
                handle.unsubscribe(&self.id);
            }
        }

        let _ = self
            .updates_tx
            .send_async(SubscriptionUpdate::Closed)
            .await;
        info!(subscription_id = %self.id, "subscription closed");
    }

    async fn send_update(&mut self, update: SubscriptionUpdate) {
        if self.updates_tx.send_async(update).await.is_err() {
            self.updates_gone = true;
        }
    }
}

/// Strip the given constraints from every filter (used for cache queries)
fn strip_constraints(filters: &[Filter], constraints: &[FilterConstraint]) -> Vec<Filter> {
    let mut filters = filters.to_vec();
    for filter in &mut filters {
        for constraint in constraints {
            match constraint {
                FilterConstraint::Since => filter.since = None,
                FilterConstraint::Until => filter.until = None,
                FilterConstraint::Limit => filter.limit = None,
            }
        }
    }
    filters
}

/// Narrow filters with a `since` floor, keeping any stricter existing value
fn narrow_since(filters: &[Filter], since: Option<Timestamp>) -> Vec<Filter> {
    let mut filters = filters.to_vec();
    if let Some(since) = since {
        for filter in &mut filters {
            filter.since = Some(match filter.since {
                Some(existing) if existing > since => existing,
                _ => since,
            });
        }
    }
    filters
}

/// True when every filter carries a limit and `admitted` distinct events
/// meet or exceed their sum
fn query_fully_filled(filters: &[Filter], admitted: usize) -> bool {
    let mut total = 0usize;
    for filter in filters {
        match filter.limit {
            Some(limit) => total = total.saturating_add(limit),
            None => return false,
        }
    }
    admitted >= total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_fully_filled_requires_limits_on_every_filter() {
        let limited = vec![
            Filter::new().kind(Kind::TextNote).limit(2),
            Filter::new().kind(Kind::Metadata).limit(1),
        ];
        assert!(!query_fully_filled(&limited, 2));
        assert!(query_fully_filled(&limited, 3));
        assert!(query_fully_filled(&limited, 10));

        let unlimited = vec![
            Filter::new().kind(Kind::TextNote).limit(2),
            Filter::new().kind(Kind::Metadata),
        ];
        assert!(
            !query_fully_filled(&unlimited, 100),
            "a filter without a limit can always produce more results"
        );
    }

    #[test]
    fn test_strip_constraints_removes_named_keys_only() {
        let filters = vec![Filter::new()
            .kind(Kind::TextNote)
            .since(Timestamp::from(10))
            .until(Timestamp::from(20))
            .limit(5)];

        let stripped = strip_constraints(
            &filters,
            &[FilterConstraint::Since, FilterConstraint::Limit],
        );
        assert!(stripped[0].since.is_none());
        assert!(stripped[0].limit.is_none());
        assert_eq!(stripped[0].until, Some(Timestamp::from(20)));

        let untouched = strip_constraints(&filters, &[]);
        assert_eq!(untouched[0].since, Some(Timestamp::from(10)));
    }

    #[test]
    fn test_narrow_since_keeps_stricter_existing_value() {
        let filters = vec![
            Filter::new().kind(Kind::TextNote),
            Filter::new().kind(Kind::Metadata).since(Timestamp::from(500)),
            Filter::new().kind(Kind::ContactList).since(Timestamp::from(5)),
        ];

        let narrowed = narrow_since(&filters, Some(Timestamp::from(100)));
        assert_eq!(narrowed[0].since, Some(Timestamp::from(100)));
        assert_eq!(
            narrowed[1].since,
            Some(Timestamp::from(500)),
            "an already stricter since must survive"
        );
        assert_eq!(narrowed[2].since, Some(Timestamp::from(100)));

        let untouched = narrow_since(&filters, None);
        assert!(untouched[0].since.is_none());
    }
}
