//! Relay pool: the engine's public entry point
//!
//! A `RelayPool` owns the relay handles, the collaborator set (cache,
//! relay-set calculator, validator, verifier, reporter) and the shared
//! signature cache. Subscriptions are spawned from here; each one runs its
//! own coordination task and the pool only keeps a sender to it for
//! late-joining relay notifications.

use crate::cache_adapter::{CacheAdapter, NoopCache};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::relay_handle::{RelayHandle, RelayStatus, RelayTransport};
use crate::relay_set::{ConnectedRelaySet, RelaySetCalculator};
use crate::subscription::{Subscription, SubscriptionOptions};
use crate::subscription_coordinator::{
    spawn_subscription_task, CoordinatorContext, CoordinatorMessage,
};
use crate::validation::{
    AcceptAllValidator, EventValidator, InvalidSignatureReporter, LogReporter,
    NostrSignatureVerifier, SignatureCache, SignatureVerifier,
};
use dashmap::DashMap;
use nostr_sdk::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// State shared between the pool handle and every coordination task
pub(crate) struct PoolInner {
    pub(crate) config: EngineConfig,
    pub(crate) cache: Arc<dyn CacheAdapter>,
    pub(crate) calculator: Arc<dyn RelaySetCalculator>,
    pub(crate) validator: Arc<dyn EventValidator>,
    pub(crate) verifier: Arc<dyn SignatureVerifier>,
    pub(crate) reporter: Arc<dyn InvalidSignatureReporter>,
    pub(crate) signature_cache: SignatureCache,
    pub(crate) tracker: TaskTracker,
    pub(crate) cancellation_token: CancellationToken,
    transport: Arc<dyn RelayTransport>,
    relays: DashMap<RelayUrl, Arc<RelayHandle>>,
    /// Live subscriptions interested in relays that connect later
    watchers: DashMap<SubscriptionId, flume::Sender<CoordinatorMessage>>,
}

impl PoolInner {
    pub(crate) fn relay(&self, url: &RelayUrl) -> Option<Arc<RelayHandle>> {
        self.relays.get(url).map(|entry| entry.clone())
    }

    pub(crate) fn all_relays(&self) -> Vec<Arc<RelayHandle>> {
        self.relays.iter().map(|entry| entry.clone()).collect()
    }

    pub(crate) fn watch(
        &self,
        subscription_id: SubscriptionId,
        sender: flume::Sender<CoordinatorMessage>,
    ) {
        self.watchers.insert(subscription_id, sender);
    }

    pub(crate) fn unwatch(&self, subscription_id: &SubscriptionId) {
        self.watchers.remove(subscription_id);
    }
}

impl std::fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolInner")
            .field("relays", &self.relays.len())
            .field("watchers", &self.watchers.len())
            .finish()
    }
}

/// Builder for [`RelayPool`]; collaborators not supplied fall back to the
/// built-in defaults
pub struct RelayPoolBuilder {
    config: EngineConfig,
    transport: Arc<dyn RelayTransport>,
    cache: Arc<dyn CacheAdapter>,
    calculator: Arc<dyn RelaySetCalculator>,
    validator: Arc<dyn EventValidator>,
    verifier: Arc<dyn SignatureVerifier>,
    reporter: Arc<dyn InvalidSignatureReporter>,
}

impl RelayPoolBuilder {
    pub fn new(transport: Arc<dyn RelayTransport>) -> Self {
        Self {
            config: EngineConfig::default(),
            transport,
            cache: Arc::new(NoopCache),
            calculator: Arc::new(ConnectedRelaySet),
            validator: Arc::new(AcceptAllValidator),
            verifier: Arc::new(NostrSignatureVerifier),
            reporter: Arc::new(LogReporter),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheAdapter>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_relay_set_calculator(mut self, calculator: Arc<dyn RelaySetCalculator>) -> Self {
        self.calculator = calculator;
        self
    }

    pub fn with_event_validator(mut self, validator: Arc<dyn EventValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_signature_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_invalid_signature_reporter(
        mut self,
        reporter: Arc<dyn InvalidSignatureReporter>,
    ) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn build(self) -> RelayPool {
        let signature_cache = SignatureCache::new(self.config.signature_cache_size);
        RelayPool {
            inner: Arc::new(PoolInner {
                config: self.config,
                cache: self.cache,
                calculator: self.calculator,
                validator: self.validator,
                verifier: self.verifier,
                reporter: self.reporter,
                signature_cache,
                tracker: TaskTracker::new(),
                cancellation_token: CancellationToken::new(),
                transport: self.transport,
                relays: DashMap::new(),
                watchers: DashMap::new(),
            }),
        }
    }
}

impl std::fmt::Debug for RelayPoolBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPoolBuilder")
            .field("config", &self.config)
            .finish()
    }
}

/// A pool of relays plus the subscription machinery over them. Cheap to
/// clone; clones share all state.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl RelayPool {
    pub fn builder(transport: Arc<dyn RelayTransport>) -> RelayPoolBuilder {
        RelayPoolBuilder::new(transport)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Register a relay. Returns the existing handle when the url is
    /// already known.
    pub fn add_relay(&self, url: RelayUrl) -> Arc<RelayHandle> {
        self.inner
            .relays
            .entry(url.clone())
            .or_insert_with(|| {
                info!(relay = %url, "relay added to pool");
                Arc::new(RelayHandle::new(
                    url,
                    self.inner.transport.clone(),
                    &self.inner.config,
                    self.inner.tracker.clone(),
                    self.inner.cancellation_token.clone(),
                ))
            })
            .clone()
    }

    /// Drop a relay from the pool. Live subscriptions simply stop counting
    /// it; their relay-side streams die with the connection.
    pub fn remove_relay(&self, url: &RelayUrl) {
        if let Some((_, handle)) = self.inner.relays.remove(url) {
            handle.set_status(RelayStatus::Terminated);
            info!(relay = %url, "relay removed from pool");
        }
    }

    pub fn relay(&self, url: &RelayUrl) -> Option<Arc<RelayHandle>> {
        self.inner.relay(url)
    }

    pub fn relays(&self) -> Vec<Arc<RelayHandle>> {
        self.inner.all_relays()
    }

    pub fn connected_relays(&self) -> Vec<Arc<RelayHandle>> {
        self.inner
            .all_relays()
            .into_iter()
            .filter(|relay| relay.is_connected())
            .collect()
    }

    /// Record a status change reported by the transport. A transition to
    /// `Connected` is offered to every live subscription so it can extend
    /// its fan-out.
    pub fn set_relay_status(&self, url: &RelayUrl, status: RelayStatus) {
        let Some(handle) = self.inner.relay(url) else {
            debug!(relay = %url, "status change for unknown relay ignored");
            return;
        };
        let was_connected = handle.is_connected();
        handle.set_status(status);

        if status == RelayStatus::Connected && !was_connected {
            for entry in self.inner.watchers.iter() {
                let message = CoordinatorMessage::RelayJoined {
                    relay: handle.clone(),
                };
                if entry.value().try_send(message).is_err() {
                    debug!(
                        subscription_id = %entry.key(),
                        "relay-joined notification dropped"
                    );
                }
            }
        }
    }

    /// Ingress hook for the transport: an event arrived on `relay_sub_id`
    pub async fn dispatch_event(
        &self,
        url: &RelayUrl,
        relay_sub_id: &SubscriptionId,
        event: Event,
    ) {
        let Some(handle) = self.inner.relay(url) else {
            debug!(relay = %url, "event from unknown relay dropped");
            return;
        };
        handle.dispatch_event(relay_sub_id, event).await;
    }

    /// Ingress hook for the transport: EOSE arrived on `relay_sub_id`
    pub async fn dispatch_eose(&self, url: &RelayUrl, relay_sub_id: &SubscriptionId) {
        let Some(handle) = self.inner.relay(url) else {
            debug!(relay = %url, "EOSE from unknown relay dropped");
            return;
        };
        handle.dispatch_eose(relay_sub_id).await;
    }

    /// Create a subscription over `filters`. The returned handle is inert
    /// until [`Subscription::start`] is called.
    pub fn subscribe(
        &self,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        if filters.is_empty() {
            return Err(Error::internal("cannot subscribe with no filters"));
        }
        if self.inner.cancellation_token.is_cancelled() {
            return Err(Error::shutdown());
        }

        let id = match &options.subscription_id {
            Some(id) => SubscriptionId::new(id.clone()),
            None => SubscriptionId::generate(),
        };
        let (input_tx, input_rx) = flume::bounded(self.inner.config.subscription_channel_size);
        let (updates_tx, updates_rx) = flume::bounded(self.inner.config.update_channel_size);
        let stop_token = CancellationToken::new();

        spawn_subscription_task(CoordinatorContext {
            id: id.clone(),
            filters,
            options,
            pool: self.inner.clone(),
            input_tx: input_tx.clone(),
            input_rx,
            updates_tx,
            stop_token: stop_token.clone(),
        });

        Ok(Subscription::new(id, updates_rx, input_tx, stop_token))
    }

    /// Stop every subscription task and wait for them to finish
    pub async fn shutdown(&self) {
        info!("relay pool shutting down");
        self.inner.cancellation_token.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("inner", &self.inner)
            .finish()
    }
}
