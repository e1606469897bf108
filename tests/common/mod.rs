//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subscription_engine::{
    CacheAdapter, CacheError, ConnectedRelaySet, EventValidator, InvalidSignatureReporter,
    RelayHandle, RelayPool, RelaySetCalculator, RelayStatus, RelayTransport, Subscription,
    SubscriptionUpdate, TransportError,
};

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn create_test_keys() -> Keys {
    Keys::generate()
}

pub fn create_test_event(keys: &Keys, kind: Kind, tags: Vec<Tag>) -> Event {
    create_test_event_at(keys, kind, tags, Timestamp::now().as_u64())
}

/// Signed event with a fixed timestamp; the content carries a sequence
/// number so identical arguments still produce distinct ids
pub fn create_test_event_at(keys: &Keys, kind: Kind, tags: Vec<Tag>, created_at: u64) -> Event {
    let seq = EVENT_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut unsigned = UnsignedEvent::new(
        keys.public_key(),
        Timestamp::from(created_at),
        kind,
        tags,
        format!("test event {seq}"),
    );
    unsigned.ensure_id();
    unsigned.sign_with_keys(keys).unwrap()
}

/// Same id, fresh signature bytes
pub fn resign_event(event: &Event, keys: &Keys) -> Event {
    let tags: Vec<Tag> = event.tags.iter().cloned().collect();
    let mut unsigned = UnsignedEvent::new(
        event.pubkey,
        event.created_at,
        event.kind,
        tags,
        event.content.clone(),
    );
    unsigned.ensure_id();
    unsigned.sign_with_keys(keys).unwrap()
}

pub fn relay_url(s: &str) -> RelayUrl {
    RelayUrl::parse(s).expect("valid relay url")
}

/// Add a relay to the pool and mark it connected
pub fn connect_relay(pool: &RelayPool, url: &str) -> RelayUrl {
    let url = relay_url(url);
    pool.add_relay(url.clone());
    pool.set_relay_status(&url, RelayStatus::Connected);
    url
}

/// Next update or panic; every wait in these tests is bounded
pub async fn recv_update(subscription: &Subscription) -> SubscriptionUpdate {
    tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("timed out waiting for a subscription update")
        .expect("update stream ended unexpectedly")
}

/// Assert that no update arrives within the window
pub async fn assert_no_update_for(subscription: &Subscription, window: Duration) {
    if let Ok(Some(update)) = tokio::time::timeout(window, subscription.recv()).await {
        panic!("expected silence, got {update:?}");
    }
}

/// Transport that records frames instead of sending them
#[derive(Debug, Default)]
pub struct RecordingTransport {
    reqs: Mutex<Vec<(RelayUrl, SubscriptionId, Vec<Filter>)>>,
    closes: Mutex<Vec<(RelayUrl, SubscriptionId)>>,
}

impl RecordingTransport {
    pub fn req_count(&self) -> usize {
        self.reqs.lock().len()
    }

    pub fn close_count(&self) -> usize {
        self.closes.lock().len()
    }

    pub fn reqs(&self) -> Vec<(RelayUrl, SubscriptionId, Vec<Filter>)> {
        self.reqs.lock().clone()
    }

    /// The first REQ recorded for `relay`
    pub fn relay_req(&self, relay: &RelayUrl) -> (SubscriptionId, Vec<Filter>) {
        self.reqs
            .lock()
            .iter()
            .find(|(url, _, _)| url == relay)
            .map(|(_, id, filters)| (id.clone(), filters.clone()))
            .unwrap_or_else(|| panic!("no REQ recorded for {relay}"))
    }

    pub async fn wait_for_reqs(&self, count: usize) {
        for _ in 0..400 {
            if self.req_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "timed out waiting for {count} REQs, saw {}",
            self.req_count()
        );
    }

    pub async fn wait_for_closes(&self, count: usize) {
        for _ in 0..400 {
            if self.close_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "timed out waiting for {count} CLOSEs, saw {}",
            self.close_count()
        );
    }
}

#[async_trait]
impl RelayTransport for RecordingTransport {
    async fn send_req(
        &self,
        relay: &RelayUrl,
        subscription_id: &SubscriptionId,
        filters: &[Filter],
    ) -> Result<(), TransportError> {
        self.reqs
            .lock()
            .push((relay.clone(), subscription_id.clone(), filters.to_vec()));
        Ok(())
    }

    async fn send_close(
        &self,
        relay: &RelayUrl,
        subscription_id: &SubscriptionId,
    ) -> Result<(), TransportError> {
        self.closes
            .lock()
            .push((relay.clone(), subscription_id.clone()));
        Ok(())
    }
}

/// Relay-set calculator that counts invocations and otherwise behaves like
/// the default
#[derive(Debug, Default)]
pub struct CountingCalculator {
    calls: AtomicUsize,
}

impl CountingCalculator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RelaySetCalculator for CountingCalculator {
    fn calculate(
        &self,
        filters: &[Filter],
        relays: &[Arc<RelayHandle>],
    ) -> HashMap<RelayUrl, Vec<Filter>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ConnectedRelaySet.calculate(filters, relays)
    }
}

/// Cache that fails every operation but still claims to be fast
#[derive(Debug, Default)]
pub struct FailingCache;

#[async_trait]
impl CacheAdapter for FailingCache {
    async fn query(&self, _filters: &[Filter]) -> Result<Vec<Event>, CacheError> {
        Err(CacheError::Query("backend unavailable".to_string()))
    }

    async fn store(
        &self,
        _event: &Event,
        _filters: &[Filter],
        _relay: Option<&RelayUrl>,
    ) -> Result<(), CacheError> {
        Err(CacheError::Store("backend unavailable".to_string()))
    }

    fn locking(&self) -> bool {
        true
    }
}

/// Locking cache whose queries take `delay` before answering
#[derive(Debug)]
pub struct SlowCache {
    pub delay: Duration,
    pub events: Vec<Event>,
}

#[async_trait]
impl CacheAdapter for SlowCache {
    async fn query(&self, _filters: &[Filter]) -> Result<Vec<Event>, CacheError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.events.clone())
    }

    fn locking(&self) -> bool {
        true
    }
}

/// Locking cache that records the filters of every query it serves
#[derive(Debug, Default)]
pub struct RecordingCache {
    queries: Mutex<Vec<Vec<Filter>>>,
    events: Mutex<Vec<Event>>,
}

impl RecordingCache {
    pub fn with_events(events: Vec<Event>) -> Self {
        Self {
            queries: Mutex::new(Vec::new()),
            events: Mutex::new(events),
        }
    }

    pub fn queries(&self) -> Vec<Vec<Filter>> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl CacheAdapter for RecordingCache {
    async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>, CacheError> {
        self.queries.lock().push(filters.to_vec());
        Ok(self.events.lock().clone())
    }

    fn locking(&self) -> bool {
        true
    }
}

/// Validator that treats every event of one kind as malformed
#[derive(Debug)]
pub struct KindRejectingValidator {
    pub rejected: Kind,
}

impl EventValidator for KindRejectingValidator {
    fn validate(&self, event: &Event) -> bool {
        event.kind != self.rejected
    }
}

/// Reporter that captures invalid-signature reports for assertions
#[derive(Debug, Default)]
pub struct CapturingReporter {
    reports: Mutex<Vec<(EventId, RelayUrl)>>,
}

impl CapturingReporter {
    pub fn reports(&self) -> Vec<(EventId, RelayUrl)> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl InvalidSignatureReporter for CapturingReporter {
    async fn report(&self, event: &Event, relay: &RelayUrl) {
        self.reports.lock().push((event.id, relay.clone()));
    }
}
