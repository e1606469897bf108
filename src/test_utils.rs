//! Shared helpers for unit tests

use crate::config::EngineConfig;
use crate::relay_handle::{RelayHandle, RelayTransport, TransportError};
use async_trait::async_trait;
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn create_test_keys() -> Keys {
    Keys::generate()
}

pub fn create_test_event(keys: &Keys, kind: Kind, tags: Vec<Tag>) -> Event {
    create_test_event_at(keys, kind, tags, Timestamp::now().as_u64())
}

/// Build a signed event with a fixed timestamp. The content carries a
/// sequence number so repeated calls with identical arguments still produce
/// distinct ids.
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

/// Re-sign an event with the same keys: identical id, fresh signature bytes
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

/// Everything the engine pushed toward the wire
#[derive(Debug, Clone, PartialEq)]
pub enum TransportFrame {
    Req {
        relay: RelayUrl,
        subscription_id: SubscriptionId,
        filters: Vec<Filter>,
    },
    Close {
        relay: RelayUrl,
        subscription_id: SubscriptionId,
    },
}

/// Transport that records frames instead of sending them
#[derive(Debug, Default)]
pub struct MockTransport {
    frames: Mutex<Vec<TransportFrame>>,
}

impl MockTransport {
    pub fn frames(&self) -> Vec<TransportFrame> {
        self.frames.lock().clone()
    }

    pub fn req_count(&self) -> usize {
        self.frames
            .lock()
            .iter()
            .filter(|frame| matches!(frame, TransportFrame::Req { .. }))
            .count()
    }

    pub fn close_count(&self) -> usize {
        self.frames
            .lock()
            .iter()
            .filter(|frame| matches!(frame, TransportFrame::Close { .. }))
            .count()
    }
}

#[async_trait]
impl RelayTransport for MockTransport {
    async fn send_req(
        &self,
        relay: &RelayUrl,
        subscription_id: &SubscriptionId,
        filters: &[Filter],
    ) -> Result<(), TransportError> {
        self.frames.lock().push(TransportFrame::Req {
            relay: relay.clone(),
            subscription_id: subscription_id.clone(),
            filters: filters.to_vec(),
        });
        Ok(())
    }

    async fn send_close(
        &self,
        relay: &RelayUrl,
        subscription_id: &SubscriptionId,
    ) -> Result<(), TransportError> {
        self.frames.lock().push(TransportFrame::Close {
            relay: relay.clone(),
            subscription_id: subscription_id.clone(),
        });
        Ok(())
    }
}

pub fn create_test_relay(url: &str) -> Arc<RelayHandle> {
    let url = RelayUrl::parse(url).unwrap();
    Arc::new(RelayHandle::new(
        url,
        Arc::new(MockTransport::default()),
        &EngineConfig::default().with_rng_seed(42),
        TaskTracker::new(),
        CancellationToken::new(),
    ))
}
