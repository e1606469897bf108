//! Structural and cryptographic validation seams
//!
//! The engine never hard-codes what a well-formed event looks like or how a
//! signature is checked; both are capability traits with default
//! implementations. The verified-signature cache backs the duplicate path:
//! once an id's signature has been cryptographically verified, later copies
//! are judged by byte equality against the recorded signature.

use async_trait::async_trait;
use dashmap::DashMap;
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::error;

/// Minimal per-kind structural check, applied before any cryptography
pub trait EventValidator: Send + Sync + std::fmt::Debug + 'static {
    /// Returns false to drop the event silently
    fn validate(&self, event: &Event) -> bool;
}

/// Default validator: shape rules are an external concern, accept everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllValidator;

impl EventValidator for AcceptAllValidator {
    fn validate(&self, event: &Event) -> bool {
        let _ = event;
        true
    }
}

/// Cryptographic signature check
pub trait SignatureVerifier: Send + Sync + std::fmt::Debug + 'static {
    fn verify(&self, event: &Event) -> bool;
}

/// Default verifier: id recomputation plus schnorr verification
#[derive(Debug, Clone, Copy, Default)]
pub struct NostrSignatureVerifier;

impl SignatureVerifier for NostrSignatureVerifier {
    fn verify(&self, event: &Event) -> bool {
        event.verify().is_ok()
    }
}

/// Connection-level policy invoked when a relay sends a provably bad signature
/// or claims a different signature for an already-verified id. The
/// subscription keeps running either way.
#[async_trait]
pub trait InvalidSignatureReporter: Send + Sync + std::fmt::Debug + 'static {
    async fn report(&self, event: &Event, relay: &RelayUrl);
}

/// Default reporter: log and move on
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

#[async_trait]
impl InvalidSignatureReporter for LogReporter {
    async fn report(&self, event: &Event, relay: &RelayUrl) {
        error!(
            event_id = %event.id,
            relay = %relay,
            "relay delivered an invalid signature"
        );
    }
}

/// Bounded map of event ids to the signature that was cryptographically
/// verified for them this session. Eviction is oldest-first.
pub struct SignatureCache {
    capacity: usize,
    signatures: DashMap<EventId, String>,
    order: Mutex<VecDeque<EventId>>,
}

impl SignatureCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            signatures: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
        }
    }

    /// Remember the verified signature for an event id
    pub fn record(&self, event: &Event) {
        let mut order = self.order.lock();
        if self.signatures.contains_key(&event.id) {
            return;
        }
        self.signatures.insert(event.id, event.sig.to_string());
        order.push_back(event.id);
        while order.len() > self.capacity {
            if let Some(evicted) = order.pop_front() {
                self.signatures.remove(&evicted);
            }
        }
    }

    /// The signature verified for this id earlier in the session, if any
    pub fn recorded_signature(&self, id: &EventId) -> Option<String> {
        self.signatures.get(id).map(|sig| sig.clone())
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

impl std::fmt::Debug for SignatureCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
