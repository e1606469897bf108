//! A client-side subscription engine for Nostr
//!
//! This crate coordinates subscriptions across many relays and a local
//! cache:
//! - Lifecycle management from REQ fan-out to aggregate EOSE
//! - Cache-aware start strategies via the `CacheUsage` policy
//! - Cross-relay deduplication with replaceable-event merge semantics
//! - Sampled signature verification with per-relay trust tracking
//! - Pluggable transport, cache, and relay-selection collaborators
#![allow(clippy::manual_async_fn)]
// Performance-focused clippy lints
#![warn(
    clippy::perf,
    clippy::redundant_clone,
    clippy::needless_pass_by_value,
    clippy::inefficient_to_string,
    clippy::clone_on_copy
)]

pub mod cache_adapter;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fetch;
pub mod relay_handle;
pub mod relay_pool;
pub mod relay_set;
pub mod sampler;
pub mod subscription;
pub mod subscription_coordinator;
#[cfg(test)]
pub mod test_utils;
pub mod validation;

pub use cache_adapter::{CacheAdapter, CacheError, MemoryCache, NoopCache};
pub use config::EngineConfig;
pub use dedup::DedupKey;
pub use error::{Error, Result};
pub use relay_handle::{RelayHandle, RelayStatus, RelayTransport, TransportError};
pub use relay_pool::{RelayPool, RelayPoolBuilder};
pub use relay_set::{ConnectedRelaySet, RelaySetCalculator};
pub use sampler::ValidationSampler;
pub use subscription::{
    CacheUsage, FilterConstraint, Subscription, SubscriptionOptions, SubscriptionUpdate,
};
pub use subscription_coordinator::CoordinatorMessage;
pub use validation::{
    AcceptAllValidator, EventValidator, InvalidSignatureReporter, LogReporter,
    NostrSignatureVerifier, SignatureCache, SignatureVerifier,
};
