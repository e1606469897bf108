//! Relay assignment capability
//!
//! Which relay answers which filter is an external policy (outbox-style
//! discovery lives outside this crate). The engine consults the calculator at
//! fan-out time and again for every relay that joins the pool afterwards.

use crate::relay_handle::RelayHandle;
use nostr_sdk::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

/// Pure function from filters plus the known relay pool to a relay→filters
/// assignment for one subscription.
pub trait RelaySetCalculator: Send + Sync + std::fmt::Debug + 'static {
    fn calculate(
        &self,
        filters: &[Filter],
        relays: &[Arc<RelayHandle>],
    ) -> HashMap<RelayUrl, Vec<Filter>>;
}

/// Default assignment: every currently connected relay receives the full
/// filter list.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectedRelaySet;

impl RelaySetCalculator for ConnectedRelaySet {
    fn calculate(
        &self,
        filters: &[Filter],
        relays: &[Arc<RelayHandle>],
    ) -> HashMap<RelayUrl, Vec<Filter>> {
        relays
            .iter()
            .filter(|relay| relay.is_connected())
            .map(|relay| (relay.url().clone(), filters.to_vec()))
            .collect()
    }
}
