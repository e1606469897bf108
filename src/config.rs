//! Configuration options for the subscription engine

use std::sync::Arc;
use std::time::Duration;

/// Pluggable target-ratio function for signature-verification sampling.
///
/// Receives the relay's cumulative validated and non-validated event counts
/// and returns the probability (in `[0, 1]`) that the next event from that
/// relay must be cryptographically verified.
pub type ValidationRatioFn = dyn Fn(u64, u64) -> f64 + Send + Sync;

/// Main configuration for the engine
#[derive(Clone)]
pub struct EngineConfig {
    /// Verification probability applied to a relay before any events validated
    pub initial_validation_ratio: f64,
    /// Floor the verification probability decays toward, never crossed
    pub lowest_validation_ratio: f64,
    /// Custom ratio function; `None` selects the built-in decay curve
    pub validation_ratio_fn: Option<Arc<ValidationRatioFn>>,
    /// Hard upper bound for one-shot fetch operations
    pub fetch_timeout: Duration,
    /// Base wait window for the decaying EOSE timer
    pub eose_wait_base: Duration,
    /// Minimum number of relays that must EOSE before the decaying timer arms
    pub eose_min_eosed: usize,
    /// Fraction of connected relays that must EOSE before the decaying timer arms
    pub eose_fraction_threshold: f64,
    /// An event admitted within this window keeps the EOSE timer re-arming
    pub active_flow_window: Duration,
    /// Capacity of each subscription's coordinator input channel
    pub subscription_channel_size: usize,
    /// Capacity of each subscription's outbound update channel
    pub update_channel_size: usize,
    /// Maximum number of verified signatures remembered for duplicate checks
    pub signature_cache_size: usize,
    /// Seed for sampler RNGs; `None` seeds from entropy
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_validation_ratio: 1.0,
            lowest_validation_ratio: 0.1,
            validation_ratio_fn: None,
            fetch_timeout: Duration::from_secs(10),
            eose_wait_base: Duration::from_millis(1000),
            eose_min_eosed: 2,
            eose_fraction_threshold: 0.5,
            active_flow_window: Duration::from_millis(20),
            subscription_channel_size: 1_000,
            update_channel_size: 1_000,
            signature_cache_size: 1_000,
            rng_seed: None,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial verification probability for untrusted relays
    pub fn with_initial_validation_ratio(mut self, ratio: f64) -> Self {
        self.initial_validation_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Set the floor the verification probability decays toward
    pub fn with_lowest_validation_ratio(mut self, ratio: f64) -> Self {
        self.lowest_validation_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Replace the built-in ratio decay curve
    pub fn with_validation_ratio_fn(
        mut self,
        ratio_fn: impl Fn(u64, u64) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.validation_ratio_fn = Some(Arc::new(ratio_fn));
        self
    }

    /// Set the hard upper bound for one-shot fetch operations
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Set the base wait window for the decaying EOSE timer
    pub fn with_eose_wait_base(mut self, wait: Duration) -> Self {
        self.eose_wait_base = wait;
        self
    }

    /// Set how many relays must EOSE before the decaying timer arms
    pub fn with_eose_min_eosed(mut self, count: usize) -> Self {
        self.eose_min_eosed = count;
        self
    }

    /// Set the connected-relay EOSE fraction that arms the decaying timer
    pub fn with_eose_fraction_threshold(mut self, fraction: f64) -> Self {
        self.eose_fraction_threshold = fraction.clamp(0.0, 1.0);
        self
    }

    /// Set the window within which an admitted event re-arms the EOSE timer
    pub fn with_active_flow_window(mut self, window: Duration) -> Self {
        self.active_flow_window = window;
        self
    }

    /// Set the coordinator input channel capacity
    pub fn with_subscription_channel_size(mut self, size: usize) -> Self {
        self.subscription_channel_size = size.max(1);
        self
    }

    /// Set the outbound update channel capacity
    pub fn with_update_channel_size(mut self, size: usize) -> Self {
        self.update_channel_size = size.max(1);
        self
    }

    /// Set how many verified signatures are remembered for duplicate checks
    pub fn with_signature_cache_size(mut self, size: usize) -> Self {
        self.signature_cache_size = size.max(1);
        self
    }

    /// Seed the sampler RNGs for deterministic verification draws
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("initial_validation_ratio", &self.initial_validation_ratio)
            .field("lowest_validation_ratio", &self.lowest_validation_ratio)
            .field(
                "validation_ratio_fn",
                &self.validation_ratio_fn.as_ref().map(|_| "<custom>"),
            )
            .field("fetch_timeout", &self.fetch_timeout)
            .field("eose_wait_base", &self.eose_wait_base)
            .field("eose_min_eosed", &self.eose_min_eosed)
            .field("eose_fraction_threshold", &self.eose_fraction_threshold)
            .field("active_flow_window", &self.active_flow_window)
            .field(
                "subscription_channel_size",
                &self.subscription_channel_size,
            )
            .field("update_channel_size", &self.update_channel_size)
            .field("signature_cache_size", &self.signature_cache_size)
            .field("rng_seed", &self.rng_seed)
            .finish()
    }
}
