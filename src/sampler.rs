//! Per-relay signature-verification sampling
//!
//! Verification cost is amortized per relay: every event from a fresh relay
//! is verified, and as the relay accumulates validated events the probability
//! of verifying the next one decays toward a configured floor. A relay marked
//! trusted is never sampled. Counters are shared across every subscription
//! using the relay.

use crate::config::{EngineConfig, ValidationRatioFn};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Validated-event count at which the built-in curve has shed half the
/// distance between the initial ratio and the floor.
const RATIO_DECAY_SCALE: f64 = 100.0;

/// Sampling state for one relay
pub struct ValidationSampler {
    trusted: AtomicBool,
    validated: AtomicU64,
    non_validated: AtomicU64,
    initial_ratio: f64,
    lowest_ratio: f64,
    ratio_fn: Option<Arc<ValidationRatioFn>>,
    rng: Mutex<StdRng>,
}

impl ValidationSampler {
    pub fn new(config: &EngineConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            trusted: AtomicBool::new(false),
            validated: AtomicU64::new(0),
            non_validated: AtomicU64::new(0),
            initial_ratio: config.initial_validation_ratio,
            lowest_ratio: config.lowest_validation_ratio,
            ratio_fn: config.validation_ratio_fn.clone(),
            rng: Mutex::new(rng),
        }
    }

    /// Whether the next event from this relay must be cryptographically verified
    pub fn should_validate(&self) -> bool {
        if self.trusted.load(Ordering::Relaxed) {
            return false;
        }
        let ratio = self.target_ratio();
        let draw: f64 = self.rng.lock().gen();
        draw < ratio
    }

    /// Current target verification probability for this relay
    pub fn target_ratio(&self) -> f64 {
        let validated = self.validated.load(Ordering::Relaxed);
        let non_validated = self.non_validated.load(Ordering::Relaxed);
        let ratio = match &self.ratio_fn {
            Some(ratio_fn) => ratio_fn(validated, non_validated),
            None => self.default_ratio(validated),
        };
        ratio.clamp(0.0, 1.0)
    }

    /// Built-in decay: starts at the initial ratio and falls asymptotically
    /// toward the floor as validated events accumulate.
    fn default_ratio(&self, validated: u64) -> f64 {
        let lowest = self.lowest_ratio.min(self.initial_ratio);
        let decayed =
            lowest + (self.initial_ratio - lowest) / (1.0 + validated as f64 / RATIO_DECAY_SCALE);
        decayed.max(lowest)
    }

    /// Record an event whose signature was verified (or trusted by equality)
    pub fn add_validated(&self) {
        self.validated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event admitted without cryptographic proof
    pub fn add_non_validated(&self) {
        self.non_validated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn validated_count(&self) -> u64 {
        self.validated.load(Ordering::Relaxed)
    }

    pub fn non_validated_count(&self) -> u64 {
        self.non_validated.load(Ordering::Relaxed)
    }

    pub fn trusted(&self) -> bool {
        self.trusted.load(Ordering::Relaxed)
    }

    pub fn set_trusted(&self, trusted: bool) {
        self.trusted.store(trusted, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ValidationSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationSampler")
            .field("trusted", &self.trusted())
            .field("validated", &self.validated_count())
            .field("non_validated", &self.non_validated_count())
            .field("target_ratio", &self.target_ratio())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_sampler() -> ValidationSampler {
        ValidationSampler::new(&EngineConfig::default().with_rng_seed(7))
    }

    #[test]
    fn test_fresh_relay_always_validates() {
        let sampler = seeded_sampler();
        for _ in 0..100 {
            assert!(
                sampler.should_validate(),
                "initial ratio 1.0 must verify every event"
            );
        }
    }

    #[test]
    fn test_trusted_relay_never_validates() {
        let sampler = seeded_sampler();
        sampler.set_trusted(true);
        for _ in 0..100 {
            assert!(
                !sampler.should_validate(),
                "trusted relays bypass sampling unconditionally"
            );
        }
    }

    #[test]
    fn test_ratio_decays_monotonically_toward_floor() {
        let sampler = seeded_sampler();
        let mut previous = sampler.target_ratio();
        assert_eq!(previous, 1.0);

        for _ in 0..10_000 {
            sampler.add_validated();
            let ratio = sampler.target_ratio();
            assert!(ratio <= previous, "ratio must never increase");
            assert!(ratio >= 0.1, "ratio must never cross the floor");
            previous = ratio;
        }
        assert!(
            previous < 0.11,
            "after 10k validated events the ratio should sit near the floor, got {previous}"
        );
    }

    #[test]
    fn test_long_run_frequency_converges_to_floor() {
        let sampler = seeded_sampler();
        for _ in 0..10_000 {
            sampler.add_validated();
        }

        let trials = 1_000;
        let hits = (0..trials).filter(|_| sampler.should_validate()).count();
        // Target sits just above 0.1; a seeded RNG keeps this deterministic,
        // the wide band guards against rand internals changing the stream.
        assert!(
            (50..=200).contains(&hits),
            "expected roughly one verification in ten, got {hits}/{trials}"
        );
    }

    #[test]
    fn test_counters_accumulate() {
        let sampler = seeded_sampler();
        sampler.add_validated();
        sampler.add_validated();
        sampler.add_non_validated();
        assert_eq!(sampler.validated_count(), 2);
        assert_eq!(sampler.non_validated_count(), 1);
    }

    #[test]
    fn test_custom_ratio_fn_overrides_curve() {
        let config = EngineConfig::default()
            .with_rng_seed(7)
            .with_validation_ratio_fn(|_, _| 0.0);
        let sampler = ValidationSampler::new(&config);
        for _ in 0..50 {
            assert!(
                !sampler.should_validate(),
                "a zero ratio must never request verification"
            );
        }
    }
}
