//! Head-based sampling.
//!
//! Shaped after `opentelemetry_sdk::trace::sampler::ShouldSample`: a small
//! trait so `begin_transaction` never has to know how the sampling decision
//! was reached, plus a deterministic implementation for reproducing an exact
//! draw sequence in tests (`id_generator`'s seeded-RNG-for-tests pattern).

use std::cell::RefCell;
use std::fmt;
use std::sync::Mutex;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Decides whether a newly begun transaction is sampled.
pub trait Sampler: Send + Sync + fmt::Debug {
    fn should_sample(&self) -> bool;
}

/// `is_sampled = sample_rate >= 1.0 OR draw < sample_rate` (`spec.md` §4.3),
/// drawing from a thread-local PRNG so concurrent flows don't contend.
#[derive(Debug, Clone, Copy)]
pub struct RandomSampler {
    pub rate: f64,
}

impl RandomSampler {
    pub fn new(rate: f64) -> Self {
        RandomSampler {
            rate: rate.clamp(0.0, 1.0),
        }
    }
}

impl Sampler for RandomSampler {
    fn should_sample(&self) -> bool {
        self.rate >= 1.0 || CURRENT_RNG.with(|rng| rng.borrow_mut().random::<f64>()) < self.rate
    }
}

thread_local! {
    static CURRENT_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_os_rng());
}

/// Always samples, or never — for tests and for `sample_rate` at the 0/1 extremes.
#[derive(Debug, Clone, Copy)]
pub struct ConstantSampler(pub bool);

impl Sampler for ConstantSampler {
    fn should_sample(&self) -> bool {
        self.0
    }
}

/// Replays a fixed sequence of `[0, 1)` draws against `rate`, for
/// reproducing an exact sampling outcome in tests (`spec.md` §8 scenario 1).
#[derive(Debug)]
pub struct DeterministicSampler {
    rate: f64,
    draws: Mutex<std::vec::IntoIter<f64>>,
}

impl DeterministicSampler {
    pub fn new(rate: f64, draws: Vec<f64>) -> Self {
        DeterministicSampler {
            rate: rate.clamp(0.0, 1.0),
            draws: Mutex::new(draws.into_iter()),
        }
    }
}

impl Sampler for DeterministicSampler {
    fn should_sample(&self) -> bool {
        let draw = self
            .draws
            .lock()
            .unwrap()
            .next()
            .expect("DeterministicSampler draw sequence exhausted");
        self.rate >= 1.0 || draw < self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_sampler_is_constant() {
        assert!(ConstantSampler(true).should_sample());
        assert!(!ConstantSampler(false).should_sample());
    }

    #[test]
    fn rate_at_or_above_one_always_samples() {
        let s = RandomSampler::new(1.0);
        for _ in 0..20 {
            assert!(s.should_sample());
        }
    }

    #[test]
    fn rate_zero_never_samples() {
        let s = RandomSampler::new(0.0);
        for _ in 0..20 {
            assert!(!s.should_sample());
        }
    }

    #[test]
    fn deterministic_sequence_yields_exactly_four_of_ten() {
        let draws = vec![0.1, 0.5, 0.3, 0.9, 0.2, 0.7, 0.6, 0.8, 0.35, 0.45];
        let s = DeterministicSampler::new(0.4, draws);
        let sampled: Vec<bool> = (0..10).map(|_| s.should_sample()).collect();
        assert_eq!(sampled.iter().filter(|&&b| b).count(), 4);
        assert_eq!(
            sampled,
            vec![true, false, true, false, true, false, false, false, true, false]
        );
    }
}
