//! Chaos testing for datagram links - drops and duplicates.
//!
//! Inspired by Netflix's Chaos Monkey and Aeron's test harnesses.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// What a lossy link does with one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    Pass,
    Drop,
    /// Deliver it twice
    Duplicate,
}

/// Chaos monkey for injecting datagram faults into tests.
///
/// # Example
///
/// ```
/// use kaos_test_support::chaos::{ChaosMonkey, Fate};
///
/// let mut monkey = ChaosMonkey::new()
///     .with_drop_probability(0.05)
///     .with_duplicate_probability(0.05);
///
/// let fates: Vec<Fate> = (0..100).map(|_| monkey.decide()).collect();
/// assert_eq!(fates.len(), 100);
/// ```
pub struct ChaosMonkey {
    drop_probability: f64,
    duplicate_probability: f64,
    rng: StdRng,
    events_triggered: usize,
}

impl Default for ChaosMonkey {
    fn default() -> Self {
        Self::new()
    }
}

impl ChaosMonkey {
    pub fn new() -> Self {
        Self {
            drop_probability: 0.0,
            duplicate_probability: 0.0,
            rng: StdRng::from_entropy(),
            events_triggered: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_drop_probability(mut self, prob: f64) -> Self {
        self.drop_probability = prob.clamp(0.0, 1.0);
        self
    }

    pub fn with_duplicate_probability(mut self, prob: f64) -> Self {
        self.duplicate_probability = prob.clamp(0.0, 1.0);
        self
    }

    /// Decide the fate of the next datagram
    pub fn decide(&mut self) -> Fate {
        let roll = self.rng.gen::<f64>();
        let mut threshold = 0.0;

        threshold += self.drop_probability;
        if roll < threshold {
            self.events_triggered += 1;
            return Fate::Drop;
        }

        threshold += self.duplicate_probability;
        if roll < threshold {
            self.events_triggered += 1;
            return Fate::Duplicate;
        }

        Fate::Pass
    }

    /// Get number of chaos events triggered
    pub fn events_triggered(&self) -> usize {
        self.events_triggered
    }
}
