//! Datagram loss simulation for transport testing.
//!
//! Inspired by Aeron's `LossGenerator` and `PortLossGenerator`. Decisions are
//! keyed by the datagram's position in the stream a wrapper has seen so far.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Decision for whether to drop a datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropDecision {
    Drop,
    Pass,
}

/// Shared on/off switch for total loss. Clones control the same gate, so a
/// test can black-hole a link and later restore it while traffic flows.
#[derive(Debug, Clone, Default)]
pub struct LossGate {
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl LossGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything from now on.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Let traffic through again.
    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Datagrams dropped while the gate was closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    fn check(&self) -> DropDecision {
        if self.is_closed() {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            DropDecision::Drop
        } else {
            DropDecision::Pass
        }
    }
}

/// Pattern for datagram loss simulation
#[derive(Debug, Clone)]
pub enum LossPattern {
    /// Drop every Nth datagram (indices N-1, 2N-1, ...)
    Periodic { every_n: usize },
    /// Drop datagrams randomly with given probability (0.0-1.0)
    Random { probability: f64 },
    /// Drop everything while the gate is closed
    Gate(LossGate),
    /// Combination of patterns
    Combined(Vec<LossPattern>),
}

/// Generates datagram loss for testing recovery.
///
/// # Example
///
/// ```
/// use kaos_test_support::loss::{LossGenerator, LossGate, DropDecision};
///
/// let gate = LossGate::new();
/// let mut gen = LossGenerator::gated(gate.clone());
///
/// assert_eq!(gen.should_drop(0), DropDecision::Pass);
/// gate.close();
/// assert_eq!(gen.should_drop(1), DropDecision::Drop);
/// ```
pub struct LossGenerator {
    pattern: LossPattern,
    packet_count: usize,
    dropped: usize,
    rng: StdRng,
}

impl LossGenerator {
    pub fn new(pattern: LossPattern) -> Self {
        Self {
            pattern,
            packet_count: 0,
            dropped: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible random decisions.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Create a generator that drops every Nth datagram
    pub fn periodic(every_n: usize) -> Self {
        Self::new(LossPattern::Periodic { every_n })
    }

    /// Create a generator with random loss probability
    pub fn random(probability: f64) -> Self {
        Self::new(LossPattern::Random {
            probability: probability.clamp(0.0, 1.0),
        })
    }

    /// Create a generator controlled by a shared gate
    pub fn gated(gate: LossGate) -> Self {
        Self::new(LossPattern::Gate(gate))
    }

    /// Decide whether to drop the datagram at the given index
    pub fn should_drop(&mut self, sequence: u64) -> DropDecision {
        self.packet_count += 1;
        let pattern = self.pattern.clone();
        let decision = self.check_pattern(sequence, &pattern);
        if decision == DropDecision::Drop {
            self.dropped += 1;
        }
        decision
    }

    fn check_pattern(&mut self, sequence: u64, pattern: &LossPattern) -> DropDecision {
        match pattern {
            LossPattern::Periodic { every_n } => {
                if *every_n > 0 && (sequence + 1) % *every_n as u64 == 0 {
                    DropDecision::Drop
                } else {
                    DropDecision::Pass
                }
            }

            LossPattern::Random { probability } => {
                if self.rng.gen::<f64>() < *probability {
                    DropDecision::Drop
                } else {
                    DropDecision::Pass
                }
            }

            LossPattern::Gate(gate) => gate.check(),

            LossPattern::Combined(patterns) => {
                // Every pattern sees every datagram so stateful ones stay in step.
                let mut decision = DropDecision::Pass;
                for p in patterns {
                    if self.check_pattern(sequence, p) == DropDecision::Drop {
                        decision = DropDecision::Drop;
                    }
                }
                decision
            }
        }
    }

    /// Get statistics
    pub fn stats(&self) -> LossStats {
        LossStats {
            total_packets: self.packet_count,
            dropped: self.dropped,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LossStats {
    pub total_packets: usize,
    pub dropped: usize,
}
