//! Simulated temperature sensor
//!
//! Readings hover around a baseline: 95% of the time within ±5, otherwise
//! within ±10, which is enough for the aggregator to see occasional spikes.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const DEFAULT_BASELINE: f64 = 100.0;

#[derive(Debug)]
pub struct SensorSimulator {
    baseline: f64,
    rng: StdRng,
}

impl SensorSimulator {
    pub fn new(baseline: f64) -> Self {
        Self { baseline, rng: StdRng::from_entropy() }
    }

    /// Reproducible sequence
    #[cfg(test)]
    pub fn seeded(baseline: f64, seed: u64) -> Self {
        Self { baseline, rng: StdRng::seed_from_u64(seed) }
    }

    pub fn next_reading(&mut self) -> f64 {
        let spread = if self.rng.gen_bool(0.95) { 10.0 } else { 20.0 };
        self.baseline + (self.rng.gen::<f64>() - 0.5) * spread
    }
}
