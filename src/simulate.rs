//! Synthetic measurements in the ranges a field unit reports

use airsense_shared::Measurements;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::RangeInclusive;

pub const LUX_RANGE: RangeInclusive<f64> = 100.0..=500.0;
pub const NH3_RANGE: RangeInclusive<f64> = 5.0..=20.0;
pub const HS_RANGE: RangeInclusive<f64> = 30.0..=350.0;
pub const H_RANGE: RangeInclusive<f64> = 50.0..=90.0;
pub const T_RANGE: RangeInclusive<f64> = 18.0..=35.0;

/// Draws measurements uniformly from fixed ranges
pub struct MeasurementSimulator {
    rng: StdRng,
}

impl MeasurementSimulator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic sequence, for reproducible runs
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn next_measurements(&mut self) -> Measurements {
        Measurements {
            lux: self.draw(LUX_RANGE),
            nh3: self.draw(NH3_RANGE),
            hs: self.draw(HS_RANGE),
            h: self.draw(H_RANGE),
            t: self.draw(T_RANGE),
        }
    }

    fn draw(&mut self, range: RangeInclusive<f64>) -> f64 {
        round2(self.rng.gen_range(range))
    }
}

impl Default for MeasurementSimulator {
    fn default() -> Self {
        Self::new()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
