//! Randomized inter-send pacing.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Draw a delay in whole seconds, uniformly over `[min_sec, max_sec]`.
///
/// Bounds given in the wrong order are swapped rather than rejected.
pub fn delay_secs<R: Rng + ?Sized>(rng: &mut R, min_sec: u64, max_sec: u64) -> u64 {
    let (lo, hi) = if min_sec <= max_sec {
        (min_sec, max_sec)
    } else {
        (max_sec, min_sec)
    };
    rng.gen_range(lo..=hi)
}

/// Owns the randomness source used between sends.
#[derive(Debug)]
pub struct Pacer {
    rng: StdRng,
}

impl Pacer {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_seed_option(seed: Option<u64>) -> Self {
        seed.map(Self::seeded).unwrap_or_else(Self::from_entropy)
    }

    pub fn next_delay(&mut self, min_sec: u64, max_sec: u64) -> Duration {
        Duration::from_secs(delay_secs(&mut self.rng, min_sec, max_sec))
    }
}
