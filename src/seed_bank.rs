//! Deterministic per-run seeds.
//!
//! The whole bank is built from one master seed before scheduling, so the seed a run gets
//! only depends on its index, never on which worker picks it up or when.

use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::error::RefereeError;

/// Seeds are drawn from `[0, SEED_SPACE)` so they fit a signed 32-bit integer on the judge side.
pub const SEED_SPACE: usize = 1 << 31;

/// A pre-shuffled bank of run seeds, consumed without replacement.
#[derive(Debug, Clone)]
pub struct SeedBank {
    seeds: Vec<u64>,
}

impl SeedBank {
    /// Sample `capacity` distinct seeds from the master seed.
    pub fn derive(master: u64, capacity: usize) -> Result<Self, RefereeError> {
        if capacity > SEED_SPACE {
            return Err(RefereeError::Configuration(format!(
                "cannot derive {capacity} distinct seeds, at most {SEED_SPACE} exist"
            )));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(master);
        let seeds = rand::seq::index::sample(&mut rng, SEED_SPACE, capacity)
            .into_iter()
            .map(|s| s as u64)
            .collect();
        debug!(master, capacity, "derived seed bank");
        Ok(SeedBank { seeds })
    }

    /// Build a bank from explicit seeds, shuffled with the master seed.
    pub fn from_seeds(mut seeds: Vec<u64>, master: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(master);
        seeds.shuffle(&mut rng);
        SeedBank { seeds }
    }

    /// A master seed taken from OS entropy, to be logged so the batch can be replayed.
    pub fn random_master() -> u64 {
        rand::random()
    }

    /// Seeds still available.
    pub fn remaining(&self) -> usize {
        self.seeds.len()
    }

    /// Hand out the next `runs` seeds, in bank order.
    pub fn draw(&mut self, runs: usize) -> Result<Vec<u64>, RefereeError> {
        if runs > self.seeds.len() {
            return Err(RefereeError::Configuration(format!(
                "{runs} runs requested but only {} seeds are available",
                self.seeds.len()
            )));
        }
        Ok(self.seeds.drain(..runs).collect())
    }
}
