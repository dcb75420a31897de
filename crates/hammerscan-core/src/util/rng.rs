use rand::{RngCore, SeedableRng, rngs::StdRng};
use serde::Serialize;

/// Seedable random number generator.
///
/// Candidate selection draws from this generator so that a run can be
/// repeated by logging and reusing its seed.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Rng {
    seed: u64,
    #[serde(skip_serializing)]
    rng: StdRng,
}

impl Rng {
    /// Creates a new RNG from a seed value.
    ///
    /// # Arguments
    ///
    /// * `seed` - Seed value for deterministic random generation
    pub fn from_seed(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Creates a new RNG seeded from the operating system.
    pub fn from_entropy() -> Self {
        Self::from_seed(rand::random())
    }

    /// The seed this generator was created from.
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl RngCore for Rng {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest);
    }
}

impl Clone for Rng {
    fn clone(&self) -> Self {
        Self::from_seed(self.seed)
    }
}

#[cfg(test)]
mod tests {
    use crate::util::Rng;
    use rand::{Rng as _, RngCore};

    #[test]
    fn test_rng_clone_restarts_sequence() {
        let mut rng = Rng::from_seed(0x42);
        let a = rng.next_u64();
        let mut cloned_rng = rng.clone();
        let b = cloned_rng.next_u64();
        assert_eq!(a, b, "Cloned Rng should start with the same seed");
    }

    #[test]
    fn test_rng_same_seed_same_picks() {
        let mut a = Rng::from_seed(7);
        let mut b = Rng::from_seed(a.seed());
        let picks_a: Vec<usize> = (0..16).map(|_| a.random_range(0..1000)).collect();
        let picks_b: Vec<usize> = (0..16).map(|_| b.random_range(0..1000)).collect();
        assert_eq!(picks_a, picks_b);
    }
}
