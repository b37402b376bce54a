//! Seedable random number generator for deterministic testing.
//!
//! When a seed is provided via [`Config::rng_seed`][crate::Config::rng_seed],
//! session ids, IVs, key sources and retransmit jitter become deterministic.
//! This is useful for testing and debugging and must never be used in
//! production, since it makes key material predictable.

use rand::distributions::{Distribution, Standard};
use rand::rngs::{OsRng, StdRng};
use rand::{Rng, RngCore, SeedableRng};

/// A random number generator that can be seeded for deterministic behavior.
///
/// When created with a seed, it produces deterministic random values.
/// When created without a seed, values come from the thread-local generator
/// and bytes for key material come straight from the operating system.
pub struct SeededRng {
    inner: Option<StdRng>,
}

impl SeededRng {
    /// Create a new RNG with an optional seed.
    ///
    /// If `seed` is `Some`, the RNG will produce deterministic values.
    /// If `seed` is `None`, it will use the thread-local random generator.
    pub fn new(seed: Option<u64>) -> Self {
        let inner = seed.map(StdRng::seed_from_u64);
        Self { inner }
    }

    /// Generate a random value of type T.
    pub fn random<T>(&mut self) -> T
    where
        Standard: Distribution<T>,
    {
        match self.inner.as_mut() {
            Some(rng) => rng.gen(),
            None => rand::random(),
        }
    }

    /// Fill `dest` with random bytes suitable for keys and IVs.
    pub fn fill_bytes(&mut self, dest: &mut [u8]) {
        match self.inner.as_mut() {
            Some(rng) => rng.fill_bytes(dest),
            None => OsRng.fill_bytes(dest),
        }
    }
}

impl std::fmt::Debug for SeededRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let is_seeded = self.inner.is_some();
        f.debug_struct("SeededRng")
            .field("seeded", &is_seeded)
            .finish()
    }
}
