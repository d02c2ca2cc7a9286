//! Explicit, splittable random-generator state.
//!
//! There is no ambient generator anywhere in the crate. Every function that
//! needs randomness takes a [`PrngKey`] and hands back the key to use next,
//! so a run is a pure function of its seed.

use nalgebra::DMatrix;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Generator state threaded through every draw.
///
/// A key is consumed by value. [`PrngKey::split`] derives fresh keys from it
/// deterministically; re-using a key reproduces the same numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrngKey(u64);

impl PrngKey {
    /// Root key for a seed.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Derive two independent keys.
    #[must_use]
    pub fn split(self) -> (PrngKey, PrngKey) {
        let mut rng = self.rng();
        (PrngKey(rng.next_u64()), PrngKey(rng.next_u64()))
    }

    /// Derive three independent keys.
    #[must_use]
    pub fn split3(self) -> (PrngKey, PrngKey, PrngKey) {
        let mut rng = self.rng();
        (
            PrngKey(rng.next_u64()),
            PrngKey(rng.next_u64()),
            PrngKey(rng.next_u64()),
        )
    }

    fn rng(self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.0)
    }
}

/// Draw `batch_size` state indices uniformly from `[0, population)`, with
/// replacement.
///
/// Returns the indices and the key for the next draw.
///
/// ```rust
/// use aux_tasks_rs::rng::{draw_states, PrngKey};
///
/// let key = PrngKey::new(7);
/// let (first, next) = draw_states(10, 4, key);
/// let (again, _) = draw_states(10, 4, key);
/// assert_eq!(first, again);
/// assert_ne!(next, key);
/// ```
///
/// # Panics
///
/// Panics if `population` is zero and `batch_size` is not.
#[must_use]
pub fn draw_states(population: usize, batch_size: usize, key: PrngKey) -> (Vec<usize>, PrngKey) {
    let (key, subkey) = key.split();
    let mut rng = subkey.rng();
    let states = (0..batch_size)
        .map(|_| rng.gen_range(0..population))
        .collect();
    (states, key)
}

/// Matrix of independent standard normal entries.
#[must_use]
pub fn normal_matrix(key: PrngKey, nrows: usize, ncols: usize) -> DMatrix<f64> {
    let mut rng = key.rng();
    DMatrix::from_fn(nrows, ncols, |_, _| rng.sample(StandardNormal))
}
