//! Fixed-capacity uniform sampling of an unbounded stream.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

use crate::percentile::Percentile;

/// Default number of samples retained by a [`Reservoir`].
pub const DEFAULT_CAPACITY: usize = 1000;

/// A reservoir sample of observed values.
///
/// Until the reservoir is full, every value is retained. After that, each new value replaces a
/// uniformly chosen sample with probability `capacity / seen`, so every value of the stream has
/// the same chance of being part of the sample.
#[derive(Clone, Debug)]
pub struct Reservoir {
    capacity: usize,
    samples: Vec<f64>,
    seen: u64,
    rng: Pcg32,
}

impl Reservoir {
    /// Creates a reservoir with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a reservoir holding at most `capacity` samples.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_seed(capacity, rand::random())
    }

    /// Creates a reservoir with a deterministic random source.
    pub fn with_seed(capacity: usize, seed: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: Vec::with_capacity(capacity.clamp(1, DEFAULT_CAPACITY)),
            seen: 0,
            rng: Pcg32::seed_from_u64(seed),
        }
    }

    /// Records a value.
    pub fn push(&mut self, value: f64) {
        self.seen += 1;

        if self.samples.len() < self.capacity {
            self.samples.push(value);
            return;
        }

        let slot = self.rng.random_range(0..self.seen);
        if let Ok(slot) = usize::try_from(slot) {
            if slot < self.capacity {
                self.samples[slot] = value;
            }
        }
    }

    /// Estimates a percentile with the nearest-rank method.
    ///
    /// The result is the sample at rank `ceil(p / 100 * n)` in ascending order, with the rank
    /// clamped to `[1, n]`. Returns `None` if no values have been recorded.
    pub fn percentile(&self, percentile: Percentile) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable_by(f64::total_cmp);

        let n = sorted.len();
        let exact = percentile.value() / 100.0 * n as f64;
        // Absorb representation error, so that 0.95 * 20 is rank 19 and not 20.
        let rank = if (exact - exact.round()).abs() < 1e-9 {
            exact.round()
        } else {
            exact.ceil()
        };

        let rank = (rank as usize).clamp(1, n);
        sorted.get(rank - 1).copied()
    }

    /// Returns the number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` if no values have been recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the number of values recorded since creation or the last [`clear`](Self::clear).
    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// Returns the maximum number of retained samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Removes all samples.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.seen = 0;
    }
}

impl Default for Reservoir {
    fn default() -> Self {
        Self::new()
    }
}
