//! Seeded hashing of minimizers.
//!
//! Both the minimizer order and the minimizer-to-partition map come from a
//! seeded `ahash` state. The seeds are fixed constants, so every stage of
//! every run agrees on which bucket a super-mer belongs to.

use ahash::RandomState;

use crate::constants::{MINIMIZER_SEED, PARTITION_SEED};

/// A deterministic hasher with a seeded state
#[derive(Clone)]
pub struct DeterministicHasher {
    state: RandomState,
}

impl DeterministicHasher {
    /// Create a new deterministic hasher with the given seed
    pub fn new(seed: u64) -> Self {
        let state = RandomState::with_seeds(seed, !seed, seed.rotate_left(17), !seed.rotate_left(17));
        Self { state }
    }

    /// Hasher ranking canonical m-mers
    pub fn for_minimizers() -> Self {
        Self::new(MINIMIZER_SEED)
    }

    /// Hasher assigning minimizers to partitions
    pub fn for_partitions() -> Self {
        Self::new(PARTITION_SEED)
    }

    /// Hash a u64 value
    #[inline]
    pub fn hash_u64(&self, value: u64) -> u64 {
        self.state.hash_one(value)
    }
}

/// Maps a minimizer to one of `num_partitions` buckets
#[derive(Clone)]
pub struct Partitioner {
    hasher: DeterministicHasher,
    num_partitions: u64,
}

impl Partitioner {
    /// Partitioner over `num_partitions` buckets (at least 1)
    pub fn new(num_partitions: usize) -> Self {
        Self {
            hasher: DeterministicHasher::for_partitions(),
            num_partitions: num_partitions.max(1) as u64,
        }
    }

    /// Bucket of a minimizer value
    #[inline]
    pub fn partition_of(&self, minimizer: u64) -> usize {
        (self.hasher.hash_u64(minimizer) % self.num_partitions) as usize
    }
}
