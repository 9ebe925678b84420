//! Constants and defaults for fastk
//!
//! Defaults mirror the command-line defaults; the remaining values are fixed
//! parameters of the on-disk formats.

/// Default k-mer length
pub const DEFAULT_KMER_LEN: usize = 40;

/// Smallest supported k-mer length
pub const MIN_KMER_LEN: usize = 1;

/// Largest supported k-mer length (a k-mer must fit in a `u128`)
pub const MAX_KMER_LEN: usize = 64;

/// Default number of worker threads
pub const DEFAULT_THREADS: usize = 4;

/// Default memory budget of one partition sort, in GB
pub const DEFAULT_SORT_MEMORY_GB: u64 = 12;

/// Bytes per GB as used by the `-M` option (decimal, not GiB)
pub const GB: u64 = 1_000_000_000;

/// Default scratch directory for bucket and partition files
pub const DEFAULT_SCRATCH_DIR: &str = "/tmp";

/// Cutoff used when `--table` is given without a value
pub const DEFAULT_TABLE_CUTOFF: u32 = 4;

/// Bases read from the head of the input to plan the run
pub const DEFAULT_SAMPLE_BYTES: u64 = 1_000_000_000;

/// Default minimizer length of the random minimizer scheme
pub const DEFAULT_MINIMIZER_LEN: usize = 12;

/// Largest minimizer length (an m-mer must fit in a `u64`)
pub const MAX_MINIMIZER_LEN: usize = 32;

/// Seed ranking m-mers when picking minimizers
pub const MINIMIZER_SEED: u64 = 0x5eed_f457;

/// Seed mapping a minimizer to its partition
pub const PARTITION_SEED: u64 = 0x9a27_1710;

/// Counts saturate at this value in sorted partitions, tables and profiles
pub const MAX_COUNT: u16 = 32767;

/// Highest histogram bin; the last bin aggregates everything above
pub const HIST_HIGH: i32 = MAX_COUNT as i32;

/// Version number
pub const VERSION: (u8, u8, u8) = (0, 1, 0);

/// Smallest `n` such that `value < 2^n`.
///
/// Returns 0 for `value == 0`.
#[inline]
pub const fn bits_to_hold(value: u64) -> usize {
    64 - value.leading_zeros() as usize
}

/// Check that a k-mer length can be packed by every stage
#[inline]
pub const fn is_valid_k(k: usize) -> bool {
    k >= MIN_KMER_LEN && k <= MAX_KMER_LEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_to_hold() {
        assert_eq!(bits_to_hold(0), 0);
        assert_eq!(bits_to_hold(1), 1);
        assert_eq!(bits_to_hold(2), 2);
        assert_eq!(bits_to_hold(3), 2);
        assert_eq!(bits_to_hold(4), 3);
        assert_eq!(bits_to_hold(25), 5);
        assert_eq!(bits_to_hold(31), 5);
        assert_eq!(bits_to_hold(32), 6);
        assert_eq!(bits_to_hold(u64::MAX), 64);
    }

    #[test]
    fn test_is_valid_k() {
        assert!(is_valid_k(1));
        assert!(is_valid_k(40));
        assert!(is_valid_k(64));

        assert!(!is_valid_k(0));
        assert!(!is_valid_k(65));
    }
}
