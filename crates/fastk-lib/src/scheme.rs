//! Minimizer scheme selection
//!
//! The planner only needs one number from the scheme: the maximum number of
//! k-mers a super-mer can span. [`SchemeSelector`] is the seam where another
//! scheme could be plugged in; [`RandomMinimizerScheme`] is the one Split
//! uses.

use tracing::info;

use crate::encoding::BASE_CODE;
use crate::error::Result;
use crate::minimizer::{valid_runs, MinimizerScanner};
use crate::plan::ring_length;
use crate::sample::InputSample;

/// Chooses a minimizer scheme and reports its super-mer bound
pub trait SchemeSelector {
    /// Maximum super-mer length, in k-mers (at least 1). Every super-mer
    /// Split emits spans at most this many consecutive k-mers.
    fn select(&self, sample: &InputSample, k: usize) -> Result<usize>;

    /// Minimizer length the scheme settled on for `k`
    fn minimizer_len(&self, k: usize) -> usize;
}

/// Random minimizers: canonical m-mers ranked by a seeded hash.
///
/// A minimizer occurrence stays inside at most `k - m + 1` consecutive
/// k-mers, which is the bound reported to the planner.
#[derive(Debug, Clone, Copy)]
pub struct RandomMinimizerScheme {
    m: usize,
}

impl RandomMinimizerScheme {
    /// Scheme with minimizers of length `m` (clamped to k at selection)
    pub fn new(m: usize) -> Self {
        Self { m: m.max(1) }
    }
}

impl SchemeSelector for RandomMinimizerScheme {
    fn select(&self, sample: &InputSample, k: usize) -> Result<usize> {
        let m = self.minimizer_len(k);
        let bound = k - m + 1;

        let mut scanner = MinimizerScanner::new(k, m, ring_length(k));
        let mut super_mers = Vec::new();
        let mut codes = Vec::new();
        let (mut num_super, mut num_kmers, mut longest) = (0u64, 0u64, 0usize);

        for read in &sample.reads {
            codes.clear();
            codes.extend(read.iter().map(|&b| BASE_CODE[b as usize]));
            for (start, end) in valid_runs(&codes, k) {
                scanner.super_mers(&codes[start..end], bound, &mut super_mers);
                for sm in &super_mers {
                    num_super += 1;
                    num_kmers += sm.num_kmers as u64;
                    longest = longest.max(sm.num_kmers);
                }
            }
        }

        if num_super > 0 {
            info!(
                "Minimizer scheme m = {}: {:.2} k-mers per super-mer on average, longest {} (bound {})",
                m,
                num_kmers as f64 / num_super as f64,
                longest,
                bound
            );
        } else {
            info!("Minimizer scheme m = {}: no k-mers in sample (bound {})", m, bound);
        }
        Ok(bound)
    }

    fn minimizer_len(&self, k: usize) -> usize {
        self.m.min(k)
    }
}
