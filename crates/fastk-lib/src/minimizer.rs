//! Minimizer extraction and super-mer segmentation
//!
//! The minimizer of a k-mer is the canonical m-mer inside it with the smallest
//! seeded hash. Consecutive k-mers sharing the same minimizer occurrence form
//! a super-mer, which Split stores as one record.
//!
//! Recent m-mers live in a ring buffer whose length is the plan's ring length
//! (a power of two greater than k), so the window of `k - m + 1` candidates is
//! always resident and the slot of position `p` is `p & mask`.

use crate::hasher::DeterministicHasher;

/// A minimizer occurrence
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Minimizer {
    /// Canonical m-mer value (2 bits per base)
    pub value: u64,
    /// Start of the m-mer in the scanned run
    pub pos: usize,
    hash: u64,
}

/// A maximal run of consecutive k-mers sharing a minimizer occurrence,
/// possibly cut to respect the maximum super-mer length
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SuperMer {
    /// Index of the first k-mer (equal to its first base) in the scanned run
    pub start: usize,
    /// Number of k-mers in the super-mer
    pub num_kmers: usize,
    /// Minimizer value shared by all its k-mers
    pub minimizer: u64,
    /// Start of the minimizer occurrence in the scanned run
    pub minimizer_pos: usize,
}

impl SuperMer {
    /// Number of bases spanned for k-mer length `k`
    pub fn num_bases(&self, k: usize) -> usize {
        self.num_kmers + k - 1
    }
}

/// Sliding-window minimizer scanner over runs of A/C/G/T base codes
pub struct MinimizerScanner {
    k: usize,
    m: usize,
    ring: Vec<Minimizer>,
    ring_mask: usize,
    hasher: DeterministicHasher,
}

impl MinimizerScanner {
    /// Create a scanner for k-mers of length `k` and minimizers of length `m`
    ///
    /// # Panics
    /// If `m` is 0, above 32 or above `k`, or if `ring_len` is not a power of
    /// two larger than `k - m`.
    pub fn new(k: usize, m: usize, ring_len: usize) -> Self {
        assert!(m > 0 && m <= 32 && m <= k, "minimizer length must be in 1..=min(k, 32)");
        assert!(
            ring_len.is_power_of_two() && ring_len > k - m,
            "ring length must be a power of two holding a full window"
        );
        Self {
            k,
            m,
            ring: vec![Minimizer::default(); ring_len],
            ring_mask: ring_len - 1,
            hasher: DeterministicHasher::for_minimizers(),
        }
    }

    /// k-mer length
    pub fn k(&self) -> usize {
        self.k
    }

    /// Minimizer length
    pub fn m(&self) -> usize {
        self.m
    }

    /// Call `visit(kmer_start, minimizer)` for every k-mer of `codes`, in order.
    ///
    /// Every code must be below 4; runs shorter than k produce nothing.
    pub fn scan<F>(&mut self, codes: &[u8], mut visit: F)
    where
        F: FnMut(usize, Minimizer),
    {
        let (k, m) = (self.k, self.m);
        if codes.len() < k {
            return;
        }

        let mmer_mask = if m == 32 { u64::MAX } else { (1u64 << (2 * m)) - 1 };
        let rc_shift = 2 * (m - 1);
        let mut fwd = 0u64;
        let mut rc = 0u64;
        let mut best: Option<Minimizer> = None;

        for (j, &code) in codes.iter().enumerate() {
            debug_assert!(code < 4, "scanner fed a non-ACGT code");
            let code = code as u64;
            fwd = ((fwd << 2) | code) & mmer_mask;
            rc = (rc >> 2) | ((3 - code) << rc_shift);
            if j + 1 < m {
                continue;
            }

            let pos = j + 1 - m;
            let value = fwd.min(rc);
            let current = Minimizer {
                value,
                pos,
                hash: self.hasher.hash_u64(value),
            };
            self.ring[pos & self.ring_mask] = current;
            if j + 1 < k {
                continue;
            }

            let start = j + 1 - k;
            let next = match best {
                Some(b) if b.pos >= start => {
                    if current.hash < b.hash {
                        current
                    } else {
                        b
                    }
                }
                _ => self.rescan(start, start + k - m),
            };
            best = Some(next);
            visit(start, next);
        }
    }

    /// Leftmost smallest-hash m-mer among positions `lo..=hi`
    fn rescan(&self, lo: usize, hi: usize) -> Minimizer {
        let mut best = self.ring[lo & self.ring_mask];
        for pos in lo + 1..=hi {
            let candidate = self.ring[pos & self.ring_mask];
            if candidate.hash < best.hash {
                best = candidate;
            }
        }
        best
    }

    /// Segment `codes` into super-mers of at most `max_kmers` k-mers each.
    ///
    /// `out` is cleared first. Super-mers are returned in order and together
    /// cover every k-mer of the run exactly once.
    pub fn super_mers(&mut self, codes: &[u8], max_kmers: usize, out: &mut Vec<SuperMer>) {
        out.clear();
        let max_kmers = max_kmers.max(1);
        let mut current: Option<SuperMer> = None;

        self.scan(codes, |start, mini| match current.as_mut() {
            Some(sm) if sm.minimizer_pos == mini.pos && sm.num_kmers < max_kmers => {
                sm.num_kmers += 1;
            }
            _ => {
                if let Some(done) = current.take() {
                    out.push(done);
                }
                current = Some(SuperMer {
                    start,
                    num_kmers: 1,
                    minimizer: mini.value,
                    minimizer_pos: mini.pos,
                });
            }
        });

        if let Some(done) = current {
            out.push(done);
        }
    }
}

/// Split a code sequence into maximal runs of A/C/G/T (codes below 4) that
/// are at least `min_len` long, as `(start, end)` ranges
pub fn valid_runs(codes: &[u8], min_len: usize) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start = 0;
    for (i, &code) in codes.iter().enumerate() {
        if code >= 4 {
            if i - start >= min_len {
                runs.push((start, i));
            }
            start = i + 1;
        }
    }
    if codes.len() >= start + min_len {
        runs.push((start, codes.len()));
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{encode_base, reverse_complement};

    fn codes(s: &str) -> Vec<u8> {
        s.bytes().map(|b| encode_base(b).unwrap()).collect()
    }

    fn pseudo_random_codes(len: usize, mut state: u64) -> Vec<u8> {
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8 & 3
            })
            .collect()
    }

    fn brute_force_minimizer(codes: &[u8], start: usize, k: usize, m: usize) -> u64 {
        let hasher = DeterministicHasher::for_minimizers();
        (start..=start + k - m)
            .map(|p| {
                let fwd = codes[p..p + m].iter().fold(0u64, |acc, &c| (acc << 2) | c as u64);
                let rc = reverse_complement(fwd as u128, m) as u64;
                fwd.min(rc)
            })
            .min_by_key(|&v| hasher.hash_u64(v))
            .unwrap()
    }

    #[test]
    fn test_scan_matches_brute_force() {
        let (k, m) = (21, 7);
        let seq = pseudo_random_codes(500, 7);
        let mut scanner = MinimizerScanner::new(k, m, 32);
        let mut seen = 0;
        scanner.scan(&seq, |start, mini| {
            assert_eq!(start, seen);
            assert_eq!(mini.value, brute_force_minimizer(&seq, start, k, m));
            seen += 1;
        });
        assert_eq!(seen, 500 - k + 1);
    }

    #[test]
    fn test_short_run_yields_nothing() {
        let mut scanner = MinimizerScanner::new(5, 3, 8);
        let mut called = false;
        scanner.scan(&codes("ACGT"), |_, _| called = true);
        assert!(!called);
    }

    #[test]
    fn test_minimizer_is_strand_independent() {
        let (k, m) = (15, 5);
        let seq = pseudo_random_codes(15, 3);
        let rc: Vec<u8> = seq.iter().rev().map(|&c| 3 - c).collect();

        let mut scanner = MinimizerScanner::new(k, m, 16);
        let mut fwd_min = 0;
        scanner.scan(&seq, |_, mini| fwd_min = mini.value);
        let mut rc_min = 1;
        scanner.scan(&rc, |_, mini| rc_min = mini.value);
        assert_eq!(fwd_min, rc_min);
    }

    #[test]
    fn test_super_mers_cover_run_and_respect_bound() {
        let (k, m) = (31, 9);
        let max = k - m + 1;
        let seq = pseudo_random_codes(2_000, 11);
        let mut scanner = MinimizerScanner::new(k, m, 32);
        let mut out = Vec::new();
        scanner.super_mers(&seq, max, &mut out);

        let mut next = 0;
        for sm in &out {
            assert_eq!(sm.start, next);
            assert!(sm.num_kmers >= 1 && sm.num_kmers <= max);
            next += sm.num_kmers;
        }
        assert_eq!(next, seq.len() - k + 1);
        assert!(out.len() < seq.len() - k + 1);
    }

    #[test]
    fn test_super_mers_cut_at_max_len() {
        let seq = codes(&"A".repeat(40));
        let mut scanner = MinimizerScanner::new(10, 3, 16);
        let mut out = Vec::new();
        scanner.super_mers(&seq, 4, &mut out);
        assert!(out.iter().all(|sm| sm.num_kmers <= 4));
        assert_eq!(out.iter().map(|sm| sm.num_kmers).sum::<usize>(), 31);
    }

    #[test]
    fn test_valid_runs() {
        let c = vec![0, 1, 4, 2, 3, 0, 1, 5, 2, 2, 2];
        assert_eq!(valid_runs(&c, 2), vec![(0, 2), (3, 7), (8, 11)]);
        assert_eq!(valid_runs(&c, 4), vec![(3, 7)]);
        assert!(valid_runs(&[4, 4], 1).is_empty());
        assert_eq!(valid_runs(&[0, 1, 2], 3), vec![(0, 3)]);
    }
}
