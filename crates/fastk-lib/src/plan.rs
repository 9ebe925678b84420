//! Partition and encoding plan
//!
//! [`LayoutPlanner`] derives, once per run, the number of partitions and
//! every bit and byte width that Split, Sort and the merges use to encode
//! k-mers and super-mers. The resulting [`PartitionPlan`] is immutable and
//! handed to every stage by reference; a stage never recomputes a width.
//!
//! The plan is also persisted next to the scratch files (see
//! [`PartitionPlan::write`]) so that a single-stage restart can check that
//! the files on disk were written with the layout it is about to assume.

use std::io::{self, Read, Write};

use tracing::info;

use crate::config::RunConfig;
use crate::constants::{bits_to_hold, is_valid_k};
use crate::encoding::{packed_len, read_uint_le, write_uint_le};
use crate::error::{Error, Result};
use crate::sample::{InputSample, SampleStats};
use crate::scheme::SchemeSelector;

/// Magic bytes of a persisted plan
const MAGIC: &[u8; 8] = b"FKPLAN01";

/// Number of u64 fields following the magic
const NUM_FIELDS: usize = 17;

/// Binary layout shared by every stage of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct PartitionPlan {
    /// K-mer length
    pub kmer_len: usize,
    /// Bytes of a packed k-mer: `ceil(2k / 8)`
    pub kmer_bytes: usize,
    /// Bytes of a sorted-partition record (packed k-mer plus auxiliary field)
    pub kmer_word: usize,
    /// Bytes of a table record
    pub table_word: usize,
    /// Number of partitions (buckets), at least 1
    pub partition_count: usize,
    /// Minimizer ring-buffer length: smallest power of two above k
    pub ring_len: usize,
    /// `ring_len - 1`
    pub ring_mask: usize,
    /// Maximum number of k-mers in one super-mer
    pub max_super_len: usize,
    /// Maximum number of bases in one super-mer: `max_super_len + k - 1`
    pub super_seq_len: usize,
    /// Bits of the super-mer length field
    pub slen_bits: usize,
    /// `2^slen_bits - 1`
    pub slen_mask: u64,
    /// Bytes of the super-mer length field
    pub slen_bytes: usize,
    /// Bytes of the packed bases of a longest super-mer
    pub smer_bytes: usize,
    /// Bytes of a super-mer record: length field plus packed bases
    pub smer_word: usize,
    /// Bytes of the length prefix of a profile segment
    pub plen_bytes: usize,
    /// Minimizer length used by Split and MergeProfile
    pub minimizer_len: usize,
    /// Bytes of the auxiliary (count) field of k-mer and table records
    pub aux_bytes: usize,
}

impl PartitionPlan {
    /// Derive every width from its inputs.
    ///
    /// `max_super_len` is raised to 1 if zero.
    pub fn from_parts(
        k: usize,
        aux_bytes: usize,
        partition_count: usize,
        max_super_len: usize,
        minimizer_len: usize,
    ) -> Self {
        let max_super_len = max_super_len.max(1);
        let kmer_bytes = packed_len(k);
        let ring_len = ring_length(k);
        let super_seq_len = max_super_len + k - 1;
        let slen_bits = bits_to_hold(max_super_len as u64);
        let slen_bytes = slen_bits.div_ceil(8);
        let smer_bytes = packed_len(super_seq_len);

        Self {
            kmer_len: k,
            kmer_bytes,
            kmer_word: kmer_bytes + aux_bytes,
            table_word: kmer_bytes + aux_bytes,
            partition_count: partition_count.max(1),
            ring_len,
            ring_mask: ring_len - 1,
            max_super_len,
            super_seq_len,
            slen_bits,
            slen_mask: (1u64 << slen_bits) - 1,
            slen_bytes,
            smer_bytes,
            smer_word: smer_bytes + slen_bytes,
            plen_bytes: (slen_bits + 8).div_ceil(8),
            minimizer_len,
            aux_bytes,
        }
    }

    /// Store a super-mer length (`0..=max_super_len`) in `slen_bytes` bytes
    #[inline]
    pub fn encode_super_len(&self, len: usize, out: &mut [u8]) {
        debug_assert!(len <= self.max_super_len);
        write_uint_le(len as u64 & self.slen_mask, &mut out[..self.slen_bytes]);
    }

    /// Inverse of [`encode_super_len`](Self::encode_super_len)
    #[inline]
    pub fn decode_super_len(&self, bytes: &[u8]) -> usize {
        (read_uint_le(&bytes[..self.slen_bytes]) & self.slen_mask) as usize
    }

    /// Largest profile segment payload the length prefix can describe
    pub fn max_segment_bytes(&self) -> u64 {
        if self.plen_bytes >= 8 {
            u64::MAX
        } else {
            (1u64 << (8 * self.plen_bytes)) - 1
        }
    }

    fn fields(&self) -> [u64; NUM_FIELDS] {
        [
            self.kmer_len as u64,
            self.kmer_bytes as u64,
            self.kmer_word as u64,
            self.table_word as u64,
            self.partition_count as u64,
            self.ring_len as u64,
            self.ring_mask as u64,
            self.max_super_len as u64,
            self.super_seq_len as u64,
            self.slen_bits as u64,
            self.slen_mask,
            self.slen_bytes as u64,
            self.smer_bytes as u64,
            self.smer_word as u64,
            self.plen_bytes as u64,
            self.minimizer_len as u64,
            self.aux_bytes as u64,
        ]
    }

    /// Write the plan in its persisted form
    pub fn write(&self, writer: &mut dyn Write) -> io::Result<()> {
        writer.write_all(MAGIC)?;
        for field in self.fields() {
            writer.write_all(&field.to_le_bytes())?;
        }
        Ok(())
    }

    /// Read a persisted plan, checking that its widths are consistent
    pub fn read(reader: &mut dyn Read) -> io::Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid magic number for a fastk plan file",
            ));
        }

        let mut fields = [0u64; NUM_FIELDS];
        let mut buf = [0u8; 8];
        for field in fields.iter_mut() {
            reader.read_exact(&mut buf)?;
            *field = u64::from_le_bytes(buf);
        }

        let k = fields[0] as usize;
        if !is_valid_k(k) || fields[7] == 0 || fields[7] > u32::MAX as u64 || fields[15] as usize > k {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "plan fields out of range"));
        }
        let plan = Self::from_parts(
            k,
            fields[16] as usize,
            fields[4] as usize,
            fields[7] as usize,
            fields[15] as usize,
        );
        if plan.fields() != fields {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "plan widths are inconsistent",
            ));
        }
        Ok(plan)
    }
}

/// Smallest power of two strictly greater than `k`
#[inline]
pub fn ring_length(k: usize) -> usize {
    (k + 1).next_power_of_two()
}

/// Number of partitions needed to sort the projected workload in
/// `sort_memory` bytes per partition.
///
/// Fails if the reads are too short for `k`: once every record loses about
/// `k` bases of k-mer coverage, fewer than a third of the bases remain.
pub fn partition_count(
    stats: &SampleStats,
    k: usize,
    record_bytes: usize,
    sort_memory: u64,
) -> Result<usize> {
    let total = stats.total_bases as i128;
    let effective = total - k as i128 * stats.num_records as i128;
    if effective < total / 3 {
        return Err(Error::ReadsTooShort {
            total_bases: stats.total_bases,
            num_records: stats.num_records,
            k,
        });
    }

    let projected = effective as f64 * stats.ratio * record_bytes as f64;
    let parts = (projected / sort_memory.max(1) as f64).ceil();
    Ok((parts as usize).max(1))
}

/// Derives the [`PartitionPlan`] of a run
#[derive(Debug, Clone, Copy)]
pub struct LayoutPlanner {
    aux_bytes: usize,
}

impl LayoutPlanner {
    /// Planner for records carrying `aux_bytes` bytes next to each packed
    /// k-mer. The planner only adds them to the record widths.
    pub fn new(aux_bytes: usize) -> Self {
        Self { aux_bytes }
    }

    /// Compute the plan of a run from its configuration and input sample
    pub fn plan(
        &self,
        config: &RunConfig,
        sample: &InputSample,
        selector: &dyn SchemeSelector,
    ) -> Result<PartitionPlan> {
        let k = config.kmer_len;
        let record_bytes = packed_len(k) + self.aux_bytes;
        let parts = partition_count(&sample.stats, k, record_bytes, config.sort_memory)?;

        let stats = &sample.stats;
        let effective = stats.total_bases.saturating_sub(k as u64 * stats.num_records);
        let estimate = effective as f64 * stats.ratio;
        let (scaled, unit) = if estimate >= 5e8 {
            (estimate / 1e9, 'G')
        } else if estimate >= 5e5 {
            (estimate / 1e6, 'M')
        } else {
            (estimate / 1e3, 'K')
        };
        info!(
            "Estimate {:.3}{} {}-{}mers",
            scaled,
            unit,
            k,
            if config.compress { "hoco-" } else { "" }
        );
        if parts > 1 {
            info!("Dividing data into {} buckets", parts);
        } else {
            info!("Handling data in a single bucket");
        }

        let max_super_len = selector.select(sample, k)?;
        let plan = PartitionPlan::from_parts(
            k,
            self.aux_bytes,
            parts,
            max_super_len,
            selector.minimizer_len(k),
        );
        tracing::debug!(
            "Layout: kmer_word = {}, smer_word = {}, slen_bits = {}, plen_bytes = {}, ring = {}",
            plan.kmer_word,
            plan.smer_word,
            plan.slen_bits,
            plan.plen_bytes,
            plan.ring_len
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::RandomMinimizerScheme;

    fn stats(total_bases: u64, num_records: u64) -> SampleStats {
        SampleStats {
            total_bases,
            num_records,
            ratio: 1.0,
        }
    }

    #[test]
    fn test_kmer_bytes() {
        for k in 1..=64 {
            let plan = PartitionPlan::from_parts(k, 2, 1, 1, 1);
            assert_eq!(plan.kmer_bytes, k.div_ceil(4));
            assert_eq!(plan.kmer_word, plan.kmer_bytes + 2);
            assert_eq!(plan.table_word, plan.kmer_word);
        }
    }

    #[test]
    fn test_length_field_width() {
        for max in 1..=5_000usize {
            let plan = PartitionPlan::from_parts(31, 2, 1, max, 12);
            let n = plan.slen_bits;
            assert!((max as u64) < (1u64 << n));
            assert!(n == 1 || (max as u64) >= (1u64 << (n - 1)));
            assert_eq!(plan.slen_mask, (1u64 << n) - 1);
            assert_eq!(plan.slen_bytes, n.div_ceil(8));
        }
    }

    #[test]
    fn test_length_field_round_trip() {
        for max in [1usize, 25, 255, 256, 70_000] {
            let plan = PartitionPlan::from_parts(40, 2, 1, max, 12);
            let mut buf = vec![0u8; plan.slen_bytes];
            for v in (0..=max).step_by((max / 300).max(1)).chain([max]) {
                plan.encode_super_len(v, &mut buf);
                assert_eq!(plan.decode_super_len(&buf), v);
            }
        }
    }

    #[test]
    fn test_ring_length() {
        assert_eq!(ring_length(40), 64);
        assert_eq!(ring_length(64), 128);
        assert_eq!(ring_length(63), 64);
        assert_eq!(ring_length(1), 2);
        for k in 1..=64 {
            let ring = ring_length(k);
            assert!(ring.is_power_of_two() && ring > k && ring / 2 <= k);
        }
    }

    #[test]
    fn test_scenario_k40_max_super_25() {
        let plan = PartitionPlan::from_parts(40, 2, 3, 25, 12);
        assert_eq!(plan.super_seq_len, 64);
        assert_eq!(plan.slen_bits, 5);
        assert_eq!(plan.slen_bytes, 1);
        assert_eq!(plan.smer_bytes, 16);
        assert_eq!(plan.smer_word, 17);
        assert_eq!(plan.ring_len, 64);
        assert_eq!(plan.ring_mask, 63);
        assert_eq!(plan.plen_bytes, 2);
        assert_eq!(plan.kmer_word, 12);
    }

    #[test]
    fn test_reads_too_short() {
        let err = partition_count(&stats(3_000_000, 100_000), 40, 12, 1 << 30).unwrap_err();
        assert!(matches!(err, Error::ReadsTooShort { k: 40, .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);

        assert!(partition_count(&stats(3_000_000, 10_000), 40, 12, 1 << 30).is_ok());
    }

    #[test]
    fn test_partition_count_monotone_in_memory() {
        let s = SampleStats {
            total_bases: 1_000_000_000,
            num_records: 100_000,
            ratio: 3.5,
        };
        let mut previous = usize::MAX;
        for mem in (1..200u64).map(|i| i * 250_000_000) {
            let parts = partition_count(&s, 40, 12, mem).unwrap();
            assert!(parts >= 1);
            assert!(parts <= previous);
            previous = parts;
        }
        assert_eq!(partition_count(&stats(100, 1), 10, 5, u64::MAX).unwrap(), 1);
    }

    #[test]
    fn test_partition_count_value() {
        // 1e9 bases, 1e6 reads of k = 40: 9.6e8 effective, 12-byte records
        let parts = partition_count(&stats(1_000_000_000, 1_000_000), 40, 12, 1_000_000_000).unwrap();
        assert_eq!(parts, 12);
    }

    #[test]
    fn test_plan_persistence() {
        let plan = PartitionPlan::from_parts(21, 2, 7, 10, 9);
        let mut buf = Vec::new();
        plan.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 8 + 8 * NUM_FIELDS);
        let read = PartitionPlan::read(&mut buf.as_slice()).unwrap();
        assert_eq!(read, plan);

        buf[8 + 8 * 13] ^= 1;
        assert!(PartitionPlan::read(&mut buf.as_slice()).is_err());
        assert!(PartitionPlan::read(&mut &b"NOTAPLAN"[..]).is_err());
    }

    #[test]
    fn test_planner() {
        let seq = "ACGTTGCAAGCTAGCTAGGATCGATCGATTTAGCAGCGACTAGCATCAGCAGCATTACGGA".repeat(3);
        let sample = InputSample {
            stats: stats(seq.len() as u64, 1),
            reads: vec![seq.into_bytes()],
        };
        let config = RunConfig {
            kmer_len: 31,
            sort_memory: 1_000,
            ..RunConfig::for_sources(&["reads.fa"]).unwrap()
        };
        let plan = LayoutPlanner::new(2)
            .plan(&config, &sample, &RandomMinimizerScheme::new(12))
            .unwrap();
        assert_eq!(plan.kmer_len, 31);
        assert_eq!(plan.max_super_len, 20);
        assert_eq!(plan.super_seq_len, 50);
        assert_eq!(plan.minimizer_len, 12);
        // 183 - 31 = 152 effective bases, 10-byte records
        assert_eq!(plan.partition_count, 2);
    }
}
