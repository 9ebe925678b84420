//! Sort: turn each partition's super-mers into counted k-mers
//!
//! Partitions are handled one at a time so that only one partition's k-mers
//! are in memory; the buckets of a partition are expanded and sorted in
//! parallel on a rayon pool of `threads` threads. Equal canonical k-mers
//! collapse into one record of `kmer_word` bytes:
//!
//! ```text
//! [packed k-mer: kmer_bytes, MSB first][count: u16 little endian, saturated at 32767]
//! ```
//!
//! The sorted partition replaces the buckets, and the counts feed the run's
//! histogram.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;
use rayon::prelude::*;
use tracing::{debug, info};

use super::{thread_pool, StageContext};
use crate::config::ExecutionMode;
use crate::encoding::{kmer_mask, packed_code, read_kmer, write_kmer};
use crate::error::{Error, Result};
use crate::plan::PartitionPlan;
use crate::tables::{fill_record, Histogram};

/// Run `$body` with `$B` bound to the packed k-mer width as a constant
macro_rules! dispatch_on_kmer_bytes {
    ($bytes:expr, $B:ident => $body:expr) => {
        match $bytes {
            1 => { const $B: usize = 1; $body }
            2 => { const $B: usize = 2; $body }
            3 => { const $B: usize = 3; $body }
            4 => { const $B: usize = 4; $body }
            5 => { const $B: usize = 5; $body }
            6 => { const $B: usize = 6; $body }
            7 => { const $B: usize = 7; $body }
            8 => { const $B: usize = 8; $body }
            9 => { const $B: usize = 9; $body }
            10 => { const $B: usize = 10; $body }
            11 => { const $B: usize = 11; $body }
            12 => { const $B: usize = 12; $body }
            13 => { const $B: usize = 13; $body }
            14 => { const $B: usize = 14; $body }
            15 => { const $B: usize = 15; $body }
            16 => { const $B: usize = 16; $body }
            other => unreachable!("k-mers of {} packed bytes", other),
        }
    };
}

pub(super) fn run(ctx: &StageContext<'_>) -> Result<()> {
    let pool = thread_pool(ctx.config.num_threads)?;
    let mut histogram = Histogram::new(ctx.plan.kmer_len);
    let (mut total, mut distinct) = (0u64, 0u64);

    for p in 0..ctx.files.partitions() {
        let part = pool.install(|| {
            dispatch_on_kmer_bytes!(ctx.plan.kmer_bytes, B => sort_partition::<B>(ctx, p))
        })?;
        total += part.kmers;
        distinct += part.distinct;
        histogram.merge(&part.histogram);
    }

    histogram.write(&ctx.files.histogram())?;
    if ctx.config.mode == ExecutionMode::FullRun {
        ctx.files.remove_buckets()?;
    }
    info!(
        "  Counted {} k-mers, {} distinct, in {} partitions",
        total,
        distinct,
        ctx.files.partitions()
    );
    Ok(())
}

struct PartitionCounts {
    kmers: u64,
    distinct: u64,
    histogram: Histogram,
}

/// Sort and count one partition, holding each k-mer in `B` packed bytes
fn sort_partition<const B: usize>(ctx: &StageContext<'_>, partition: usize) -> Result<PartitionCounts> {
    let plan = ctx.plan;
    let buckets = ctx
        .files
        .partition_buckets(partition)
        .par_iter()
        .map(|path| Bucket::open(path, plan))
        .collect::<Result<Vec<_>>>()?;

    let mut kmers = expand_buckets::<B>(&buckets, plan);
    drop(buckets);
    kmers.par_sort_unstable();

    let path = ctx.files.partition(partition);
    let file = File::create(&path).map_err(|e| Error::io(&path, e))?;
    let mut writer = BufWriter::with_capacity(1 << 20, file);
    let mut record = vec![0u8; plan.kmer_word];
    let mut histogram = Histogram::new(plan.kmer_len);
    let mut distinct = 0u64;

    for run in kmers.chunk_by(|a, b| a == b) {
        let count = run.len() as u64;
        fill_record(read_kmer(&run[0], plan.kmer_len), plan.kmer_len, count, &mut record);
        writer.write_all(&record).map_err(|e| Error::io(&path, e))?;
        histogram.add(count);
        distinct += 1;
    }
    writer.flush().map_err(|e| Error::io(&path, e))?;

    debug!(
        "  Partition {}: {} k-mers, {} distinct",
        partition,
        kmers.len(),
        distinct
    );
    Ok(PartitionCounts {
        kmers: kmers.len() as u64,
        distinct,
        histogram,
    })
}

/// A mapped bucket file and the number of k-mers its super-mers hold
struct Bucket {
    map: Option<Mmap>,
    kmers: usize,
}

impl Bucket {
    /// Map a bucket and check every record's length field
    fn open(path: &Path, plan: &PartitionPlan) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let len = file.metadata().map_err(|e| Error::io(path, e))?.len() as usize;
        if len % plan.smer_word != 0 {
            return Err(Error::corrupt(
                path,
                format!("size {} is not a multiple of {}", len, plan.smer_word),
            ));
        }
        if len == 0 {
            return Ok(Self { map: None, kmers: 0 });
        }
        let map = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path, e))?;
        let kmers = count_kmers(path, &map, plan)?;
        Ok(Self {
            map: Some(map),
            kmers,
        })
    }

    fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }
}

fn count_kmers(path: &Path, bytes: &[u8], plan: &PartitionPlan) -> Result<usize> {
    let mut kmers = 0;
    for record in bytes.chunks_exact(plan.smer_word) {
        let n = plan.decode_super_len(record);
        if n == 0 || n > plan.max_super_len {
            return Err(Error::corrupt(path, format!("super-mer length {n} out of range")));
        }
        kmers += n;
    }
    Ok(kmers)
}

/// Canonical k-mers of every bucket, expanded in parallel into one buffer
/// sized exactly to the partition's k-mer count
fn expand_buckets<const B: usize>(buckets: &[Bucket], plan: &PartitionPlan) -> Vec<[u8; B]> {
    let total = buckets.iter().map(|b| b.kmers).sum::<usize>();
    let mut kmers = vec![[0u8; B]; total];

    let mut slices = Vec::with_capacity(buckets.len());
    let mut rest = kmers.as_mut_slice();
    for bucket in buckets {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(bucket.kmers);
        slices.push(head);
        rest = tail;
    }
    buckets
        .par_iter()
        .zip(slices.into_par_iter())
        .for_each(|(bucket, out)| expand_into(bucket.bytes(), plan, out));
    kmers
}

/// Expand the super-mer records of `bytes` into `out`, one canonical packed
/// k-mer per slot. Record lengths were checked by [`count_kmers`].
fn expand_into<const B: usize>(bytes: &[u8], plan: &PartitionPlan, out: &mut [[u8; B]]) {
    let k = plan.kmer_len;
    let mask = kmer_mask(k);
    let rc_shift = 2 * (k - 1);
    let mut slots = out.iter_mut();

    for record in bytes.chunks_exact(plan.smer_word) {
        let n = plan.decode_super_len(record);
        let bases = &record[plan.slen_bytes..];
        let (mut fwd, mut rc) = (0u128, 0u128);
        for i in 0..n + k - 1 {
            let code = packed_code(bases, i) as u128;
            fwd = ((fwd << 2) | code) & mask;
            rc = (rc >> 2) | ((3 - code) << rc_shift);
            if i + 1 >= k {
                if let Some(slot) = slots.next() {
                    write_kmer(fwd.min(rc), k, slot);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{canonical, kmer_from_str, pack_codes, BASE_CODE};
    use std::fs;
    use tempfile::TempDir;

    fn bucket_bytes(plan: &PartitionPlan, super_mers: &[(&str, usize)]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for &(seq, n) in super_mers {
            let mut record = vec![0u8; plan.smer_word];
            plan.encode_super_len(n, &mut record);
            let codes: Vec<u8> = seq.bytes().map(|b| BASE_CODE[b as usize]).collect();
            pack_codes(&codes, &mut record[plan.slen_bytes..]);
            bytes.extend_from_slice(&record);
        }
        bytes
    }

    fn packed(s: &str, k: usize) -> [u8; 1] {
        let mut out = [0u8; 1];
        write_kmer(canonical(kmer_from_str(s).unwrap(), k), k, &mut out);
        out
    }

    #[test]
    fn test_expand_buckets() {
        let dir = TempDir::new().unwrap();
        let plan = PartitionPlan::from_parts(4, 2, 1, 3, 2);
        assert_eq!(plan.smer_word, 3);
        assert_eq!(plan.kmer_bytes, 1);

        let first = dir.path().join("b0");
        let empty = dir.path().join("b1");
        let second = dir.path().join("b2");
        fs::write(&first, bucket_bytes(&plan, &[("ACGTTG", 3), ("GGGG", 1)])).unwrap();
        fs::write(&empty, b"").unwrap();
        fs::write(&second, bucket_bytes(&plan, &[("TTTTA", 2)])).unwrap();

        let buckets = [&first, &empty, &second]
            .iter()
            .map(|p| Bucket::open(p, &plan))
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(
            buckets.iter().map(|b| b.kmers).collect::<Vec<_>>(),
            vec![4, 0, 2]
        );

        let kmers = expand_buckets::<1>(&buckets, &plan);
        let expected: Vec<[u8; 1]> = ["ACGT", "CGTT", "GTTG", "GGGG", "TTTT", "TTTA"]
            .iter()
            .map(|s| packed(s, 4))
            .collect();
        assert_eq!(kmers, expected);
    }

    #[test]
    fn test_expanded_kmers_use_packed_width() {
        let dir = TempDir::new().unwrap();
        let plan = PartitionPlan::from_parts(4, 2, 1, 3, 2);
        let path = dir.path().join("bucket");
        let records: Vec<(&str, usize)> = vec![("ACGTTG", 3); 1000];
        fs::write(&path, bucket_bytes(&plan, &records)).unwrap();

        let buckets = vec![Bucket::open(&path, &plan).unwrap()];
        let kmers = expand_buckets::<1>(&buckets, &plan);
        assert_eq!(kmers.len(), 3000);
        assert_eq!(std::mem::size_of::<[u8; 1]>(), plan.kmer_bytes);
        assert!(kmers.capacity() * std::mem::size_of::<[u8; 1]>() <= plan.kmer_word * kmers.len());
    }

    #[test]
    fn test_rejects_corrupt_buckets() {
        let dir = TempDir::new().unwrap();
        let plan = PartitionPlan::from_parts(4, 2, 1, 3, 2);
        let path = dir.path().join("bucket");
        let bytes = bucket_bytes(&plan, &[("ACGTTG", 3), ("GGGG", 1)]);

        fs::write(&path, &bytes[..4]).unwrap();
        assert!(matches!(Bucket::open(&path, &plan), Err(Error::Corrupt { .. })));

        let mut bad = bytes.clone();
        plan.encode_super_len(0, &mut bad[..plan.smer_word]);
        fs::write(&path, &bad).unwrap();
        assert!(Bucket::open(&path, &plan).is_err());
    }
}
