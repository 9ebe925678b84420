//! MergeProfile: per-sequence k-mer count profiles
//!
//! The input is streamed again with the same preprocessing as Split. Every
//! sequence gets the count of each of its k-mers, looked up either in the
//! sorted partitions (the partition of a k-mer is the partition of its
//! super-mer, found from the same minimizer) or in a previously built table.
//! Positions whose k-mer spans an ambiguous base get count 0.
//!
//! A profile is a list of segments, one per super-mer plus runs of zeros,
//! encoded by [`encode_segment`]. Sequence `id` goes to shard `id % threads`;
//! `.{root}.pidx.{i}` holds the `u64` little-endian start offset of every
//! profile of shard `i` in `.{root}.prof.{i}`, followed by the shard size.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use rayon::prelude::*;
use tracing::{debug, info};

use super::{thread_pool, StageContext};
use crate::config::ProfileSource;
use crate::encoding::{kmer_mask, write_kmer, BASE_CODE};
use crate::error::{Error, Result};
use crate::hasher::Partitioner;
use crate::minimizer::{valid_runs, MinimizerScanner, SuperMer};
use crate::plan::PartitionPlan;
use crate::stub::ProfileStub;
use crate::tables::{encode_segment, record_count, KmerTable, RecordFile};

/// Bases collected before a batch is profiled
const BATCH_BASES: usize = 4 << 20;

/// Source of k-mer counts
trait CountIndex: Sync {
    /// Count of the canonical `kmer` whose super-mer has `minimizer`
    fn count(&self, kmer: u128, minimizer: u64) -> u16;
}

/// Counts from this run's sorted partitions
struct PartitionIndex {
    partitions: Vec<RecordFile>,
    partitioner: Partitioner,
    kmer_len: usize,
    kmer_bytes: usize,
}

impl PartitionIndex {
    fn open(ctx: &StageContext<'_>) -> Result<Self> {
        let plan = ctx.plan;
        let partitions = (0..ctx.files.partitions())
            .map(|p| RecordFile::open(&ctx.files.partition(p), 0, plan.kmer_word))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            partitions,
            partitioner: Partitioner::new(plan.partition_count),
            kmer_len: plan.kmer_len,
            kmer_bytes: plan.kmer_bytes,
        })
    }
}

impl CountIndex for PartitionIndex {
    fn count(&self, kmer: u128, minimizer: u64) -> u16 {
        let mut key = [0u8; 16];
        let key = &mut key[..self.kmer_bytes];
        write_kmer(kmer, self.kmer_len, key);
        let part = &self.partitions[self.partitioner.partition_of(minimizer)];
        part.find(key)
            .map_or(0, |i| record_count(part.record(i), self.kmer_bytes))
    }
}

impl CountIndex for KmerTable {
    fn count(&self, kmer: u128, _minimizer: u64) -> u16 {
        self.lookup(kmer)
    }
}

pub(super) fn run(ctx: &StageContext<'_>) -> Result<()> {
    let index: Box<dyn CountIndex> = match &ctx.config.profile {
        Some(ProfileSource::Table(stub)) => {
            info!("  Profiling against table {:?}", stub);
            Box::new(KmerTable::open_for(stub, ctx.plan.kmer_len)?)
        }
        _ => Box::new(PartitionIndex::open(ctx)?),
    };

    let num_shards = ctx.config.num_threads.max(1);
    let mut shards = (0..num_shards)
        .map(|i| ProfileShard::create(ctx.files.profile_shard(i), ctx.files.profile_index(i)))
        .collect::<Result<Vec<_>>>()?;

    let index = index.as_ref();
    let pool = thread_pool(ctx.config.num_threads)?;
    let mut batch: Vec<Vec<u8>> = Vec::new();
    let mut bases = 0;
    let mut next_id = 0usize;

    let mut flush = |batch: &mut Vec<Vec<u8>>, shards: &mut [ProfileShard]| -> Result<()> {
        let profiles = pool.install(|| profile_batch(batch, ctx.plan, index));
        for profile in profiles {
            shards[next_id % num_shards].push(&profile)?;
            next_id += 1;
        }
        batch.clear();
        Ok(())
    };

    ctx.input.for_each_sequence(ctx.config, |seq| {
        bases += seq.len();
        batch.push(seq.into_owned());
        if bases >= BATCH_BASES {
            flush(&mut batch, &mut shards)?;
            bases = 0;
        }
        Ok(true)
    })?;
    flush(&mut batch, &mut shards)?;

    let mut bytes = 0;
    for shard in shards {
        bytes += shard.finish()?;
    }
    ProfileStub {
        kmer_len: ctx.plan.kmer_len as i32,
        shards: num_shards as i32,
        plen_bytes: ctx.plan.plen_bytes as i32,
    }
    .write(&ctx.files.profile_stub())?;

    info!("  Wrote {} profiles ({} bytes)", next_id, bytes);
    Ok(())
}

fn profile_batch(batch: &[Vec<u8>], plan: &PartitionPlan, index: &dyn CountIndex) -> Vec<Vec<u8>> {
    batch
        .par_iter()
        .map_init(
            || ProfileBuilder::new(plan),
            |builder, seq| builder.build(seq, index),
        )
        .collect()
}

/// Encoded profile of one sequence, reusing its scratch buffers across calls
struct ProfileBuilder<'a> {
    plan: &'a PartitionPlan,
    scanner: MinimizerScanner,
    codes: Vec<u8>,
    super_mers: Vec<SuperMer>,
    counts: Vec<u16>,
}

impl<'a> ProfileBuilder<'a> {
    fn new(plan: &'a PartitionPlan) -> Self {
        Self {
            plan,
            scanner: MinimizerScanner::new(plan.kmer_len, plan.minimizer_len, plan.ring_len),
            codes: Vec::new(),
            super_mers: Vec::new(),
            counts: Vec::new(),
        }
    }

    fn build(&mut self, seq: &[u8], index: &dyn CountIndex) -> Vec<u8> {
        let k = self.plan.kmer_len;
        let mut out = Vec::new();
        if seq.len() < k {
            return out;
        }
        self.codes.clear();
        self.codes.extend(seq.iter().map(|&b| BASE_CODE[b as usize]));

        let num_kmers = seq.len() - k + 1;
        let mut pos = 0;
        for (start, end) in valid_runs(&self.codes, k) {
            self.zeros(start - pos, &mut out);
            let run = &self.codes[start..end];
            self.scanner.super_mers(run, self.plan.max_super_len, &mut self.super_mers);
            for sm in &self.super_mers {
                fill_counts(run, sm, k, index, &mut self.counts);
                encode_segment(&self.counts, self.plan.plen_bytes, &mut out);
            }
            pos = end - k + 1;
        }
        self.zeros(num_kmers - pos, &mut out);
        out
    }

    /// Segments for `n` k-mers spanning an ambiguous base
    fn zeros(&self, n: usize, out: &mut Vec<u8>) {
        let max = self.plan.max_super_len.max(1);
        let mut left = n;
        while left > 0 {
            let len = left.min(max);
            encode_segment(&vec![0; len], self.plan.plen_bytes, out);
            left -= len;
        }
    }
}

fn fill_counts(run: &[u8], sm: &SuperMer, k: usize, index: &dyn CountIndex, counts: &mut Vec<u16>) {
    counts.clear();
    let mask = kmer_mask(k);
    let rc_shift = 2 * (k - 1);
    let (mut fwd, mut rc) = (0u128, 0u128);
    for (i, &code) in run[sm.start..sm.start + sm.num_bases(k)].iter().enumerate() {
        let code = code as u128;
        fwd = ((fwd << 2) | code) & mask;
        rc = (rc >> 2) | ((3 - code) << rc_shift);
        if i + 1 >= k {
            counts.push(index.count(fwd.min(rc), sm.minimizer));
        }
    }
}

/// One profile shard and its offset index
struct ProfileShard {
    data_path: PathBuf,
    index_path: PathBuf,
    data: BufWriter<File>,
    offsets: Vec<u64>,
    size: u64,
}

impl ProfileShard {
    fn create(data_path: PathBuf, index_path: PathBuf) -> Result<Self> {
        let file = File::create(&data_path).map_err(|e| Error::io(&data_path, e))?;
        Ok(Self {
            data: BufWriter::with_capacity(1 << 20, file),
            data_path,
            index_path,
            offsets: Vec::new(),
            size: 0,
        })
    }

    fn push(&mut self, profile: &[u8]) -> Result<()> {
        self.offsets.push(self.size);
        self.size += profile.len() as u64;
        self.data
            .write_all(profile)
            .map_err(|e| Error::io(&self.data_path, e))
    }

    /// Flush the data and write the index; returns the data size
    fn finish(mut self) -> Result<u64> {
        self.data.flush().map_err(|e| Error::io(&self.data_path, e))?;
        self.offsets.push(self.size);

        let file = File::create(&self.index_path).map_err(|e| Error::io(&self.index_path, e))?;
        let mut index = BufWriter::new(file);
        for offset in &self.offsets {
            index
                .write_all(&offset.to_le_bytes())
                .map_err(|e| Error::io(&self.index_path, e))?;
        }
        index.flush().map_err(|e| Error::io(&self.index_path, e))?;
        debug!(
            "  {:?}: {} profiles, {} bytes",
            self.data_path,
            self.offsets.len() - 1,
            self.size
        );
        Ok(self.size)
    }
}
