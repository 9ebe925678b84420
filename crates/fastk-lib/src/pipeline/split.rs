//! Split: distribute super-mers into partition buckets
//!
//! The calling thread streams the input and hands batches of sequences
//! round-robin to `threads` workers. Worker `t` owns the buckets `(t, p)` of
//! every partition `p`, so no file is shared between threads. Each super-mer
//! becomes one fixed-size record of `smer_word` bytes:
//!
//! ```text
//! [k-mer count: slen_bytes, little endian][bases: 2 bits each, MSB first, zero padded]
//! ```
//!
//! and goes to the bucket of its minimizer's partition.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, SyncSender};

use tracing::{debug, info};

use super::{join_worker, StageContext};
use crate::config::StageName;
use crate::encoding::{pack_codes, BASE_CODE};
use crate::error::{Error, Result};
use crate::hasher::Partitioner;
use crate::minimizer::{valid_runs, MinimizerScanner};

/// Bases per batch handed to a worker
const BATCH_BASES: usize = 1 << 20;

/// Batches in flight per worker
const CHANNEL_DEPTH: usize = 4;

/// Write buffer of one bucket file
const BUCKET_BUFFER: usize = 64 * 1024;

type Batch = Vec<Vec<u8>>;

/// Super-mers and k-mers written by a worker
#[derive(Debug, Default, Clone, Copy)]
struct SplitStats {
    super_mers: u64,
    kmers: u64,
}

/// Append-only bucket file
struct BucketWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    records: u64,
}

impl BucketWriter {
    fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path).map_err(|e| Error::io(&path, e))?;
        Ok(Self {
            writer: BufWriter::with_capacity(BUCKET_BUFFER, file),
            path,
            records: 0,
        })
    }

    fn push(&mut self, record: &[u8]) -> Result<()> {
        self.records += 1;
        self.writer.write_all(record).map_err(|e| Error::io(&self.path, e))
    }

    fn finish(mut self) -> Result<u64> {
        self.writer.flush().map_err(|e| Error::io(&self.path, e))?;
        Ok(self.records)
    }
}

pub(super) fn run(ctx: &StageContext<'_>) -> Result<()> {
    let threads = ctx.files.split_threads();
    ctx.files.write_plan(ctx.plan)?;

    let (senders, receivers): (Vec<SyncSender<Batch>>, Vec<Receiver<Batch>>) =
        (0..threads).map(|_| mpsc::sync_channel(CHANNEL_DEPTH)).unzip();

    let stats = std::thread::scope(|scope| -> Result<SplitStats> {
        let handles: Vec<_> = receivers
            .into_iter()
            .enumerate()
            .map(|(t, rx)| scope.spawn(move || split_worker(ctx, t, rx)))
            .collect();

        let read = distribute(ctx, senders);

        let mut total = SplitStats::default();
        let mut failure = None;
        for handle in handles {
            match join_worker(handle, StageName::Split) {
                Ok(s) => {
                    total.super_mers += s.super_mers;
                    total.kmers += s.kmers;
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        read?;
        match failure {
            Some(e) => Err(e),
            None => Ok(total),
        }
    })?;

    info!(
        "  Split {} k-mers into {} super-mers ({:.2} k-mers per super-mer)",
        stats.kmers,
        stats.super_mers,
        stats.kmers as f64 / stats.super_mers.max(1) as f64
    );
    Ok(())
}

/// Stream the input into batches, round-robin over the workers.
///
/// Stops early if a worker hung up; the worker reports its own error.
fn distribute(ctx: &StageContext<'_>, senders: Vec<SyncSender<Batch>>) -> Result<()> {
    let k = ctx.plan.kmer_len;
    let mut batch = Batch::new();
    let mut bases = 0;
    let mut next = 0;
    let mut hung_up = false;

    ctx.input.for_each_sequence(ctx.config, |seq| {
        if seq.len() < k {
            return Ok(true);
        }
        bases += seq.len();
        batch.push(seq.into_owned());
        if bases >= BATCH_BASES {
            if senders[next].send(std::mem::take(&mut batch)).is_err() {
                hung_up = true;
                return Ok(false);
            }
            next = (next + 1) % senders.len();
            bases = 0;
        }
        Ok(true)
    })?;

    if !hung_up && !batch.is_empty() {
        // A send error means the worker failed; join reports it
        let _ = senders[next].send(batch);
    }
    Ok(())
}

fn split_worker(ctx: &StageContext<'_>, thread: usize, batches: Receiver<Batch>) -> Result<SplitStats> {
    let plan = ctx.plan;
    let k = plan.kmer_len;
    let mut buckets = (0..plan.partition_count)
        .map(|p| BucketWriter::create(ctx.files.bucket(thread, p)))
        .collect::<Result<Vec<_>>>()?;

    let partitioner = Partitioner::new(plan.partition_count);
    let mut scanner = MinimizerScanner::new(k, plan.minimizer_len, plan.ring_len);
    let mut super_mers = Vec::new();
    let mut codes = Vec::new();
    let mut record = vec![0u8; plan.smer_word];
    let mut stats = SplitStats::default();

    for batch in batches {
        for seq in &batch {
            codes.clear();
            codes.extend(seq.iter().map(|&b| BASE_CODE[b as usize]));
            for (start, end) in valid_runs(&codes, k) {
                let run = &codes[start..end];
                scanner.super_mers(run, plan.max_super_len, &mut super_mers);
                for sm in &super_mers {
                    record.fill(0);
                    plan.encode_super_len(sm.num_kmers, &mut record[..plan.slen_bytes]);
                    let bases = &run[sm.start..sm.start + sm.num_bases(k)];
                    pack_codes(bases, &mut record[plan.slen_bytes..]);
                    buckets[partitioner.partition_of(sm.minimizer)].push(&record)?;

                    stats.super_mers += 1;
                    stats.kmers += sm.num_kmers as u64;
                }
            }
        }
    }

    let mut written = 0;
    for bucket in buckets {
        written += bucket.finish()?;
    }
    debug!("  Split worker {} wrote {} super-mers", thread, written);
    Ok(stats)
}
