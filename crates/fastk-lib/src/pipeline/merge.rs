//! MergeTable: k-way merge of the sorted partitions into a k-mer table
//!
//! Partitions cover disjoint sets of k-mers but interleave in k-mer order,
//! so they are merged: a linear scan over the heads for up to 16 inputs,
//! a loser tree above that. Entries with count >= cutoff go to one of
//! `threads` shards by their first packed byte, which keeps every shard a
//! contiguous, sorted k-mer range.
//!
//! Shard `i` is `.{root}.ktab.{i}`: a native-endian `i32` k and `i64` entry
//! count, then `table_word`-byte records in the sorted-partition layout.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::{debug, info};

use super::StageContext;
use crate::error::{Error, Result};
use crate::stub::TableStub;
use crate::tables::{record_count, RecordFile};

pub(super) fn run(ctx: &StageContext<'_>) -> Result<()> {
    let plan = ctx.plan;
    let cutoff = ctx.config.table_cutoff.unwrap_or(1).max(1);
    let num_shards = ctx.config.num_threads.max(1);

    let inputs = (0..ctx.files.partitions())
        .map(|p| RecordFile::open(&ctx.files.partition(p), 0, plan.kmer_word))
        .collect::<Result<Vec<_>>>()?;
    let mut merger = MergingIterator::new(inputs, plan.kmer_bytes);

    let mut shards = (0..num_shards)
        .map(|i| ShardWriter::create(ctx.files.table_shard(i), plan.kmer_len))
        .collect::<Result<Vec<_>>>()?;

    let (mut seen, mut kept) = (0u64, 0u64);
    while let Some(record) = merger.current() {
        seen += 1;
        if record_count(record, plan.kmer_bytes) as u32 >= cutoff {
            let shard = record[0] as usize * num_shards / 256;
            shards[shard].push(&record[..plan.table_word])?;
            kept += 1;
        }
        merger.advance();
    }

    for shard in shards {
        shard.finish()?;
    }
    TableStub {
        kmer_len: plan.kmer_len as i32,
        shards: num_shards as i32,
        cutoff: cutoff as i32,
    }
    .write(&ctx.files.table_stub())?;

    info!(
        "  Table holds {} of {} distinct k-mers (count >= {})",
        kept, seen, cutoff
    );
    Ok(())
}

/// One table shard being written; the entry count is patched in at the end
struct ShardWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    entries: i64,
}

impl ShardWriter {
    fn create(path: PathBuf, k: usize) -> Result<Self> {
        let file = File::create(&path).map_err(|e| Error::io(&path, e))?;
        let mut writer = BufWriter::with_capacity(1 << 20, file);
        writer
            .write_all(&(k as i32).to_ne_bytes())
            .and_then(|_| writer.write_all(&0i64.to_ne_bytes()))
            .map_err(|e| Error::io(&path, e))?;
        Ok(Self {
            path,
            writer,
            entries: 0,
        })
    }

    fn push(&mut self, record: &[u8]) -> Result<()> {
        self.entries += 1;
        self.writer.write_all(record).map_err(|e| Error::io(&self.path, e))
    }

    fn finish(self) -> Result<()> {
        let path = self.path;
        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| Error::io(&path, e.into_error()))?;
        file.seek(SeekFrom::Start(4))
            .and_then(|_| file.write_all(&self.entries.to_ne_bytes()))
            .map_err(|e| Error::io(&path, e))?;
        debug!("  {:?}: {} entries", path, self.entries);
        Ok(())
    }
}

/// Read position in one input
struct Run {
    file: RecordFile,
    pos: usize,
}

impl Run {
    #[inline]
    fn head(&self) -> &[u8] {
        self.file.record(self.pos)
    }

    fn exhausted(&self) -> bool {
        self.pos >= self.file.len()
    }
}

/// K-way merge over sorted record files, ordered by the first `key_len`
/// bytes of each record
///
/// For <= 16 inputs: linear scan over the heads.
/// For > 16 inputs: loser tree (O(log N) per record).
struct MergingIterator {
    runs: Vec<Run>,
    key_len: usize,
    /// Loser tree (only used for > 16 inputs); leaves hold run indexes and
    /// `u32::MAX` marks an exhausted leaf
    tree: Vec<u32>,
    tree_begin: usize,
    tree_size: usize,
    min_idx: usize,
    num_active: usize,
}

impl MergingIterator {
    const SCAN_THRESHOLD: usize = 16;

    fn new(inputs: Vec<RecordFile>, key_len: usize) -> Self {
        let runs: Vec<Run> = inputs
            .into_iter()
            .filter(|f| !f.is_empty())
            .map(|file| Run { file, pos: 0 })
            .collect();
        let n = runs.len();

        let mut merger = Self {
            runs,
            key_len,
            tree: Vec::new(),
            tree_begin: 0,
            tree_size: 0,
            min_idx: 0,
            num_active: n,
        };

        if n == 0 {
            return merger;
        }
        if n <= Self::SCAN_THRESHOLD {
            merger.compute_min_linear();
        } else {
            let m = 2 * n - 1;
            merger.tree_size = n;
            merger.tree.resize(m, 0);
            merger.tree_begin = n.next_power_of_two() - 1;

            let mut i = 0;
            while merger.tree_begin + i < m {
                merger.tree[merger.tree_begin + i] = i as u32;
                i += 1;
            }
            let mut j = 0;
            while i < n {
                merger.tree[n - 1 + j] = i as u32;
                i += 1;
                j += 1;
            }

            merger.build_tree(0);
            merger.min_idx = merger.tree[0] as usize;
        }
        merger
    }

    /// Smallest remaining record, `None` once every input is exhausted
    fn current(&self) -> Option<&[u8]> {
        (self.num_active > 0).then(|| self.runs[self.min_idx].head())
    }

    fn advance(&mut self) {
        if self.num_active == 0 {
            return;
        }
        if self.tree_size == 0 {
            self.update_linear();
        } else {
            self.update_loser_tree();
        }
    }

    #[inline]
    fn key(&self, run: usize) -> &[u8] {
        &self.runs[run].head()[..self.key_len]
    }

    fn update_linear(&mut self) {
        let run = &mut self.runs[self.min_idx];
        run.pos += 1;
        if run.exhausted() {
            self.runs.swap_remove(self.min_idx);
            self.num_active -= 1;
            if self.num_active == 0 {
                return;
            }
        }
        self.compute_min_linear();
    }

    fn compute_min_linear(&mut self) {
        self.min_idx = 0;
        for i in 1..self.runs.len() {
            if self.key(i) < self.key(self.min_idx) {
                self.min_idx = i;
            }
        }
    }

    fn winner(&self, l: u32, r: u32) -> u32 {
        if l == u32::MAX {
            r
        } else if r == u32::MAX {
            l
        } else if self.key(l as usize) < self.key(r as usize) {
            l
        } else {
            r
        }
    }

    fn update_loser_tree(&mut self) {
        self.min_idx = self.tree[0] as usize;
        let run = &mut self.runs[self.min_idx];
        run.pos += 1;
        let exhausted = run.exhausted();

        let mut p = self.tree_begin + self.min_idx;
        if p >= self.tree.len() {
            p -= self.tree_size;
        }
        if exhausted {
            self.tree[p] = u32::MAX;
            self.num_active -= 1;
        }

        while p > 0 {
            let is_right_child = (p & 1) == 0;
            let sibling = if is_right_child { p - 1 } else { p + 1 };
            let (l, r) = if is_right_child {
                (self.tree[sibling], self.tree[p])
            } else {
                (self.tree[p], self.tree[sibling])
            };
            let parent = (p - 1) / 2;
            self.tree[parent] = self.winner(l, r);
            p = parent;
        }

        if self.tree[0] != u32::MAX {
            self.min_idx = self.tree[0] as usize;
        }
    }

    fn build_tree(&mut self, p: usize) -> u32 {
        if p >= self.tree.len() {
            return u32::MAX;
        }
        if p >= self.tree_size - 1 {
            return self.tree[p];
        }
        let l = self.build_tree(2 * p + 1);
        let r = self.build_tree(2 * p + 2);
        let winner = self.winner(l, r);
        self.tree[p] = winner;
        winner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::fill_record;
    use std::fs;
    use tempfile::TempDir;

    const K: usize = 8;
    const WORD: usize = 4;

    fn write_run(dir: &TempDir, name: &str, kmers: &[u128]) -> RecordFile {
        let mut bytes = Vec::new();
        for &kmer in kmers {
            let mut record = [0u8; WORD];
            fill_record(kmer, K, kmer as u64 % 7 + 1, &mut record);
            bytes.extend_from_slice(&record);
        }
        let path = dir.path().join(name);
        fs::write(&path, bytes).unwrap();
        RecordFile::open(&path, 0, WORD).unwrap()
    }

    fn merge_all(num_runs: usize) {
        let dir = TempDir::new().unwrap();
        let mut expected = Vec::new();
        let inputs: Vec<RecordFile> = (0..num_runs)
            .map(|r| {
                let kmers: Vec<u128> = (0..50u128)
                    .map(|i| (i * 97 + r as u128 * 13) % 65_536)
                    .filter(|v| *v as usize % num_runs == r)
                    .collect::<std::collections::BTreeSet<_>>()
                    .into_iter()
                    .collect();
                expected.extend_from_slice(&kmers);
                write_run(&dir, &format!("run{r}"), &kmers)
            })
            .collect();
        expected.sort_unstable();

        let mut merger = MergingIterator::new(inputs, 2);
        let mut merged = Vec::new();
        while let Some(record) = merger.current() {
            merged.push(crate::encoding::read_kmer(&record[..2], K));
            merger.advance();
        }
        assert_eq!(merged, expected);
    }

    #[test]
    fn test_linear_merge() {
        merge_all(1);
        merge_all(5);
        merge_all(16);
    }

    #[test]
    fn test_loser_tree_merge() {
        merge_all(17);
        merge_all(40);
    }

    #[test]
    fn test_empty_inputs() {
        let dir = TempDir::new().unwrap();
        let inputs = vec![write_run(&dir, "a", &[]), write_run(&dir, "b", &[3, 9])];
        let mut merger = MergingIterator::new(inputs, 2);
        assert!(merger.current().is_some());
        merger.advance();
        merger.advance();
        assert!(merger.current().is_none());
        assert!(MergingIterator::new(Vec::new(), 2).current().is_none());
    }
}
