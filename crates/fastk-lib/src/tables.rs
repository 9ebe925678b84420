//! Readers and writers of the run's output files
//!
//! - [`Histogram`]: number of distinct k-mers per count (`<root>.hist`)
//! - [`KmerTable`]: sorted (k-mer, count) table (`<root>.ktab` + shards)
//! - [`ProfileStore`]: per-sequence count profiles (`<root>.prof` + shards)
//!
//! Sorted partitions and table shards are read through [`RecordFile`], a
//! memory-mapped array of fixed-size records.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::constants::{HIST_HIGH, MAX_COUNT};
use crate::encoding::{canonical, packed_len, read_kmer, read_uint_le, write_kmer, write_uint_le};
use crate::error::{Error, Result};
use crate::files::table_shard_path;
use crate::pipeline::AUX_BYTES;
use crate::stub::{ProfileStub, TableStub};

/// Bytes before the first record of a table shard: `i32` k, `i64` count
pub const TABLE_SHARD_HEADER: usize = 12;

/// Escape byte of a profile segment: an absolute `u16` count follows
const SEGMENT_ESCAPE: u8 = 0x80;

/// A memory-mapped file of fixed-size records after an optional header
pub struct RecordFile {
    path: PathBuf,
    map: Option<Mmap>,
    header: usize,
    word: usize,
}

impl RecordFile {
    /// Map `path`, checking that the bytes after `header` are whole records
    pub fn open(path: &Path, header: usize, word: usize) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let len = file.metadata().map_err(|e| Error::io(path, e))?.len() as usize;
        if len < header || (len - header) % word != 0 {
            return Err(Error::corrupt(
                path,
                format!("size {len} is not a {header}-byte header plus {word}-byte records"),
            ));
        }
        let map = if len == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path, e))?)
        };
        Ok(Self {
            path: path.to_path_buf(),
            map,
            header,
            word,
        })
    }

    /// File path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header bytes
    pub fn header(&self) -> &[u8] {
        self.map.as_deref().map(|m| &m[..self.header]).unwrap_or(&[])
    }

    /// All record bytes
    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().map(|m| &m[self.header..]).unwrap_or(&[])
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.bytes().len() / self.word
    }

    /// Whether the file holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record `i`
    #[inline]
    pub fn record(&self, i: usize) -> &[u8] {
        &self.bytes()[i * self.word..(i + 1) * self.word]
    }

    /// Index of the record whose first `key.len()` bytes equal `key`.
    ///
    /// Records must be sorted by that prefix.
    pub fn find(&self, key: &[u8]) -> Option<usize> {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.record(mid)[..key.len()].cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(mid),
            }
        }
        None
    }
}

/// Count stored in the auxiliary field of a k-mer record
#[inline]
pub fn record_count(record: &[u8], kmer_bytes: usize) -> u16 {
    u16::from_le_bytes([record[kmer_bytes], record[kmer_bytes + 1]])
}

/// Fill a k-mer record: packed k-mer, then its count saturated at 32767
#[inline]
pub fn fill_record(kmer: u128, k: usize, count: u64, out: &mut [u8]) {
    let kmer_bytes = packed_len(k);
    write_kmer(kmer, k, &mut out[..kmer_bytes]);
    let count = count.min(MAX_COUNT as u64) as u16;
    out[kmer_bytes..kmer_bytes + AUX_BYTES].copy_from_slice(&count.to_le_bytes());
}

/// Distinct k-mers per count, `low..=high`; the last bin holds every count
/// at or above `high`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    kmer_len: i32,
    low: i32,
    high: i32,
    counts: Vec<i64>,
}

impl Histogram {
    /// Empty histogram over `1..=32767`
    pub fn new(k: usize) -> Self {
        Self {
            kmer_len: k as i32,
            low: 1,
            high: HIST_HIGH,
            counts: vec![0; HIST_HIGH as usize],
        }
    }

    /// Record one distinct k-mer seen `count` times
    #[inline]
    pub fn add(&mut self, count: u64) {
        let bin = count.clamp(self.low as u64, self.high as u64) - self.low as u64;
        self.counts[bin as usize] += 1;
    }

    /// Add every bin of `other`
    pub fn merge(&mut self, other: &Histogram) {
        for (a, b) in self.counts.iter_mut().zip(&other.counts) {
            *a += b;
        }
    }

    /// K-mer length
    pub fn kmer_len(&self) -> usize {
        self.kmer_len as usize
    }

    /// Distinct k-mers seen `count` times (`count >= high` for the last bin)
    pub fn get(&self, count: i32) -> i64 {
        if count < self.low {
            return 0;
        }
        self.counts[(count.min(self.high) - self.low) as usize]
    }

    /// Number of distinct k-mers
    pub fn distinct(&self) -> i64 {
        self.counts.iter().sum()
    }

    /// Number of k-mer occurrences, with the last bin counted at `high`
    pub fn total(&self) -> i64 {
        self.counts
            .iter()
            .enumerate()
            .map(|(i, &n)| (i as i64 + self.low as i64) * n)
            .sum()
    }

    /// Write `k, low, high` then one `i64` per bin, native endian
    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut writer = BufWriter::new(file);
        let mut put = |bytes: &[u8]| writer.write_all(bytes).map_err(|e| Error::io(path, e));
        put(&self.kmer_len.to_ne_bytes())?;
        put(&self.low.to_ne_bytes())?;
        put(&self.high.to_ne_bytes())?;
        for n in &self.counts {
            put(&n.to_ne_bytes())?;
        }
        writer.flush().map_err(|e| Error::io(path, e))
    }

    /// Read a histogram written by [`write`](Self::write)
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
        if bytes.len() < 12 {
            return Err(Error::corrupt(path, "truncated histogram header"));
        }
        let int = |i: usize| i32::from_ne_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let (kmer_len, low, high) = (int(0), int(4), int(8));
        if low < 1 || high < low || bytes.len() != 12 + 8 * (high - low + 1) as usize {
            return Err(Error::corrupt(path, "histogram size does not match its range"));
        }
        let counts = bytes[12..]
            .chunks_exact(8)
            .map(|c| i64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        Ok(Self {
            kmer_len,
            low,
            high,
            counts,
        })
    }
}

/// A k-mer table opened from its stub
pub struct KmerTable {
    stub: TableStub,
    shards: Vec<RecordFile>,
    kmer_bytes: usize,
}

impl KmerTable {
    /// Open the table described by the stub at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let stub = TableStub::read(path)?;
        Self::with_stub(path, stub)
    }

    /// Open a table, checking that it holds k-mers of length `k`
    pub fn open_for(path: &Path, k: usize) -> Result<Self> {
        let stub = TableStub::read_for(path, k)?;
        Self::with_stub(path, stub)
    }

    fn with_stub(path: &Path, stub: TableStub) -> Result<Self> {
        if !(1..=64).contains(&stub.kmer_len) {
            return Err(Error::BadStub {
                path: path.to_path_buf(),
                reason: format!("invalid k-mer length {}", stub.kmer_len),
            });
        }
        let kmer_bytes = packed_len(stub.kmer_len as usize);
        let mut shards = Vec::with_capacity(stub.shards as usize);
        for i in 0..stub.shards as usize {
            let shard_path = table_shard_path(path, i);
            let shard = RecordFile::open(&shard_path, TABLE_SHARD_HEADER, kmer_bytes + AUX_BYTES)?;
            let header = shard.header();
            if header.len() != TABLE_SHARD_HEADER {
                return Err(Error::corrupt(&shard_path, "missing shard header"));
            }
            let k = i32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
            let mut n = [0u8; 8];
            n.copy_from_slice(&header[4..12]);
            if k != stub.kmer_len || i64::from_ne_bytes(n) != shard.len() as i64 {
                return Err(Error::corrupt(&shard_path, "shard header does not match its stub"));
            }
            shards.push(shard);
        }
        Ok(Self {
            stub,
            shards,
            kmer_bytes,
        })
    }

    /// K-mer length
    pub fn kmer_len(&self) -> usize {
        self.stub.kmer_len as usize
    }

    /// Smallest count kept
    pub fn cutoff(&self) -> u32 {
        self.stub.cutoff.max(0) as u32
    }

    /// Number of shards
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Number of k-mers
    pub fn len(&self) -> usize {
        self.shards.iter().map(RecordFile::len).sum()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries in ascending k-mer order
    pub fn iter(&self) -> impl Iterator<Item = (u128, u16)> + '_ {
        let k = self.kmer_len();
        self.shards.iter().flat_map(move |shard| {
            (0..shard.len()).map(move |i| {
                let record = shard.record(i);
                (
                    read_kmer(&record[..self.kmer_bytes], k),
                    record_count(record, self.kmer_bytes),
                )
            })
        })
    }

    /// Count of `kmer` (either strand), 0 if absent
    pub fn lookup(&self, kmer: u128) -> u16 {
        let k = self.kmer_len();
        let mut key = [0u8; 16];
        let key = &mut key[..self.kmer_bytes];
        write_kmer(canonical(kmer, k), k, key);
        let shard = key[0] as usize * self.shards.len() / 256;
        let shard = &self.shards[shard];
        shard
            .find(key)
            .map_or(0, |i| record_count(shard.record(i), self.kmer_bytes))
    }
}

/// Append one segment: length prefix, first count as `u16`, then one byte
/// per count holding the 7-bit signed difference to the previous count, or
/// an escape byte followed by the absolute `u16` count
pub fn encode_segment(counts: &[u16], plen_bytes: usize, out: &mut Vec<u8>) {
    let start = out.len();
    out.resize(start + plen_bytes, 0);
    let mut prev = 0i32;
    for (i, &c) in counts.iter().enumerate() {
        let delta = c as i32 - prev;
        if i == 0 {
            out.extend_from_slice(&c.to_le_bytes());
        } else if (-64..64).contains(&delta) {
            out.push(delta as u8 & 0x7f);
        } else {
            out.push(SEGMENT_ESCAPE);
            out.extend_from_slice(&c.to_le_bytes());
        }
        prev = c as i32;
    }
    let len = (out.len() - start - plen_bytes) as u64;
    write_uint_le(len, &mut out[start..start + plen_bytes]);
}

/// Decode a concatenation of segments, appending counts to `out`
pub fn decode_segments(mut bytes: &[u8], plen_bytes: usize, out: &mut Vec<u16>) -> std::result::Result<(), String> {
    while !bytes.is_empty() {
        if bytes.len() < plen_bytes {
            return Err("truncated segment length".into());
        }
        let len = read_uint_le(&bytes[..plen_bytes]) as usize;
        let rest = &bytes[plen_bytes..];
        if rest.len() < len || len < 2 {
            return Err(format!("segment of {len} bytes does not fit"));
        }
        let (mut payload, tail) = rest.split_at(len);
        bytes = tail;

        let mut prev = u16::from_le_bytes([payload[0], payload[1]]);
        out.push(prev);
        payload = &payload[2..];
        while let Some((&b, rest)) = payload.split_first() {
            if b == SEGMENT_ESCAPE {
                if rest.len() < 2 {
                    return Err("truncated escaped count".into());
                }
                prev = u16::from_le_bytes([rest[0], rest[1]]);
                payload = &rest[2..];
            } else {
                let delta = ((b << 1) as i8 >> 1) as i32;
                prev = (prev as i32 + delta) as u16;
                payload = rest;
            }
            out.push(prev);
        }
    }
    Ok(())
}

/// Count profiles opened from their stub
pub struct ProfileStore {
    stub: ProfileStub,
    data: Vec<RecordFile>,
    offsets: Vec<Vec<u64>>,
}

impl ProfileStore {
    /// Open the profiles described by the stub at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let stub = ProfileStub::read(path)?;
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        let root = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut data = Vec::with_capacity(stub.shards as usize);
        let mut offsets = Vec::with_capacity(stub.shards as usize);
        for i in 0..stub.shards {
            let data_path = dir.join(format!(".{root}.prof.{i}"));
            let index_path = dir.join(format!(".{root}.pidx.{i}"));
            let shard = RecordFile::open(&data_path, 0, 1)?;
            let raw = fs::read(&index_path).map_err(|e| Error::io(&index_path, e))?;
            if raw.len() % 8 != 0 || raw.len() < 8 {
                return Err(Error::corrupt(&index_path, "truncated profile index"));
            }
            let index: Vec<u64> = raw.chunks_exact(8).map(read_uint_le).collect();
            if index[0] != 0
                || index.windows(2).any(|w| w[0] > w[1])
                || index[index.len() - 1] != shard.len() as u64
            {
                return Err(Error::corrupt(&index_path, "profile offsets do not match the data"));
            }
            data.push(shard);
            offsets.push(index);
        }
        Ok(Self {
            stub,
            data,
            offsets,
        })
    }

    /// K-mer length
    pub fn kmer_len(&self) -> usize {
        self.stub.kmer_len as usize
    }

    /// Number of profiles (one per input sequence)
    pub fn len(&self) -> usize {
        self.offsets.iter().map(|o| o.len() - 1).sum()
    }

    /// Whether there are no profiles
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Profile of sequence `id` (0-based, input order): the count of each of
    /// its k-mers, 0 where a k-mer spans an ambiguous base
    pub fn profile(&self, id: usize) -> Result<Vec<u16>> {
        let shards = self.data.len();
        let (shard, local) = (id % shards, id / shards);
        let index = &self.offsets[shard];
        if local + 1 >= index.len() {
            return Err(Error::Usage(format!("no profile for sequence {id}")));
        }
        let data = &self.data[shard];
        let bytes = &data.bytes()[index[local] as usize..index[local + 1] as usize];
        let mut counts = Vec::new();
        decode_segments(bytes, self.stub.plen_bytes as usize, &mut counts)
            .map_err(|reason| Error::corrupt(data.path(), reason))?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_histogram_bins() {
        let mut hist = Histogram::new(21);
        hist.add(1);
        hist.add(1);
        hist.add(5);
        hist.add(40_000);
        hist.add(32_767);
        assert_eq!(hist.get(1), 2);
        assert_eq!(hist.get(5), 1);
        assert_eq!(hist.get(32_767), 2);
        assert_eq!(hist.get(0), 0);
        assert_eq!(hist.distinct(), 5);

        let mut other = Histogram::new(21);
        other.add(5);
        hist.merge(&other);
        assert_eq!(hist.get(5), 2);
    }

    #[test]
    fn test_histogram_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.hist");
        let mut hist = Histogram::new(40);
        hist.add(3);
        hist.write(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 12 + 8 * 32_767);
        let read = Histogram::read(&path).unwrap();
        assert_eq!(read, hist);
        assert_eq!(read.kmer_len(), 40);
        assert_eq!(read.total(), 3);
    }

    #[test]
    fn test_segment_codec() {
        let counts = [5u16, 5, 6, 70, 7, 32_767, 32_767, 0, 63];
        let mut buf = Vec::new();
        encode_segment(&counts, 2, &mut buf);
        encode_segment(&[0, 0, 0], 2, &mut buf);
        // 2 (first) + 2 deltas + 3 escape + 1 + 3 escape + 1 + 3 escape + 1
        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), 16);

        let mut out = Vec::new();
        decode_segments(&buf, 2, &mut out).unwrap();
        assert_eq!(out, [&counts[..], &[0, 0, 0]].concat());

        assert!(decode_segments(&buf[..buf.len() - 1], 2, &mut Vec::new()).is_err());
    }

    #[test]
    fn test_negative_deltas() {
        let counts = [100u16, 36, 37, 100, 99];
        let mut buf = Vec::new();
        encode_segment(&counts, 1, &mut buf);
        assert_eq!(buf[0], 2 + 1 + 1 + 1 + 1);
        let mut out = Vec::new();
        decode_segments(&buf, 1, &mut out).unwrap();
        assert_eq!(out, counts);
    }

    #[test]
    fn test_record_file_find() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("r");
        let k = 5;
        let mut bytes = Vec::new();
        for (kmer, count) in [(1u128, 3u64), (7, 1), (300, 40_000)] {
            let mut rec = [0u8; 4];
            fill_record(kmer, k, count, &mut rec);
            bytes.extend_from_slice(&rec);
        }
        fs::write(&path, &bytes).unwrap();

        let file = RecordFile::open(&path, 0, 4).unwrap();
        assert_eq!(file.len(), 3);
        let mut key = [0u8; 2];
        write_kmer(300, k, &mut key);
        let i = file.find(&key).unwrap();
        assert_eq!(i, 2);
        assert_eq!(record_count(file.record(i), 2), 32_767);
        write_kmer(8, k, &mut key);
        assert!(file.find(&key).is_none());

        assert!(RecordFile::open(&path, 0, 5).is_err());
        fs::write(&path, b"").unwrap();
        assert!(RecordFile::open(&path, 0, 4).unwrap().is_empty());
    }
}
