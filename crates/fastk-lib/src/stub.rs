//! Stub files describing sharded outputs
//!
//! A stub is a short header of native-endian `i32` values. The data itself
//! lives in hidden shard files next to the stub.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Header of a k-mer table stub (`<root>.ktab`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStub {
    /// K-mer length the table was built with
    pub kmer_len: i32,
    /// Number of hidden shards
    pub shards: i32,
    /// Smallest count kept in the table, 1 for stubs written without it
    pub cutoff: i32,
}

/// Header of a profile stub (`<root>.prof`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileStub {
    /// K-mer length
    pub kmer_len: i32,
    /// Number of hidden shards
    pub shards: i32,
    /// Bytes of the length prefix of each segment
    pub plen_bytes: i32,
}

impl TableStub {
    /// Write the stub
    pub fn write(&self, path: &Path) -> Result<()> {
        write_ints(path, &[self.kmer_len, self.shards, self.cutoff])
    }

    /// Read a stub, rejecting one that references no shards
    ///
    /// Only k and the shard count are required; the cutoff is optional.
    pub fn read(path: &Path) -> Result<Self> {
        let ints = read_ints(path, 3)?;
        let (kmer_len, shards) = match ints[..] {
            [k, s, ..] => (k, s),
            _ => return Err(truncated(path)),
        };
        let cutoff = ints.get(2).copied().unwrap_or(1);
        if shards <= 0 {
            return Err(Error::BadStub {
                path: path.to_path_buf(),
                reason: "table has no hidden files".into(),
            });
        }
        Ok(Self {
            kmer_len,
            shards,
            cutoff,
        })
    }

    /// Read a stub and check that it was built for k-mers of length `k`
    pub fn read_for(path: &Path, k: usize) -> Result<Self> {
        let stub = Self::read(path)?;
        if stub.kmer_len < 0 || stub.kmer_len as usize != k {
            return Err(Error::StubKmerMismatch {
                stored: stub.kmer_len,
                requested: k,
            });
        }
        Ok(stub)
    }
}

impl ProfileStub {
    /// Write the stub
    pub fn write(&self, path: &Path) -> Result<()> {
        write_ints(path, &[self.kmer_len, self.shards, self.plen_bytes])
    }

    /// Read a stub
    pub fn read(path: &Path) -> Result<Self> {
        let (kmer_len, shards, plen_bytes) = match read_ints(path, 3)?[..] {
            [k, s, p] => (k, s, p),
            _ => return Err(truncated(path)),
        };
        if shards <= 0 || !(1..=8).contains(&plen_bytes) {
            return Err(Error::BadStub {
                path: path.to_path_buf(),
                reason: format!("invalid profile stub ({shards} shards, {plen_bytes}-byte lengths)"),
            });
        }
        Ok(Self {
            kmer_len,
            shards,
            plen_bytes,
        })
    }
}

fn write_ints(path: &Path, values: &[i32]) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for v in values {
        writer.write_all(&v.to_ne_bytes()).map_err(|e| Error::io(path, e))?;
    }
    writer.flush().map_err(|e| Error::io(path, e))
}

/// Up to `max` leading values of a stub
fn read_ints(path: &Path, max: usize) -> Result<Vec<i32>> {
    let file = File::open(path).map_err(|source| Error::BadStub {
        path: path.to_path_buf(),
        reason: format!("cannot open stub file: {source}"),
    })?;
    let mut bytes = Vec::with_capacity(4 * max);
    file.take(4 * max as u64)
        .read_to_end(&mut bytes)
        .map_err(|e| Error::io(path, e))?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn truncated(path: &Path) -> Error {
    Error::BadStub {
        path: path.to_path_buf(),
        reason: "stub file is truncated".into(),
    }
}
