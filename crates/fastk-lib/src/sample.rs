//! Sequence input: opening sources, streaming records and sampling the head
//! of the data set for planning
//!
//! Sources are FASTA/FASTQ files read through `needletail`, which detects
//! gzip/bzip2/xz/zstd compression itself. Every sequence goes through
//! [`preprocess`] (bar-code removal, optional homopolymer compression) the
//! same way in sampling, Split and MergeProfile, so the sample sees exactly
//! what gets counted.
//!
//! Only the nucleotide alphabet is supported. `N` and IUPAC ambiguity codes
//! break k-mers; any other symbol is rejected.

use std::borrow::Cow;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use needletail::parse_fastx_reader;
use tracing::{debug, info};

use crate::config::RunConfig;
use crate::encoding::{homopolymer_compress, BASE_CODE, ILLEGAL};
use crate::error::{Error, Result};

/// Aggregate statistics of the sampled prefix
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleStats {
    /// Bases in the sampled records (after preprocessing)
    pub total_bases: u64,
    /// Records in the sample
    pub num_records: u64,
    /// Input bytes per sampled input byte; projects the sample onto the
    /// whole data set (1.0 when the sample is the whole data set)
    pub ratio: f64,
}

/// The sampled prefix: statistics plus the preprocessed sequences
#[derive(Debug, Clone)]
pub struct InputSample {
    /// Aggregate statistics
    pub stats: SampleStats,
    /// Sampled sequences, in input order
    pub reads: Vec<Vec<u8>>,
}

/// The set of input sources of a run
#[derive(Debug, Clone)]
pub struct InputSet {
    sources: Vec<PathBuf>,
    total_bytes: u64,
}

impl InputSet {
    /// Check that every source is a readable file and record the total size
    pub fn open<P: AsRef<Path>>(sources: &[P]) -> Result<Self> {
        if sources.is_empty() {
            return Err(Error::Usage("at least one sequence source is required".into()));
        }
        let mut total_bytes = 0;
        let mut paths = Vec::with_capacity(sources.len());
        for source in sources {
            let path = source.as_ref();
            let meta = std::fs::metadata(path)
                .map_err(|e| Error::Usage(format!("cannot open {}: {e}", path.display())))?;
            if !meta.is_file() {
                return Err(Error::Usage(format!("{} is not a file", path.display())));
            }
            total_bytes += meta.len();
            paths.push(path.to_path_buf());
        }
        Ok(Self {
            sources: paths,
            total_bytes,
        })
    }

    /// Input files, in order
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// Combined on-disk size of the sources
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Call `visit` with every preprocessed sequence of every source, in
    /// order, until it returns `Ok(false)`.
    pub fn for_each_sequence<F>(&self, config: &RunConfig, mut visit: F) -> Result<()>
    where
        F: FnMut(Cow<'_, [u8]>) -> Result<bool>,
    {
        for path in &self.sources {
            let counter = Arc::new(AtomicU64::new(0));
            if !stream_source(path, config, &counter, &mut visit)? {
                break;
            }
        }
        Ok(())
    }

    /// Read sequences from the head of the input until `config.sample_bytes`
    /// bases are collected or the input ends
    pub fn sample_first_block(&self, config: &RunConfig) -> Result<InputSample> {
        let budget = config.sample_bytes;
        let mut stats = SampleStats {
            total_bases: 0,
            num_records: 0,
            ratio: 1.0,
        };
        let mut reads = Vec::new();
        let mut consumed = 0u64;
        let mut exhausted = true;

        for path in &self.sources {
            let counter = Arc::new(AtomicU64::new(0));
            let finished = stream_source(path, config, &counter, &mut |seq: Cow<'_, [u8]>| {
                stats.total_bases += seq.len() as u64;
                stats.num_records += 1;
                reads.push(seq.into_owned());
                Ok(stats.total_bases < budget)
            })?;
            consumed += counter.load(Ordering::Relaxed);
            if !finished {
                exhausted = false;
                break;
            }
        }

        if stats.num_records == 0 {
            return Err(Error::EmptyInput);
        }
        if !exhausted && consumed > 0 {
            stats.ratio = self.total_bytes as f64 / consumed as f64;
        }

        info!(
            "Sampled {} bases in {} records ({} of the input)",
            stats.total_bases,
            stats.num_records,
            if exhausted { "all".to_string() } else { format!("1/{:.2}", stats.ratio) }
        );
        Ok(InputSample { stats, reads })
    }
}

/// Strip the bar-code prefix and homopolymer-compress if requested
pub fn preprocess<'a>(seq: &'a [u8], bc_prefix: usize, compress: bool) -> Cow<'a, [u8]> {
    let seq = seq.get(bc_prefix..).unwrap_or(&[]);
    if compress {
        Cow::Owned(homopolymer_compress(seq))
    } else {
        Cow::Borrowed(seq)
    }
}

/// First symbol that is neither a base nor an ambiguity code
pub fn find_illegal_symbol(seq: &[u8]) -> Option<u8> {
    seq.iter().copied().find(|&b| BASE_CODE[b as usize] == ILLEGAL)
}

/// Stream one source; returns `Ok(false)` if `visit` asked to stop
fn stream_source<F>(
    path: &Path,
    config: &RunConfig,
    counter: &Arc<AtomicU64>,
    visit: &mut F,
) -> Result<bool>
where
    F: FnMut(Cow<'_, [u8]>) -> Result<bool>,
{
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let len = file.metadata().map_err(|e| Error::io(path, e))?.len();
    if len == 0 {
        debug!("Skipping empty source {}", path.display());
        return Ok(true);
    }

    let reader = CountingReader {
        inner: file,
        count: Arc::clone(counter),
    };
    let mut records = parse_fastx_reader(reader).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    while let Some(record) = records.next() {
        let record = record.map_err(|source| Error::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let raw = record.seq();
        if let Some(symbol) = find_illegal_symbol(&raw) {
            return Err(Error::UnsupportedAlphabet {
                path: path.to_path_buf(),
                symbol: symbol as char,
            });
        }
        if !visit(preprocess(&raw, config.bc_prefix, config.compress))? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Counts raw (possibly compressed) bytes pulled from a source
struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn fasta(records: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for (i, seq) in records.iter().enumerate() {
            writeln!(file, ">r{i}\n{seq}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn config_for(file: &NamedTempFile) -> RunConfig {
        RunConfig::for_sources(&[file.path()]).unwrap()
    }

    #[test]
    fn test_sample_whole_input() {
        let file = fasta(&["ACGTACGTAC", "GGGGCCCC"]);
        let config = config_for(&file);
        let input = InputSet::open(&config.sources).unwrap();
        let sample = input.sample_first_block(&config).unwrap();
        assert_eq!(sample.stats.total_bases, 18);
        assert_eq!(sample.stats.num_records, 2);
        assert_eq!(sample.stats.ratio, 1.0);
        assert_eq!(sample.reads[1], b"GGGGCCCC");
    }

    #[test]
    fn test_sample_stops_at_budget() {
        let seqs: Vec<String> = (0..2_000).map(|_| "ACGT".repeat(50)).collect();
        let refs: Vec<&str> = seqs.iter().map(|s| s.as_str()).collect();
        let file = fasta(&refs);
        let config = RunConfig {
            sample_bytes: 1_000,
            ..config_for(&file)
        };
        let input = InputSet::open(&config.sources).unwrap();
        let sample = input.sample_first_block(&config).unwrap();
        assert_eq!(sample.stats.num_records, 5);
        assert_eq!(sample.stats.total_bases, 1_000);
        assert!(sample.stats.ratio > 1.0);
    }

    #[test]
    fn test_sample_applies_preprocessing() {
        let file = fasta(&["TTTTAACCGG"]);
        let config = RunConfig {
            bc_prefix: 4,
            compress: true,
            ..config_for(&file)
        };
        let input = InputSet::open(&config.sources).unwrap();
        let sample = input.sample_first_block(&config).unwrap();
        assert_eq!(sample.reads[0], b"ACG");
        assert_eq!(sample.stats.total_bases, 3);
    }

    #[test]
    fn test_rejects_protein_input() {
        let file = fasta(&["MKVLEFPQ"]);
        let config = config_for(&file);
        let input = InputSet::open(&config.sources).unwrap();
        let err = input.sample_first_block(&config).unwrap_err();
        assert!(matches!(err, Error::UnsupportedAlphabet { symbol: 'L', .. }));
    }

    #[test]
    fn test_tolerates_ambiguous_bases() {
        let file = fasta(&["ACGTNNNNACGTRY"]);
        let config = config_for(&file);
        let input = InputSet::open(&config.sources).unwrap();
        assert!(input.sample_first_block(&config).is_ok());
    }

    #[test]
    fn test_empty_input() {
        let file = NamedTempFile::new().unwrap();
        let config = config_for(&file);
        let input = InputSet::open(&config.sources).unwrap();
        assert!(matches!(input.sample_first_block(&config), Err(Error::EmptyInput)));
    }

    #[test]
    fn test_missing_source() {
        assert!(matches!(
            InputSet::open(&["/nonexistent/reads.fa"]),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn test_preprocess() {
        assert_eq!(&*preprocess(b"ACGT", 0, false), b"ACGT");
        assert_eq!(&*preprocess(b"ACGT", 2, false), b"GT");
        assert!(preprocess(b"ACGT", 10, false).is_empty());
        assert_eq!(&*preprocess(b"AACCGT", 0, true), b"ACGT");
        assert_eq!(&*preprocess(b"GGAACCGT", 2, true), b"ACGT");
    }
}
