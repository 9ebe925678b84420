//! Run configuration
//!
//! A [`RunConfig`] is assembled once from the command line, validated, and
//! then only ever shared by reference: no stage mutates it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::constants::{
    is_valid_k, DEFAULT_KMER_LEN, DEFAULT_MINIMIZER_LEN, DEFAULT_SAMPLE_BYTES,
    DEFAULT_SCRATCH_DIR, DEFAULT_SORT_MEMORY_GB, DEFAULT_THREADS, GB, MAX_KMER_LEN,
    MAX_MINIMIZER_LEN,
};
use crate::error::{Error, Result};

/// The four pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageName {
    /// Distribute super-mers into partition buckets
    Split,
    /// Sort and count each partition
    Sort,
    /// Merge sorted partitions into a k-mer table
    MergeTable,
    /// Build per-sequence count profiles
    MergeProfile,
}

impl StageName {
    /// All stages in pipeline order
    pub const ALL: [StageName; 4] = [
        StageName::Split,
        StageName::Sort,
        StageName::MergeTable,
        StageName::MergeProfile,
    ];

    /// Lowercase name used on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Split => "split",
            StageName::Sort => "sort",
            StageName::MergeTable => "table",
            StageName::MergeProfile => "profile",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "split" | "1" => Ok(StageName::Split),
            "sort" | "2" => Ok(StageName::Sort),
            "table" | "3" => Ok(StageName::MergeTable),
            "profile" | "4" => Ok(StageName::MergeProfile),
            other => Err(Error::Usage(format!(
                "unknown stage '{other}' (expected split, sort, table or profile)"
            ))),
        }
    }
}

/// Which stages a run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Every enabled stage in order
    #[default]
    FullRun,
    /// One stage against files left by an earlier run (restart/diagnosis)
    RunSingleStage(StageName),
}

/// Where profile counts come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileSource {
    /// Counts of this run's own k-mers
    OwnCounts,
    /// Counts looked up in a previously built table, given by its stub
    Table(PathBuf),
}

/// Configuration parameters of one counting run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// K-mer length (1 to 64)
    pub kmer_len: usize,

    /// Homopolymer-compress every sequence before counting
    pub compress: bool,

    /// Bases ignored at the start of every sequence (e.g. a bar code)
    pub bc_prefix: usize,

    /// Worker threads per stage
    pub num_threads: usize,

    /// Memory budget for sorting one partition, in bytes
    pub sort_memory: u64,

    /// Directory for bucket and sorted partition files
    pub scratch_dir: PathBuf,

    /// Directory receiving the outputs
    pub out_dir: PathBuf,

    /// Root name prefixing every file of the run
    pub out_root: String,

    /// Produce a table of k-mers with count >= cutoff
    pub table_cutoff: Option<u32>,

    /// Produce per-sequence count profiles
    pub profile: Option<ProfileSource>,

    /// Input sequence files
    pub sources: Vec<PathBuf>,

    /// Sequence bases sampled from the head of the input for planning
    pub sample_bytes: u64,

    /// Minimizer length of the default scheme (clamped to k)
    pub minimizer_len: usize,

    /// Full pipeline or a single stage
    pub mode: ExecutionMode,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            kmer_len: DEFAULT_KMER_LEN,
            compress: false,
            bc_prefix: 0,
            num_threads: DEFAULT_THREADS,
            sort_memory: DEFAULT_SORT_MEMORY_GB * GB,
            scratch_dir: PathBuf::from(DEFAULT_SCRATCH_DIR),
            out_dir: PathBuf::from("."),
            out_root: String::new(),
            table_cutoff: None,
            profile: None,
            sources: Vec::new(),
            sample_bytes: DEFAULT_SAMPLE_BYTES,
            minimizer_len: DEFAULT_MINIMIZER_LEN,
            mode: ExecutionMode::FullRun,
        }
    }
}

impl RunConfig {
    /// Configuration over `sources` with every other value at its default.
    ///
    /// The output root and directory are taken from the first source.
    pub fn for_sources<P: AsRef<Path>>(sources: &[P]) -> Result<Self> {
        let sources: Vec<PathBuf> = sources.iter().map(|p| p.as_ref().to_path_buf()).collect();
        let first = sources
            .first()
            .ok_or_else(|| Error::Usage("at least one sequence source is required".into()))?;
        let (out_dir, out_root) = output_location(first);
        Ok(Self {
            sources,
            out_dir,
            out_root,
            ..Self::default()
        })
    }

    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if !is_valid_k(self.kmer_len) {
            return Err(Error::Usage(format!(
                "k-mer length must be in [1, {MAX_KMER_LEN}], got {}",
                self.kmer_len
            )));
        }
        if self.num_threads == 0 {
            return Err(Error::Usage("number of threads must be positive".into()));
        }
        if self.sort_memory == 0 {
            return Err(Error::Usage("sort memory must be positive".into()));
        }
        if self.sources.is_empty() {
            return Err(Error::Usage("at least one sequence source is required".into()));
        }
        if self.out_root.is_empty() {
            return Err(Error::Usage("output root name is empty".into()));
        }
        if self.table_cutoff == Some(0) {
            return Err(Error::Usage("table cutoff must be positive".into()));
        }
        if self.sample_bytes == 0 {
            return Err(Error::Usage("sample size must be positive".into()));
        }
        if self.minimizer_len == 0 || self.minimizer_len > MAX_MINIMIZER_LEN {
            return Err(Error::Usage(format!(
                "minimizer length must be in [1, {MAX_MINIMIZER_LEN}], got {}",
                self.minimizer_len
            )));
        }
        Ok(())
    }

    /// Whether a k-mer table is produced
    pub fn wants_table(&self) -> bool {
        self.table_cutoff.is_some()
    }

    /// Whether profiles are produced
    pub fn wants_profile(&self) -> bool {
        self.profile.is_some()
    }

    /// Log configuration parameters via tracing
    pub fn print(&self) {
        tracing::info!("Run Configuration:");
        tracing::info!("  k = {}{}", self.kmer_len, if self.compress { " (homopolymer compressed)" } else { "" });
        tracing::info!("  num_threads = {}", self.num_threads);
        tracing::info!("  sort_memory = {:.1} GB", self.sort_memory as f64 / GB as f64);
        tracing::debug!("  bc_prefix = {}", self.bc_prefix);
        tracing::debug!("  scratch_dir = {:?}", self.scratch_dir);
        tracing::debug!("  output = {:?}/{}", self.out_dir, self.out_root);
        match self.table_cutoff {
            Some(cutoff) => tracing::info!("  table cutoff = {}", cutoff),
            None => tracing::debug!("  table = no"),
        }
        match &self.profile {
            Some(ProfileSource::OwnCounts) => tracing::info!("  profiles = yes"),
            Some(ProfileSource::Table(stub)) => tracing::info!("  profiles against {:?}", stub),
            None => tracing::debug!("  profiles = no"),
        }
        tracing::debug!("  sources = {:?}", self.sources);
        if let ExecutionMode::RunSingleStage(stage) = self.mode {
            tracing::warn!("  running stage {} only", stage);
        }
    }
}

/// Output directory and root name derived from a path.
///
/// The root is the file name with sequence and compression extensions
/// removed (`reads.fastq.gz` -> `reads`).
pub fn output_location(path: &Path) -> (PathBuf, String) {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut root = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    for ext in [".gz", ".bz2", ".xz", ".zst"] {
        if let Some(stripped) = root.strip_suffix(ext) {
            root = stripped.to_string();
            break;
        }
    }
    for ext in [".fastq", ".fasta", ".fq", ".fa", ".fna", ".ktab"] {
        if let Some(stripped) = root.strip_suffix(ext) {
            root = stripped.to_string();
            break;
        }
    }
    (dir, root)
}
