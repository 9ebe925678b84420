use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use fastk_lib::config::output_location;
use fastk_lib::constants::{
    DEFAULT_KMER_LEN, DEFAULT_SCRATCH_DIR, DEFAULT_SORT_MEMORY_GB, DEFAULT_THREADS, GB,
};
use fastk_lib::{KmerCounter, ProfileSource, RunConfig};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "fastk")]
#[command(version)]
#[command(about = "FastK: disk-based k-mer counting", long_about = None)]
struct Cli {
    /// K-mer length
    #[arg(short = 'k', long = "kmer", default_value_t = DEFAULT_KMER_LEN)]
    kmer: usize,

    /// Produce a table of the k-mers occurring at least CUTOFF times
    #[arg(
        short = 't',
        long = "table",
        value_name = "CUTOFF",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = DEFAULT_TABLE_CUTOFF_STR
    )]
    table: Option<u32>,

    /// Produce per-sequence count profiles, against TABLE if given
    #[arg(
        short = 'p',
        long = "profile",
        value_name = "TABLE",
        num_args = 0..=1,
        require_equals = true
    )]
    profile: Option<Option<PathBuf>>,

    /// Ignore this many bases at the start of every sequence
    #[arg(long = "bc", value_name = "N", default_value_t = 0)]
    bc: usize,

    /// Homopolymer-compress the input
    #[arg(short = 'c', long = "compress")]
    compress: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Output path and root name (default: first source)
    #[arg(short = 'N', long = "name", value_name = "PATH")]
    name: Option<PathBuf>,

    /// Directory for scratch files
    #[arg(short = 'P', long = "scratch", value_name = "DIR", default_value = DEFAULT_SCRATCH_DIR)]
    scratch: PathBuf,

    /// Sort memory in GB
    #[arg(short = 'M', long = "memory", value_name = "GB", default_value_t = DEFAULT_SORT_MEMORY_GB)]
    memory: u64,

    /// Number of threads
    #[arg(short = 'T', long = "threads", value_name = "N", default_value_t = DEFAULT_THREADS)]
    threads: usize,

    /// Run a single stage against the files of an earlier run
    #[cfg(feature = "developer")]
    #[arg(long = "stage", value_name = "STAGE")]
    stage: Option<fastk_lib::StageName>,

    /// FASTA/FASTQ sources, optionally compressed
    #[arg(value_name = "SOURCES", required = true, num_args = 1..)]
    sources: Vec<PathBuf>,
}

/// `-t` with no value
const DEFAULT_TABLE_CUTOFF_STR: &str = "4";

impl Cli {
    fn into_config(self) -> anyhow::Result<RunConfig> {
        let base = RunConfig::for_sources(&self.sources)?;
        let (out_dir, out_root) = match &self.name {
            Some(name) => output_location(name),
            None => (base.out_dir.clone(), base.out_root.clone()),
        };
        let profile = self.profile.map(|table| match table {
            Some(path) => ProfileSource::Table(table_stub(&path)),
            None => ProfileSource::OwnCounts,
        });

        #[cfg(feature = "developer")]
        let mode = match self.stage {
            Some(stage) => fastk_lib::ExecutionMode::RunSingleStage(stage),
            None => fastk_lib::ExecutionMode::FullRun,
        };
        #[cfg(not(feature = "developer"))]
        let mode = fastk_lib::ExecutionMode::FullRun;

        Ok(RunConfig {
            kmer_len: self.kmer,
            compress: self.compress,
            bc_prefix: self.bc,
            num_threads: self.threads,
            sort_memory: self.memory.saturating_mul(GB),
            scratch_dir: self.scratch,
            out_dir,
            out_root,
            table_cutoff: self.table,
            profile,
            mode,
            ..base
        })
    }
}

/// Stub path of a table given with or without its `.ktab` extension
fn table_stub(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == "ktab") {
        path.to_path_buf()
    } else {
        let mut name = path.as_os_str().to_os_string();
        name.push(".ktab");
        PathBuf::from(name)
    }
}

fn init_logging(verbose: bool) {
    // RUST_LOG wins; otherwise progress with -v and warnings only without
    let default = if verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.into_config()?;
    debug!("{:?}", config);

    let summary = KmerCounter::new(config)?.run()?;
    info!(
        "Done: {} partitions, {} descriptors, stages {:?}",
        summary.plan.partition_count, summary.budget.required, summary.stages
    );
    Ok(())
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fastk: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastk_lib::constants::DEFAULT_TABLE_CUTOFF;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("fastk").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["data/reads.fa"]).into_config().unwrap();
        assert_eq!(config.kmer_len, 40);
        assert_eq!(config.num_threads, 4);
        assert_eq!(config.sort_memory, 12 * GB);
        assert_eq!(config.scratch_dir, PathBuf::from("/tmp"));
        assert_eq!(config.out_root, "reads");
        assert_eq!(config.table_cutoff, None);
        assert_eq!(config.profile, None);
    }

    #[test]
    fn test_bare_table_flag() {
        assert_eq!(parse(&["reads.fa", "-t"]).table, Some(4));
        assert_eq!(parse(&["-t=7", "reads.fa"]).table, Some(7));
        assert_eq!(parse(&["--table=2", "reads.fa"]).table, Some(2));
        assert_eq!(DEFAULT_TABLE_CUTOFF_STR.parse::<u32>().unwrap(), DEFAULT_TABLE_CUTOFF);
    }

    #[test]
    fn test_bare_flags_leave_sources_alone() {
        let cli = parse(&["-t", "reads.fa"]);
        assert_eq!(cli.table, Some(4));
        assert_eq!(cli.sources, vec![PathBuf::from("reads.fa")]);

        let cli = parse(&["-p", "reads.fa"]);
        assert_eq!(cli.sources, vec![PathBuf::from("reads.fa")]);
        assert_eq!(
            cli.into_config().unwrap().profile,
            Some(ProfileSource::OwnCounts)
        );

        let cli = parse(&["-t", "-p", "a.fa", "b.fa"]);
        assert_eq!(cli.table, Some(4));
        assert_eq!(cli.profile, Some(None));
        assert_eq!(cli.sources.len(), 2);
    }

    #[test]
    fn test_profile_sources() {
        let own = parse(&["reads.fa", "-p"]).into_config().unwrap();
        assert_eq!(own.profile, Some(ProfileSource::OwnCounts));

        let table = parse(&["-p=other", "reads.fa"]).into_config().unwrap();
        assert_eq!(
            table.profile,
            Some(ProfileSource::Table(PathBuf::from("other.ktab")))
        );
    }

    #[test]
    fn test_name_and_memory() {
        let config = parse(&["-N", "out/sample", "-M", "2", "-T", "8", "reads.fa"])
            .into_config()
            .unwrap();
        assert_eq!(config.out_dir, PathBuf::from("out"));
        assert_eq!(config.out_root, "sample");
        assert_eq!(config.sort_memory, 2 * GB);
        assert_eq!(config.num_threads, 8);
    }

    #[test]
    fn test_missing_sources() {
        let err = Cli::try_parse_from(["fastk", "-k", "21"]).unwrap_err();
        assert!(err.use_stderr());
    }
}
