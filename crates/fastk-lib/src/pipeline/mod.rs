//! Pipeline orchestration
//!
//! A run goes through four steps, each a full barrier:
//! 1. Split: distribute super-mers into `partitions x threads` buckets
//! 2. Sort: expand, sort and count every partition
//! 3. MergeTable: merge the partitions into a k-mer table (if requested)
//! 4. MergeProfile: compute per-sequence count profiles (if requested)
//!
//! [`KmerCounter`] does the planning (sampling, layout, descriptor budget)
//! and then hands a [`StageContext`] to a [`StageExecutor`] for every
//! scheduled stage. Stages communicate only through the files named by
//! [`PartitionFileSet`].

mod merge;
mod profile;
mod sort;
mod split;

use std::path::Path;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::{ExecutionMode, ProfileSource, RunConfig, StageName};
use crate::error::{Error, Result};
use crate::files::PartitionFileSet;
use crate::plan::{LayoutPlanner, PartitionPlan};
use crate::resources::{ResourceBudget, ResourceGuard};
use crate::sample::InputSet;
use crate::scheme::RandomMinimizerScheme;
use crate::stub::TableStub;

/// Bytes following the packed k-mer in sorted-partition and table records:
/// the k-mer's count as a little-endian `u16`
pub const AUX_BYTES: usize = 2;

/// Everything a stage may read: the frozen configuration and plan, the
/// file names, and the input
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    /// Run configuration
    pub config: &'a RunConfig,
    /// Binary layout
    pub plan: &'a PartitionPlan,
    /// Scratch and output file names
    pub files: &'a PartitionFileSet,
    /// Input sources
    pub input: &'a InputSet,
}

/// Runs one pipeline stage to completion
pub trait StageExecutor {
    /// Execute `stage`; returns only after every worker has finished
    fn run_stage(&mut self, stage: StageName, ctx: &StageContext<'_>) -> Result<()>;
}

/// The on-disk stage implementations
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskStages;

impl StageExecutor for DiskStages {
    fn run_stage(&mut self, stage: StageName, ctx: &StageContext<'_>) -> Result<()> {
        match stage {
            StageName::Split => split::run(ctx),
            StageName::Sort => sort::run(ctx),
            StageName::MergeTable => merge::run(ctx),
            StageName::MergeProfile => profile::run(ctx),
        }
    }
}

/// Stages a configuration runs, in order
pub fn schedule(config: &RunConfig) -> Result<Vec<StageName>> {
    match config.mode {
        ExecutionMode::FullRun => {
            let mut stages = vec![StageName::Split, StageName::Sort];
            if config.wants_table() {
                stages.push(StageName::MergeTable);
            }
            if config.wants_profile() {
                stages.push(StageName::MergeProfile);
            }
            Ok(stages)
        }
        ExecutionMode::RunSingleStage(stage) => {
            let enabled = match stage {
                StageName::Split | StageName::Sort => true,
                StageName::MergeTable => config.wants_table(),
                StageName::MergeProfile => config.wants_profile(),
            };
            if !enabled {
                return Err(Error::StageNotEnabled(stage));
            }
            Ok(vec![stage])
        }
    }
}

/// Sequences the stages of one run
pub struct Pipeline<'a> {
    config: &'a RunConfig,
    plan: &'a PartitionPlan,
    files: PartitionFileSet,
    input: &'a InputSet,
}

impl<'a> Pipeline<'a> {
    /// Pipeline over the given plan and files
    pub fn new(
        config: &'a RunConfig,
        plan: &'a PartitionPlan,
        files: PartitionFileSet,
        input: &'a InputSet,
    ) -> Self {
        Self {
            config,
            plan,
            files,
            input,
        }
    }

    /// Run every scheduled stage, one after the other.
    ///
    /// A single-stage run first checks that the earlier stages left their
    /// files and that they were written with this plan. Scratch files are
    /// removed only after a successful full run.
    pub fn run(mut self, executor: &mut dyn StageExecutor) -> Result<Vec<StageName>> {
        let stages = schedule(self.config)?;

        if let ExecutionMode::RunSingleStage(stage) = self.config.mode {
            if stage != StageName::Split {
                let split_threads = self.files.verify_plan(self.plan, stage)?;
                self.files = self.files.with_split_threads(split_threads);
                self.files.require_inputs_of(stage)?;
            }
        }

        let ctx = StageContext {
            config: self.config,
            plan: self.plan,
            files: &self.files,
            input: self.input,
        };
        for (step, &stage) in stages.iter().enumerate() {
            info!("Step {}: {}", step + 1, stage);
            let start = Instant::now();
            executor.run_stage(stage, &ctx)?;
            info!("  {} finished in {:.2?}", stage, start.elapsed());
        }

        if self.config.mode == ExecutionMode::FullRun {
            debug!("Removing scratch files from {:?}", self.files.scratch_dir());
            self.files.remove_buckets()?;
            self.files.remove_partitions()?;
        }
        Ok(stages)
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Layout the run used
    pub plan: PartitionPlan,
    /// Descriptor budget it secured
    pub budget: ResourceBudget,
    /// Stages executed, in order
    pub stages: Vec<StageName>,
}

/// Plans and runs a k-mer counting job
pub struct KmerCounter {
    config: RunConfig,
}

impl KmerCounter {
    /// Create a counter for a validated configuration
    pub fn new(config: RunConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Configuration of the run
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run with the on-disk stages
    pub fn run(&self) -> Result<RunSummary> {
        self.run_with(&mut DiskStages)
    }

    /// Plan the run, secure its resources, then drive `executor` through the
    /// scheduled stages.
    ///
    /// Every usage, validation and resource error is raised before the first
    /// stage starts.
    pub fn run_with(&self, executor: &mut dyn StageExecutor) -> Result<RunSummary> {
        let config = &self.config;
        config.print();

        let guard = ResourceGuard::new(&config.scratch_dir)?;
        if let Some(ProfileSource::Table(stub)) = &config.profile {
            let table = TableStub::read_for(stub, config.kmer_len)?;
            debug!("Profiles against {:?} ({} shards)", stub, table.shards);
        }
        schedule(config)?;

        let input = InputSet::open(&config.sources)?;
        info!("Determining minimizer scheme & partition for {}", config.out_root);
        let plan = {
            let sample = input.sample_first_block(config)?;
            let scheme = RandomMinimizerScheme::new(config.minimizer_len);
            LayoutPlanner::new(AUX_BYTES).plan(config, &sample, &scheme)?
        };

        let budget = guard.secure(&plan, config.num_threads)?;
        ensure_out_dir(&config.out_dir)?;

        let files = PartitionFileSet::for_run(config, &plan, guard.scratch_dir());
        let stages = Pipeline::new(config, &plan, files, &input).run(executor)?;

        Ok(RunSummary {
            plan,
            budget,
            stages,
        })
    }
}

fn ensure_out_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    Err(Error::Usage(format!(
        "output directory {} does not exist",
        dir.display()
    )))
}

/// Join a scoped worker, turning a panic into [`Error::WorkerPanicked`]
pub(crate) fn join_worker<T>(
    handle: std::thread::ScopedJoinHandle<'_, Result<T>>,
    stage: StageName,
) -> Result<T> {
    handle.join().map_err(|_| Error::WorkerPanicked(stage))?
}

/// Rayon pool of `threads` threads
pub(crate) fn thread_pool(threads: usize) -> Result<rayon::ThreadPool> {
    Ok(rayon::ThreadPoolBuilder::new().num_threads(threads).build()?)
}
