// FastK-rs: disk-based k-mer counting
//
// Counts the k-mers of large sequencing datasets with a bounded memory
// budget by splitting super-mers into partitions on disk, sorting each
// partition, and merging the results into tables and profiles.

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod config;
pub mod constants;
pub mod encoding;
pub mod error;
pub mod files;
pub mod hasher;
pub mod minimizer;
pub mod pipeline;
pub mod plan;
pub mod resources;
pub mod sample;
pub mod scheme;
pub mod stub;
pub mod tables;

// Re-export common types at crate root
pub use config::{ExecutionMode, ProfileSource, RunConfig, StageName};
pub use error::{Error, ErrorKind, Result};
pub use files::PartitionFileSet;
pub use pipeline::{DiskStages, KmerCounter, Pipeline, RunSummary, StageContext, StageExecutor};
pub use plan::{LayoutPlanner, PartitionPlan};
pub use resources::{ResourceBudget, ResourceGuard};
pub use sample::{InputSample, InputSet, SampleStats};
pub use scheme::{RandomMinimizerScheme, SchemeSelector};
pub use tables::{Histogram, KmerTable, ProfileStore};

/// Version information
pub fn version() -> (u8, u8, u8) {
    constants::VERSION
}
