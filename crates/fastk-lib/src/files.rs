//! Typed names of every file a run reads or writes
//!
//! Stages never build paths themselves. Scratch files are addressed by
//! partition and thread index:
//!
//! ```text
//! {scratch}/{root}.T{t}.P{p}.smer   super-mer bucket of thread t, partition p
//! {scratch}/{root}.P{p}.kmer        sorted, counted partition p
//! {scratch}/{root}.plan             plan the files above were written with
//! ```
//!
//! Outputs go to the output directory:
//!
//! ```text
//! {out}/{root}.hist                 count histogram
//! {out}/{root}.ktab                 table stub, shards in .{root}.ktab.{i}
//! {out}/{root}.prof                 profile stub, shards in .{root}.prof.{i}
//!                                   with offset indexes .{root}.pidx.{i}
//! ```

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{RunConfig, StageName};
use crate::error::{Error, Result};
use crate::plan::PartitionPlan;

/// Paths of the scratch and output files of one run
#[derive(Debug, Clone)]
pub struct PartitionFileSet {
    scratch_dir: PathBuf,
    out_dir: PathBuf,
    root: String,
    partitions: usize,
    split_threads: usize,
}

impl PartitionFileSet {
    /// File set for `partitions` partitions written by `split_threads` Split
    /// workers
    pub fn new(
        scratch_dir: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
        root: impl Into<String>,
        partitions: usize,
        split_threads: usize,
    ) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            out_dir: out_dir.into(),
            root: root.into(),
            partitions: partitions.max(1),
            split_threads: split_threads.max(1),
        }
    }

    /// File set of a run under `scratch_dir`
    pub fn for_run(config: &RunConfig, plan: &PartitionPlan, scratch_dir: &Path) -> Self {
        Self::new(
            scratch_dir,
            &config.out_dir,
            &config.out_root,
            plan.partition_count,
            config.num_threads,
        )
    }

    /// Same files, with buckets written by `split_threads` workers
    pub fn with_split_threads(mut self, split_threads: usize) -> Self {
        self.split_threads = split_threads.max(1);
        self
    }

    /// Number of partitions
    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Number of Split workers, i.e. buckets per partition
    pub fn split_threads(&self) -> usize {
        self.split_threads
    }

    /// Root name of the run
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Scratch directory
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Output directory
    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Bucket of Split worker `thread` for `partition`
    pub fn bucket(&self, thread: usize, partition: usize) -> PathBuf {
        self.scratch_dir
            .join(format!("{}.T{}.P{}.smer", self.root, thread, partition))
    }

    /// All buckets of `partition`, one per Split worker
    pub fn partition_buckets(&self, partition: usize) -> Vec<PathBuf> {
        (0..self.split_threads).map(|t| self.bucket(t, partition)).collect()
    }

    /// Sorted partition file
    pub fn partition(&self, partition: usize) -> PathBuf {
        self.scratch_dir
            .join(format!("{}.P{}.kmer", self.root, partition))
    }

    /// Persisted plan
    pub fn plan_path(&self) -> PathBuf {
        self.scratch_dir.join(format!("{}.plan", self.root))
    }

    /// Count histogram
    pub fn histogram(&self) -> PathBuf {
        self.out_dir.join(format!("{}.hist", self.root))
    }

    /// Table stub
    pub fn table_stub(&self) -> PathBuf {
        self.out_dir.join(format!("{}.ktab", self.root))
    }

    /// Hidden table shard `index`
    pub fn table_shard(&self, index: usize) -> PathBuf {
        table_shard_path(&self.table_stub(), index)
    }

    /// Profile stub
    pub fn profile_stub(&self) -> PathBuf {
        self.out_dir.join(format!("{}.prof", self.root))
    }

    /// Hidden profile shard `index`
    pub fn profile_shard(&self, index: usize) -> PathBuf {
        hidden_sibling(&self.profile_stub(), "prof", index)
    }

    /// Offset index of profile shard `index`
    pub fn profile_index(&self, index: usize) -> PathBuf {
        hidden_sibling(&self.profile_stub(), "pidx", index)
    }

    /// First bucket that does not exist
    pub fn first_missing_bucket(&self) -> Option<PathBuf> {
        (0..self.partitions)
            .flat_map(|p| self.partition_buckets(p))
            .find(|path| !path.is_file())
    }

    /// First sorted partition that does not exist
    pub fn first_missing_partition(&self) -> Option<PathBuf> {
        (0..self.partitions)
            .map(|p| self.partition(p))
            .find(|path| !path.is_file())
    }

    /// Fail with [`Error::MissingStageInput`] unless the inputs of `stage`
    /// are all present
    pub fn require_inputs_of(&self, stage: StageName) -> Result<()> {
        let missing = match stage {
            StageName::Split => None,
            StageName::Sort => self.first_missing_bucket(),
            StageName::MergeTable | StageName::MergeProfile => self.first_missing_partition(),
        };
        match missing {
            Some(path) => Err(Error::MissingStageInput { stage, path }),
            None => Ok(()),
        }
    }

    /// Remove every bucket file
    pub fn remove_buckets(&self) -> Result<()> {
        for p in 0..self.partitions {
            for path in self.partition_buckets(p) {
                remove_if_present(&path)?;
            }
        }
        Ok(())
    }

    /// Remove the sorted partitions and the persisted plan
    pub fn remove_partitions(&self) -> Result<()> {
        for p in 0..self.partitions {
            remove_if_present(&self.partition(p))?;
        }
        remove_if_present(&self.plan_path())
    }

    /// Persist the plan along with the number of Split workers
    pub fn write_plan(&self, plan: &PartitionPlan) -> Result<()> {
        let path = self.plan_path();
        let file = File::create(&path).map_err(|e| Error::io(&path, e))?;
        let mut writer = BufWriter::new(file);
        plan.write(&mut writer)
            .and_then(|_| writer.write_all(&(self.split_threads as u64).to_le_bytes()))
            .and_then(|_| writer.flush())
            .map_err(|e| Error::io(&path, e))?;
        debug!("Wrote plan to {:?}", path);
        Ok(())
    }

    /// Read a persisted plan and the number of Split workers it was used with
    pub fn read_plan(&self) -> Result<(PartitionPlan, usize)> {
        let path = self.plan_path();
        let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
        let mut reader = BufReader::new(file);
        let plan = PartitionPlan::read(&mut reader).map_err(|e| Error::corrupt(&path, e.to_string()))?;
        let mut buf = [0u8; 8];
        reader
            .read_exact(&mut buf)
            .map_err(|e| Error::corrupt(&path, e.to_string()))?;
        Ok((plan, u64::from_le_bytes(buf) as usize))
    }

    /// Check that the scratch files of an earlier run were written with
    /// `plan`; returns the number of Split workers that wrote them
    pub fn verify_plan(&self, plan: &PartitionPlan, stage: StageName) -> Result<usize> {
        let path = self.plan_path();
        if !path.is_file() {
            return Err(Error::MissingStageInput { stage, path });
        }
        let (stored, split_threads) = self.read_plan()?;
        if stored != *plan {
            return Err(Error::PlanMismatch { path });
        }
        Ok(split_threads)
    }
}

/// Hidden shard `index` of a table whose stub is `stub`
pub fn table_shard_path(stub: &Path, index: usize) -> PathBuf {
    hidden_sibling(stub, "ktab", index)
}

/// `{dir}/.{root}.{ext}.{index}` for a stub `{dir}/{root}.{suffix}`
fn hidden_sibling(stub: &Path, ext: &str, index: usize) -> PathBuf {
    let dir = stub.parent().unwrap_or_else(|| Path::new(""));
    let root = stub
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.join(format!(".{root}.{ext}.{index}"))
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_set(scratch: &Path) -> PartitionFileSet {
        PartitionFileSet::new(scratch, "/out", "reads", 3, 2)
    }

    #[test]
    fn test_names() {
        let files = file_set(Path::new("/tmp"));
        assert_eq!(files.bucket(1, 2), PathBuf::from("/tmp/reads.T1.P2.smer"));
        assert_eq!(files.partition(0), PathBuf::from("/tmp/reads.P0.kmer"));
        assert_eq!(files.plan_path(), PathBuf::from("/tmp/reads.plan"));
        assert_eq!(files.histogram(), PathBuf::from("/out/reads.hist"));
        assert_eq!(files.table_stub(), PathBuf::from("/out/reads.ktab"));
        assert_eq!(files.table_shard(3), PathBuf::from("/out/.reads.ktab.3"));
        assert_eq!(files.profile_shard(0), PathBuf::from("/out/.reads.prof.0"));
        assert_eq!(files.profile_index(1), PathBuf::from("/out/.reads.pidx.1"));
        assert_eq!(files.partition_buckets(1).len(), 2);
    }

    #[test]
    fn test_missing_inputs() {
        let dir = TempDir::new().unwrap();
        let files = file_set(dir.path());
        assert!(files.require_inputs_of(StageName::Split).is_ok());

        let err = files.require_inputs_of(StageName::Sort).unwrap_err();
        assert!(matches!(err, Error::MissingStageInput { stage: StageName::Sort, .. }));

        for p in 0..3 {
            for path in files.partition_buckets(p) {
                fs::write(path, b"").unwrap();
            }
        }
        assert!(files.require_inputs_of(StageName::Sort).is_ok());
        assert!(files.require_inputs_of(StageName::MergeTable).is_err());

        files.remove_buckets().unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_plan_round_trip_and_mismatch() {
        let dir = TempDir::new().unwrap();
        let files = file_set(dir.path());
        let plan = PartitionPlan::from_parts(31, 2, 3, 20, 12);

        assert!(matches!(
            files.verify_plan(&plan, StageName::Sort),
            Err(Error::MissingStageInput { .. })
        ));

        files.write_plan(&plan).unwrap();
        assert_eq!(files.read_plan().unwrap(), (plan, 2));
        assert_eq!(files.verify_plan(&plan, StageName::Sort).unwrap(), 2);

        let other = PartitionPlan::from_parts(31, 2, 4, 20, 12);
        assert!(matches!(
            files.verify_plan(&other, StageName::Sort),
            Err(Error::PlanMismatch { .. })
        ));

        files.remove_partitions().unwrap();
        assert!(!files.plan_path().exists());
    }
}
