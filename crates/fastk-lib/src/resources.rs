//! Open-file budget
//!
//! Split keeps one bucket file open per partition in every worker, and Sort
//! and the merges open several files per thread on top of that. The run needs
//! `(partitions + 2) * threads + baseline` descriptors at once, where the
//! baseline is the lowest descriptor number the process hands out right now
//! (stdio plus whatever the environment already holds open).
//!
//! The budget is checked against the hard limit before any stage starts, and
//! the soft limit is raised to cover it.

use std::fs::{self, File};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use rlimit::Resource;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::plan::PartitionPlan;

/// Descriptors a run needs against what the OS grants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBudget {
    /// Descriptors needed simultaneously
    pub required: u64,
    /// Current soft limit
    pub soft_limit: u64,
    /// Hard limit
    pub hard_limit: u64,
    /// Descriptors already in use when the run was planned
    pub baseline: u64,
}

/// `(partitions + 2) * threads + baseline`
pub fn required_files(partitions: usize, threads: usize, baseline: u64) -> u64 {
    (partitions as u64 + 2) * threads as u64 + baseline
}

impl ResourceBudget {
    /// Budget for `partitions` and `threads` under the given limits
    pub fn new(partitions: usize, threads: usize, baseline: u64, soft_limit: u64, hard_limit: u64) -> Self {
        Self {
            required: required_files(partitions, threads, baseline),
            soft_limit,
            hard_limit,
            baseline,
        }
    }

    /// Fail if the host can never grant the required descriptors
    pub fn check(&self) -> Result<()> {
        if self.required > self.hard_limit {
            return Err(Error::TooManyFiles {
                required: self.required,
                hard_limit: self.hard_limit,
            });
        }
        Ok(())
    }

    /// Whether the soft limit must be raised
    pub fn needs_raise(&self) -> bool {
        self.soft_limit < self.required
    }
}

/// Validates the scratch directory and the descriptor limits of a run
pub struct ResourceGuard {
    scratch_dir: PathBuf,
}

impl ResourceGuard {
    /// Guard over `scratch_dir`, which must be an existing directory.
    ///
    /// Relative paths are resolved against the current directory.
    pub fn new(scratch_dir: &Path) -> Result<Self> {
        Ok(Self {
            scratch_dir: resolve_scratch_dir(scratch_dir)?,
        })
    }

    /// Absolute scratch directory
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Measure the baseline and read the current limits
    pub fn assess(&self, plan: &PartitionPlan, threads: usize) -> Result<ResourceBudget> {
        let baseline = measure_baseline(&self.scratch_dir)?;
        let (soft, hard) = rlimit::getrlimit(Resource::NOFILE).map_err(Error::FileLimit)?;
        let budget = ResourceBudget::new(plan.partition_count, threads, baseline, soft, hard);
        debug!(
            "Open files: need {} (baseline {}), soft limit {}, hard limit {}",
            budget.required, budget.baseline, budget.soft_limit, budget.hard_limit
        );
        Ok(budget)
    }

    /// Check the budget and raise the soft limit for the rest of the process.
    ///
    /// The soft limit is never lowered.
    pub fn ensure(&self, budget: &ResourceBudget) -> Result<()> {
        budget.check()?;
        if !budget.needs_raise() {
            return Ok(());
        }

        rlimit::setrlimit(Resource::NOFILE, budget.required, budget.hard_limit)
            .map_err(Error::FileLimit)?;
        info!(
            "Raised open file limit from {} to {}",
            budget.soft_limit, budget.required
        );
        Ok(())
    }

    /// Assess and ensure in one step
    pub fn secure(&self, plan: &PartitionPlan, threads: usize) -> Result<ResourceBudget> {
        let budget = self.assess(plan, threads)?;
        self.ensure(&budget)?;
        Ok(budget)
    }
}

/// Make `path` absolute and check that it is a readable directory
pub fn resolve_scratch_dir(path: &Path) -> Result<PathBuf> {
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|source| Error::ScratchDirUnavailable {
                path: path.to_path_buf(),
                source,
            })?
            .join(path)
    };

    fs::read_dir(&resolved).map_err(|source| Error::ScratchDirUnavailable {
        path: resolved.clone(),
        source,
    })?;
    Ok(resolved)
}

/// Descriptor number assigned to a throwaway file in `dir`.
///
/// The probe file is closed and removed before returning.
pub fn measure_baseline(dir: &Path) -> Result<u64> {
    let probe = dir.join(format!(".fastk.probe.{}", std::process::id()));
    let fd = {
        let file = File::create(&probe).map_err(|e| Error::io(&probe, e))?;
        file.as_raw_fd()
    };
    fs::remove_file(&probe).map_err(|e| Error::io(&probe, e))?;
    Ok(fd.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_required_files() {
        assert_eq!(required_files(10, 4, 3), 51);
        assert_eq!(required_files(1, 1, 3), 6);
    }

    #[test]
    fn test_budget_over_hard_limit() {
        let budget = ResourceBudget::new(10, 4, 3, 40, 40);
        assert_eq!(budget.required, 51);
        let err = budget.check().unwrap_err();
        assert!(matches!(err, Error::TooManyFiles { required: 51, hard_limit: 40 }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Resource);
    }

    #[test]
    fn test_budget_within_limits() {
        let budget = ResourceBudget::new(10, 4, 3, 20, 1024);
        assert!(budget.check().is_ok());
        assert!(budget.needs_raise());

        let budget = ResourceBudget::new(1, 2, 3, 1024, 4096);
        assert!(!budget.needs_raise());
    }

    #[test]
    fn test_baseline_leaves_no_files() {
        let dir = TempDir::new().unwrap();
        let baseline = measure_baseline(dir.path()).unwrap();
        assert!(baseline >= 3);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_refused_budget_leaves_scratch_empty() {
        let dir = TempDir::new().unwrap();
        let guard = ResourceGuard::new(dir.path()).unwrap();
        let baseline = measure_baseline(guard.scratch_dir()).unwrap();
        let budget = ResourceBudget::new(10, 4, baseline, 40, 40);
        assert!(guard.ensure(&budget).is_err());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_ensure_small_budget() {
        let dir = TempDir::new().unwrap();
        let guard = ResourceGuard::new(dir.path()).unwrap();
        let plan = PartitionPlan::from_parts(21, 2, 1, 11, 11);
        let budget = guard.secure(&plan, 1).unwrap();
        assert_eq!(budget.required, 3 + budget.baseline);
    }

    #[test]
    fn test_scratch_dir_checks() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resolve_scratch_dir(dir.path()).unwrap(), dir.path());
        assert!(resolve_scratch_dir(Path::new(".")).unwrap().is_absolute());

        let missing = dir.path().join("missing");
        let err = resolve_scratch_dir(&missing).unwrap_err();
        assert!(matches!(err, Error::ScratchDirUnavailable { .. }));

        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        assert!(resolve_scratch_dir(&file).is_err());
    }
}
