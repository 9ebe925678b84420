//! Error type shared by the planner, the resource guard and the stages
//!
//! Every variant belongs to one [`ErrorKind`]. Planning errors (usage,
//! validation, resource) are all raised before the Split stage starts.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::StageName;

/// Broad category of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing argument
    Usage,
    /// Input or request is inconsistent; nothing was written
    Validation,
    /// The host cannot provide what the run needs
    Resource,
    /// A pipeline stage failed while running
    Stage,
}

/// Errors raised by fastk
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration value or missing argument
    #[error("{0}")]
    Usage(String),

    /// Reads are too short for the requested k-mer length
    #[error(
        "sequences are on average smaller than 1.5x k-mer size \
         ({total_bases} bases in {num_records} records, k = {k})"
    )]
    ReadsTooShort {
        /// Bases in the sample
        total_bases: u64,
        /// Records in the sample
        num_records: u64,
        /// Requested k-mer length
        k: usize,
    },

    /// The sample contains a symbol outside the nucleotide alphabet
    #[error("{path}: symbol {symbol:?} is not a nucleotide; only DNA input is supported")]
    UnsupportedAlphabet {
        /// Source containing the symbol
        path: PathBuf,
        /// Offending symbol
        symbol: char,
    },

    /// The input holds no sequences
    #[error("no sequences found in the input")]
    EmptyInput,

    /// A table stub was built with another k-mer length
    #[error("table k-mer size ({stored}) != k-mer specified ({requested})")]
    StubKmerMismatch {
        /// K stored in the stub
        stored: i32,
        /// K requested for this run
        requested: usize,
    },

    /// A stub file is malformed or references no data
    #[error("{path}: {reason}")]
    BadStub {
        /// Stub file
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// A stage was requested that the configuration does not enable
    #[error("stage {0} is not enabled by the current options")]
    StageNotEnabled(StageName),

    /// Scratch directory missing or unreadable
    #[error("cannot open scratch directory {path}: {source}")]
    ScratchDirUnavailable {
        /// Resolved scratch path
        path: PathBuf,
        /// Underlying cause
        source: std::io::Error,
    },

    /// More simultaneously open files are needed than the OS allows
    #[error("cannot open {required} files simultaneously (hard limit is {hard_limit})")]
    TooManyFiles {
        /// Descriptors the run needs
        required: u64,
        /// OS hard limit
        hard_limit: u64,
    },

    /// Querying or raising the descriptor limit failed
    #[error("failed to adjust the open file limit: {0}")]
    FileLimit(#[source] std::io::Error),

    /// A single-stage run found its prerequisite files missing
    #[error("stage {stage} needs {path}, which does not exist; run the earlier stages first")]
    MissingStageInput {
        /// Stage being started
        stage: StageName,
        /// First missing file
        path: PathBuf,
    },

    /// Scratch files were written with a different layout
    #[error("{path} was written with a different partition plan; rerun the full pipeline")]
    PlanMismatch {
        /// Persisted plan file
        path: PathBuf,
    },

    /// A file does not have the expected binary layout
    #[error("{path}: {reason}")]
    Corrupt {
        /// File that failed to decode
        path: PathBuf,
        /// What was wrong
        reason: String,
    },

    /// Sequence file could not be parsed
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Source being parsed
        path: PathBuf,
        /// Parser error
        source: needletail::errors::ParseError,
    },

    /// I/O failure on a specific file
    #[error("{path}: {source}")]
    Io {
        /// File the operation concerned
        path: PathBuf,
        /// Underlying cause
        source: std::io::Error,
    },

    /// A worker thread panicked
    #[error("a {0} worker thread panicked")]
    WorkerPanicked(StageName),

    /// Thread pool could not be created
    #[error("failed to create thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl Error {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Usage(_) => ErrorKind::Usage,
            Error::ReadsTooShort { .. }
            | Error::UnsupportedAlphabet { .. }
            | Error::EmptyInput
            | Error::StubKmerMismatch { .. }
            | Error::BadStub { .. }
            | Error::StageNotEnabled(_)
            | Error::PlanMismatch { .. } => ErrorKind::Validation,
            Error::ScratchDirUnavailable { .. }
            | Error::TooManyFiles { .. }
            | Error::FileLimit(_)
            | Error::MissingStageInput { .. } => ErrorKind::Resource,
            Error::Corrupt { .. }
            | Error::Parse { .. }
            | Error::Io { .. }
            | Error::WorkerPanicked(_)
            | Error::ThreadPool(_) => ErrorKind::Stage,
        }
    }

    /// Wrap an I/O error with the path it concerns
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Report a file whose content does not decode
    pub fn corrupt(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Error::Corrupt {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(Error::Usage("x".into()).kind(), ErrorKind::Usage);
        assert_eq!(Error::EmptyInput.kind(), ErrorKind::Validation);
        assert_eq!(
            Error::TooManyFiles { required: 43, hard_limit: 40 }.kind(),
            ErrorKind::Resource
        );
        assert_eq!(Error::WorkerPanicked(StageName::Sort).kind(), ErrorKind::Stage);
    }

    #[test]
    fn test_messages() {
        let err = Error::TooManyFiles { required: 43, hard_limit: 40 };
        assert_eq!(
            err.to_string(),
            "cannot open 43 files simultaneously (hard limit is 40)"
        );

        let err = Error::StubKmerMismatch { stored: 31, requested: 40 };
        assert_eq!(err.to_string(), "table k-mer size (31) != k-mer specified (40)");
    }
}
