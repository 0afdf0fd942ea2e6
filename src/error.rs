//! Error types for the tuning pipeline.
//!
//! Structural errors (unreadable stores, bad configuration) abort a run before
//! any trial starts. Per-sample errors are skipped by the dataset loader, and a
//! failed trial only removes itself from the ranking.

use std::path::PathBuf;

use thiserror::Error;

use crate::search::TrialConfig;

/// Everything that can go wrong between reading the trace and picking a winner.
#[derive(Error, Debug)]
pub enum TunerError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A trace row that cannot be decoded. Treated like an unreadable store.
    #[error("malformed trace record at {path}:{line}: {message}")]
    TraceFormat {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("invalid chunk data for '{chunk}': {reason}")]
    InvalidData { chunk: String, reason: String },

    #[error("no winner entry for chunk '{0}'")]
    MissingLabel(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("trial {trial_id} failed with {config}: {reason}")]
    TrialFailed {
        trial_id: usize,
        config: TrialConfig,
        reason: String,
    },

    #[error("no viable trial: all {attempted} trials failed")]
    NoViableTrial { attempted: usize },

    #[error("failed to serialize {what}: {message}")]
    Serialization { what: String, message: String },
}

/// Coarse classification of a [`TunerError`], for operator-facing reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    InvalidData,
    MissingLabel,
    InvalidConfiguration,
    TrialFailed,
    NoViableTrial,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Io => "IOError",
            ErrorKind::InvalidData => "InvalidData",
            ErrorKind::MissingLabel => "MissingLabel",
            ErrorKind::InvalidConfiguration => "InvalidConfiguration",
            ErrorKind::TrialFailed => "TrialFailed",
            ErrorKind::NoViableTrial => "NoViableTrial",
        };
        f.write_str(name)
    }
}

impl TunerError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TunerError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        TunerError::InvalidConfiguration(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TunerError::Io { .. } | TunerError::TraceFormat { .. } => ErrorKind::Io,
            TunerError::Serialization { .. } => ErrorKind::Io,
            TunerError::InvalidData { .. } => ErrorKind::InvalidData,
            TunerError::MissingLabel(_) => ErrorKind::MissingLabel,
            TunerError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            TunerError::TrialFailed { .. } => ErrorKind::TrialFailed,
            TunerError::NoViableTrial { .. } => ErrorKind::NoViableTrial,
        }
    }

    /// Returns `true` for errors that only invalidate a single sample.
    #[must_use]
    pub fn is_per_sample(&self) -> bool {
        matches!(
            self,
            TunerError::InvalidData { .. } | TunerError::MissingLabel(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TunerError>;
