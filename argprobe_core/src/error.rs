use std::path::PathBuf;
use thiserror::Error;

/// Failures of the isolated execution environment.
///
/// These are the only fatal errors of a fuzzing run: if the sandbox cannot be
/// started, the target cannot be staged, or a run cannot even be spawned, the
/// whole run is aborted and the error surfaces to the caller.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Sandbox unavailable: {0}")]
    Unavailable(String),
}

impl SandboxError {
    pub fn unavailable(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        SandboxError::Unavailable(format!("{context}: {err}"))
    }
}

/// Reasons a trace record written by the probe could not be used.
///
/// Never leaves the oracle client; a `TraceError` degrades the result of a
/// single execution to unknown fields.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Trace file {0:?} is missing or unreadable")]
    Missing(PathBuf),
    #[error("Trace record is malformed: {0}")]
    Malformed(String),
}

/// Violations of the pull protocol of the fuzzing sequence.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SequenceError {
    #[error("A candidate is still waiting for its oracle result")]
    ResultPending,
    #[error("No candidate is waiting for an oracle result")]
    NoPendingCandidate,
}

#[derive(Error, Debug)]
pub enum FuzzError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("Fuzzing sequence misuse: {0}")]
    Sequence(#[from] SequenceError),
}

#[derive(Error, Debug)]
pub enum DictionaryError {
    #[error("Failed to read dictionary at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
