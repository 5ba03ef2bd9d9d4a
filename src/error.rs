//! Typed failure conditions that callers need to tell apart.
//!
//! Everything else travels as plain `anyhow` context; these are wrapped in
//! `anyhow::Error` and recovered with `downcast_ref` where it matters.
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("patch key must be non-empty ({path})")]
    EmptyKey { path: PathBuf },

    #[error("patch key {key:?} not found in {path}")]
    KeyNotFound { path: PathBuf, key: String },
}

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("source does not exist: {0}")]
    MissingSource(PathBuf),

    #[error("destination already exists: {0}")]
    DestinationExists(PathBuf),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{command} failed ({status}) after {elapsed}; see logs")]
    SolverFailed {
        command: String,
        status: String,
        elapsed: String,
    },

    #[error("{stage} stage needs archived {artifact:?} at {path}; run the stage that produces it first")]
    MissingArtifact {
        stage: String,
        artifact: String,
        path: PathBuf,
    },

    #[error("environment script not found: {0}")]
    EnvironmentScriptMissing(PathBuf),
}
