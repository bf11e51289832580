use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::remote::RemoteError;

/// Convenience alias used throughout the crate.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("input not found: {}: {reason}", path.display())]
    InputNotFound { path: PathBuf, reason: String },

    #[error("environment unavailable for stage {stage}: {reason}")]
    EnvironmentUnavailable { stage: String, reason: String },

    #[error("stage {stage} timed out after {timeout_ms}ms")]
    StageTimeout { stage: String, timeout_ms: u64 },

    #[error("stage {stage} exited with status {code}")]
    StageNonZeroExit { stage: String, code: i32 },

    #[error("manifest in invalid state: {0}")]
    ManifestInvalidState(String),

    #[error("cache key mismatch: expected {expected}, found {found}")]
    CacheKeyMismatch { expected: String, found: String },

    #[error("predictor failure: {0}")]
    PredictorFailure(String),

    #[error("stage {stage} exited cleanly but produced no outputs")]
    MissingOutputs { stage: String },

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("job cancelled before stage {0}")]
    Cancelled(String),

    #[error("remote fetch failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Machine-checkable classification of a [`PipelineError`], recorded in
/// manifests next to the human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InputNotFound,
    EnvironmentUnavailable,
    StageTimeout,
    StageNonZeroExit,
    ManifestInvalidState,
    CacheKeyMismatch,
    PredictorFailure,
    MissingOutputs,
    InvalidJob,
    Config,
    Cancelled,
    Remote,
    Io,
    Json,
    Toml,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InputNotFound { .. } => ErrorKind::InputNotFound,
            PipelineError::EnvironmentUnavailable { .. } => ErrorKind::EnvironmentUnavailable,
            PipelineError::StageTimeout { .. } => ErrorKind::StageTimeout,
            PipelineError::StageNonZeroExit { .. } => ErrorKind::StageNonZeroExit,
            PipelineError::ManifestInvalidState(_) => ErrorKind::ManifestInvalidState,
            PipelineError::CacheKeyMismatch { .. } => ErrorKind::CacheKeyMismatch,
            PipelineError::PredictorFailure(_) => ErrorKind::PredictorFailure,
            PipelineError::MissingOutputs { .. } => ErrorKind::MissingOutputs,
            PipelineError::InvalidJob(_) => ErrorKind::InvalidJob,
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::Cancelled(_) => ErrorKind::Cancelled,
            PipelineError::Remote(_) => ErrorKind::Remote,
            PipelineError::Io(_) => ErrorKind::Io,
            PipelineError::Json(_) => ErrorKind::Json,
            PipelineError::Toml(_) => ErrorKind::Toml,
        }
    }

    /// Errors that fail the current stage and halt the job. Everything else
    /// is either recoverable locally or a problem with the job itself.
    pub fn is_stage_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InputNotFound
                | ErrorKind::EnvironmentUnavailable
                | ErrorKind::StageTimeout
                | ErrorKind::StageNonZeroExit
                | ErrorKind::MissingOutputs
        )
    }

    pub fn input_not_found(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        PipelineError::InputNotFound {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
